//! Content streaming primitives.
//!
//! A request for torrent content waits for the info, resolves the requested
//! file to a byte range, and reads that range through a reader that blocks on
//! missing pieces. Range semantics (status codes, `Content-Range`) belong to
//! the HTTP layer; this module only supplies a correctly scoped reader that
//! gives up when the request is cancelled.

use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::engine::{Torrent, TorrentReader};
use crate::torrent::{Info, InfoHash, TorrentError};

/// Errors while preparing or serving torrent content.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Request cancelled")]
    Cancelled,

    #[error("File {path:?} not found in torrent")]
    FileNotFound { path: String },

    #[error("Info for {info_hash} is not available yet")]
    NotReady { info_hash: InfoHash },

    #[error("Torrent {info_hash} was dropped")]
    TorrentClosed { info_hash: InfoHash },

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Waits until the torrent's info is known.
///
/// # Errors
/// - `StreamError::Cancelled` - `cancel` fired first
/// - `StreamError::TorrentClosed` - Torrent was dropped while waiting
pub async fn wait_for_info(
    torrent: &dyn Torrent,
    cancel: &CancellationToken,
) -> Result<Arc<Info>, StreamError> {
    if let Some(info) = torrent.info() {
        return Ok(info);
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::debug!("Gave up waiting for info of {}", torrent.info_hash());
            return Err(StreamError::Cancelled);
        }
        () = torrent.info_ready() => {}
    }
    ready_info(torrent)
}

/// Info if already known, without waiting.
///
/// # Errors
/// - `StreamError::NotReady` - Info has not arrived
/// - `StreamError::TorrentClosed` - Torrent was dropped
pub fn ready_info(torrent: &dyn Torrent) -> Result<Arc<Info>, StreamError> {
    let info_hash = torrent.info_hash();
    if torrent.is_closed() {
        return Err(StreamError::TorrentClosed { info_hash });
    }
    torrent.info().ok_or(StreamError::NotReady { info_hash })
}

/// Byte range of the torrent's content to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRange {
    pub offset: u64,
    pub length: u64,
    /// Torrent name for the whole content, display path for a single file.
    pub name: String,
}

/// Maps a requested path to a byte range. No path, or an empty one, selects
/// the whole content.
///
/// # Errors
/// - `StreamError::FileNotFound` - No file has exactly this display path
pub fn resolve(info: &Info, path: Option<&str>) -> Result<ContentRange, StreamError> {
    match path.filter(|p| !p.is_empty()) {
        None => Ok(ContentRange {
            offset: 0,
            length: info.total_length(),
            name: info.name.clone(),
        }),
        Some(path) => {
            let file = info.file(path).ok_or_else(|| StreamError::FileNotFound {
                path: path.to_string(),
            })?;
            Ok(ContentRange {
                offset: file.offset,
                length: file.length,
                name: file.display_path(),
            })
        }
    }
}

/// Reader confined to `[offset, offset + length)` of an inner reader.
///
/// Positions are relative to the section start. Reads past the section end
/// return EOF even if the inner reader has more data.
pub struct SectionReader<R> {
    inner: R,
    offset: u64,
    length: u64,
    position: u64,
}

impl<R: AsyncRead + AsyncSeek + Unpin> SectionReader<R> {
    /// Seeks `inner` to `offset` and wraps it.
    ///
    /// # Errors
    /// Propagates the inner seek error.
    pub async fn new(mut inner: R, offset: u64, length: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(offset)).await?;
        Ok(Self {
            inner,
            offset,
            length,
            position: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SectionReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let remaining = this.length.saturating_sub(this.position);
        if remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let max = remaining.min(buf.remaining() as u64) as usize;
        let dst = buf.initialize_unfilled_to(max);
        let mut limited = ReadBuf::new(dst);
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
        let n = limited.filled().len();
        buf.advance(n);
        this.position += n as u64;
        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncSeek + Unpin> AsyncSeek for SectionReader<R> {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        let target = match position {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => this.length.checked_add_signed(delta),
            SeekFrom::Current(delta) => this.position.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        let absolute = this.offset.checked_add(target).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek past the addressable range")
        })?;
        Pin::new(&mut this.inner).start_seek(SeekFrom::Start(absolute))?;
        this.position = target;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_complete(cx))?;
        Poll::Ready(Ok(this.position))
    }
}

/// Fails pending and future reads once `cancel` fires.
pub struct CancellableReader<R> {
    inner: R,
    cancel: CancellationToken,
    cancelled: BoxFuture<'static, ()>,
}

impl<R> CancellableReader<R> {
    pub fn new(inner: R, cancel: CancellationToken) -> Self {
        let cancelled = Box::pin(cancel.clone().cancelled_owned());
        Self {
            inner,
            cancel,
            cancelled,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        if self.cancel.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready() {
            Poll::Ready(cancelled_error())
        } else {
            Poll::Pending
        }
    }
}

/// Error returned by reads interrupted by request cancellation.
pub fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, StreamError::Cancelled)
}

/// True if `error` came from a cancelled [`CancellableReader`].
pub fn is_cancelled_error(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::ConnectionAborted
        && error
            .get_ref()
            .is_some_and(|inner| inner.downcast_ref::<StreamError>().is_some())
}

impl<R: AsyncRead + Unpin> AsyncRead for CancellableReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(cancelled_error()));
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => this.poll_cancelled(cx).map(Err),
        }
    }
}

impl<R: AsyncSeek + Unpin> AsyncSeek for CancellableReader<R> {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Err(cancelled_error());
        }
        Pin::new(&mut this.inner).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_complete(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => this.poll_cancelled(cx).map(Err),
        }
    }
}

/// Reader type handed to the HTTP layer.
pub type ContentReader = CancellableReader<SectionReader<Box<dyn TorrentReader>>>;

/// Content ready to be served.
pub struct ContentSource {
    pub range: ContentRange,
    pub reader: ContentReader,
}

/// Whether to block until the torrent's info arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoWait {
    Block,
    NoWait,
}

/// Opens a cancellable reader over the requested file or whole content.
///
/// # Errors
/// - `StreamError::NotReady` - Info unknown and `wait` is `NoWait`
/// - `StreamError::Cancelled` - `cancel` fired while waiting for info
/// - `StreamError::FileNotFound` - Path not in the file table
/// - `StreamError::Torrent` - Reader could not be opened
pub async fn open_content(
    torrent: &dyn Torrent,
    path: Option<&str>,
    wait: InfoWait,
    cancel: &CancellationToken,
) -> Result<ContentSource, StreamError> {
    let info = match wait {
        InfoWait::Block => wait_for_info(torrent, cancel).await?,
        InfoWait::NoWait => ready_info(torrent)?,
    };
    let range = resolve(&info, path)?;
    let reader = torrent.new_reader()?;
    let section = SectionReader::new(reader, range.offset, range.length).await?;
    Ok(ContentSource {
        range,
        reader: CancellableReader::new(section, cancel.clone()),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::engine::{LocalEngine, TorrentEngine};
    use crate::storage::MemoryStorage;
    use crate::test_fixtures::TorrentFixture;

    fn fixture() -> TorrentFixture {
        TorrentFixture::multi_file("show", 16, &[("s01/e01.mkv", 20), ("s01/e02.mkv", 30)])
    }

    #[test]
    fn test_resolve_whole_and_single_file() {
        let fixture = fixture();
        let whole = resolve(&fixture.info, None).unwrap();
        assert_eq!((whole.offset, whole.length), (0, 50));
        assert_eq!(whole.name, "show");
        assert_eq!(resolve(&fixture.info, Some("")).unwrap(), whole);

        let second = resolve(&fixture.info, Some("s01/e02.mkv")).unwrap();
        assert_eq!((second.offset, second.length), (20, 30));
        assert_eq!(second.name, "s01/e02.mkv");

        assert!(matches!(
            resolve(&fixture.info, Some("s01/e03.mkv")),
            Err(StreamError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_section_reader_confined_to_range() {
        let data: Vec<u8> = (0..100).collect();
        let mut section = SectionReader::new(Cursor::new(data), 10, 20).await.unwrap();

        let mut out = Vec::new();
        section.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, (10..30).collect::<Vec<u8>>());

        assert_eq!(section.seek(SeekFrom::End(-5)).await.unwrap(), 15);
        let mut tail = Vec::new();
        section.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, (25..30).collect::<Vec<u8>>());

        assert!(section.seek(SeekFrom::Current(-100)).await.is_err());
        let err = section.seek(SeekFrom::Start(u64::MAX)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_info() {
        let engine = LocalEngine::new(Arc::new(MemoryStorage::new()));
        let (torrent, _) = engine.add_info_hash(InfoHash::new([1; 20]));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_info(torrent.as_ref(), &cancel),
        )
        .await
        .expect("wait returns once cancelled");
        assert!(matches!(result, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn test_no_wait_reports_not_ready() {
        let engine = LocalEngine::new(Arc::new(MemoryStorage::new()));
        let (torrent, _) = engine.add_info_hash(InfoHash::new([2; 20]));
        let result = open_content(
            torrent.as_ref(),
            None,
            InfoWait::NoWait,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(StreamError::NotReady { .. })));
    }

    #[tokio::test]
    async fn test_open_content_reads_one_file() {
        let fixture = fixture();
        let storage = MemoryStorage::new();
        fixture.store_all(&storage).await;
        let engine = LocalEngine::new(Arc::new(storage));
        let (torrent, _) = engine.add_info_hash(fixture.info_hash);
        torrent.set_info_bytes(&fixture.info_bytes).unwrap();

        let mut source = open_content(
            torrent.as_ref(),
            Some("s01/e02.mkv"),
            InfoWait::Block,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut out = Vec::new();
        source.reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, fixture.content[20..50].to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_read_of_missing_piece() {
        let fixture = fixture();
        let engine = LocalEngine::new(Arc::new(MemoryStorage::new()));
        let (torrent, _) = engine.add_info_hash(fixture.info_hash);
        torrent.set_info_bytes(&fixture.info_bytes).unwrap();

        let cancel = CancellationToken::new();
        let mut source = open_content(torrent.as_ref(), None, InfoWait::Block, &cancel)
            .await
            .unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let mut buf = [0u8; 8];
        let err = tokio::time::timeout(Duration::from_secs(5), source.reader.read(&mut buf))
            .await
            .expect("read returns once cancelled")
            .unwrap_err();
        assert!(is_cancelled_error(&err));
    }
}
