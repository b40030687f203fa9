//! Seekable reader over a [`LocalTorrent`]'s content

use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

use super::local::LocalTorrent;
use crate::torrent::{Info, PieceIndex};

/// Reads a torrent's concatenated content piece by piece.
///
/// A read that reaches an incomplete piece waits for it. The most recently
/// fetched piece is kept so sequential reads fetch each piece once.
pub struct LocalTorrentReader {
    torrent: Arc<LocalTorrent>,
    info: Arc<Info>,
    position: u64,
    current: Option<(u32, Bytes)>,
    pending: Option<(u32, BoxFuture<'static, io::Result<Bytes>>)>,
}

impl LocalTorrentReader {
    pub(crate) fn new(torrent: Arc<LocalTorrent>, info: Arc<Info>) -> Self {
        Self {
            torrent,
            info,
            position: 0,
            current: None,
            pending: None,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl AsyncRead for LocalTorrentReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.position >= this.info.total_length() || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let index = this.info.piece_at(this.position).as_u32();
        loop {
            if let Some((current_index, data)) = &this.current
                && *current_index == index
            {
                let piece_start = u64::from(index) * this.info.piece_length;
                let offset = (this.position - piece_start) as usize;
                let available = data.get(offset..).unwrap_or_default();
                if available.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("piece {index} is shorter than expected"),
                    )));
                }
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.position += n as u64;
                return Poll::Ready(Ok(()));
            }

            if this.pending.as_ref().is_some_and(|(i, _)| *i != index) {
                this.pending = None;
            }
            let (_, fetch) = this.pending.get_or_insert_with(|| {
                let torrent = Arc::clone(&this.torrent);
                let fetch: BoxFuture<'static, io::Result<Bytes>> =
                    Box::pin(torrent.wait_for_piece(PieceIndex::new(index)));
                (index, fetch)
            });

            match fetch.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    this.pending = None;
                    this.current = Some((index, result?));
                }
            }
        }
    }
}

impl AsyncSeek for LocalTorrentReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        let target = match position {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => this.info.total_length().checked_add_signed(delta),
            SeekFrom::Current(delta) => this.position.checked_add_signed(delta),
        };
        this.position = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    use crate::engine::{LocalEngine, TorrentEngine};
    use crate::storage::MemoryStorage;
    use crate::test_fixtures::TorrentFixture;

    #[tokio::test]
    async fn test_reads_span_piece_boundaries() {
        let storage = MemoryStorage::new();
        let fixture = TorrentFixture::multi_file("dir", 16, &[("a", 10), ("b", 25)]);
        fixture.store_all(&storage).await;
        let engine = LocalEngine::new(std::sync::Arc::new(storage));
        let (torrent, _) = engine.add_info_hash(fixture.info_hash);
        torrent.set_info_bytes(&fixture.info_bytes).unwrap();

        let mut reader = torrent.new_reader().unwrap();
        reader.seek(std::io::SeekFrom::Start(12)).await.unwrap();
        let mut buf = vec![0u8; 10];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, fixture.content[12..22].to_vec());

        let end = reader.seek(std::io::SeekFrom::End(-3)).await.unwrap();
        assert_eq!(end, 32);
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, fixture.content[32..].to_vec());
    }

    #[tokio::test]
    async fn test_seek_before_start_fails() {
        let storage = MemoryStorage::new();
        let fixture = TorrentFixture::single_file("a", 16, 20);
        let engine = LocalEngine::new(std::sync::Arc::new(storage));
        let (torrent, _) = engine.add_info_hash(fixture.info_hash);
        torrent.set_info_bytes(&fixture.info_bytes).unwrap();

        let mut reader = torrent.new_reader().unwrap();
        assert!(reader.seek(std::io::SeekFrom::Current(-1)).await.is_err());
    }
}
