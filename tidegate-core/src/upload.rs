//! Torrent creation from uploaded files.
//!
//! Files are streamed once, concatenated in order, and cut into pieces. Each
//! piece goes to two consumer tasks over bounded channels: one hashes it, the
//! other writes it to storage and marks it complete. The slower consumer
//! throttles the reader. Pieces are staged under a random key and moved under
//! the info hash once hashing has finished.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use uuid::Uuid;

use crate::storage::{PieceStorage, StorageError, StorageKey, TorrentStorage};
use crate::torrent::{Info, InfoHash, PieceIndex, choose_piece_length, hash_piece};

/// Errors that abort an upload. Staged pieces are removed when one occurs.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Upload has no files")]
    NoFiles,

    #[error("Reading {path:?} failed: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("File {path:?} ended after {actual} of {expected} bytes")]
    ShortFile {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Storing piece {index} failed: {source}")]
    Storage {
        index: PieceIndex,
        #[source]
        source: StorageError,
    },

    #[error("Moving staged pieces failed: {0}")]
    Finalize(#[source] StorageError),

    #[error("Piece consumer stopped early")]
    PipeClosed,

    #[error("Upload task failed: {0}")]
    Task(#[from] JoinError),
}

/// One uploaded file.
pub struct UploadFile {
    /// Path components inside the torrent
    pub path: Vec<String>,
    /// Declared length. The reader must supply at least this many bytes.
    pub length: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl UploadFile {
    pub fn new(path: Vec<String>, length: u64, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            path,
            length,
            reader: Box::new(reader),
        }
    }

    fn display_path(&self) -> String {
        self.path.join("/")
    }
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("path", &self.path)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Files to turn into one torrent.
#[derive(Debug)]
pub struct UploadJob {
    pub name: String,
    pub files: Vec<UploadFile>,
    /// Drop the first path component of files nested in a directory
    pub strip_top_directory: bool,
    /// Fixed piece length. Chosen from the total length when `None`.
    pub piece_length: Option<u64>,
}

impl UploadJob {
    pub fn new(name: impl Into<String>, files: Vec<UploadFile>) -> Self {
        Self {
            name: name.into(),
            files,
            strip_top_directory: false,
            piece_length: None,
        }
    }

    fn file_table(&self) -> Vec<(Vec<String>, u64)> {
        self.files
            .iter()
            .map(|file| {
                let path = if self.strip_top_directory && file.path.len() > 1 {
                    file.path[1..].to_vec()
                } else {
                    file.path.clone()
                };
                (path, file.length)
            })
            .collect()
    }
}

/// Result of a successful upload. Pieces are stored under `info_hash`.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub info: Info,
    pub info_bytes: Vec<u8>,
    pub info_hash: InfoHash,
}

/// Hashes and stores uploads in a single pass.
#[derive(Clone)]
pub struct UploadPipeline {
    storage: Arc<dyn PieceStorage>,
    pipe_capacity: usize,
}

impl UploadPipeline {
    /// `pipe_capacity` is the number of pieces each consumer may lag behind
    /// the reader.
    pub fn new(storage: Arc<dyn PieceStorage>, pipe_capacity: usize) -> Self {
        Self {
            storage,
            pipe_capacity: pipe_capacity.max(1),
        }
    }

    /// Streams the job's files into a new torrent.
    ///
    /// # Errors
    /// - `UploadError::NoFiles` - Job has no files
    /// - `UploadError::Read` / `UploadError::ShortFile` - An input stream failed
    /// - `UploadError::Storage` / `UploadError::Finalize` - Storage failed
    pub async fn run(&self, job: UploadJob) -> Result<UploadOutcome, UploadError> {
        if job.files.is_empty() {
            return Err(UploadError::NoFiles);
        }
        let file_table = job.file_table();
        let total_length: u64 = file_table.iter().map(|(_, length)| length).sum();
        let piece_length = job
            .piece_length
            .unwrap_or_else(|| choose_piece_length(total_length));
        let staging = Uuid::new_v4();
        tracing::debug!(
            "Uploading {:?}: {} files, {} bytes, piece length {}, staging {}",
            job.name,
            file_table.len(),
            total_length,
            piece_length,
            staging
        );

        match self.stream_pieces(job.files, piece_length, staging).await {
            Ok(pieces) => {
                let info = Info::multi_file(job.name, piece_length, pieces, file_table);
                let info_bytes = info.to_bytes();
                let info_hash = InfoHash::from_info_bytes(&info_bytes);
                if let Err(e) = self.storage.finalize(staging, info_hash).await {
                    self.discard_staging(staging).await;
                    return Err(UploadError::Finalize(e));
                }
                tracing::info!(
                    "Upload {:?} stored as {} ({} pieces)",
                    info.name,
                    info_hash,
                    info.piece_count()
                );
                Ok(UploadOutcome {
                    info,
                    info_bytes,
                    info_hash,
                })
            }
            Err(e) => {
                self.discard_staging(staging).await;
                Err(e)
            }
        }
    }

    async fn discard_staging(&self, staging: Uuid) {
        if let Err(e) = self.storage.remove(StorageKey::Staging(staging)).await {
            tracing::error!("Removing staged upload {} failed: {}", staging, e);
        }
    }

    /// Returns the piece hashes once every piece is stored.
    async fn stream_pieces(
        &self,
        files: Vec<UploadFile>,
        piece_length: u64,
        staging: Uuid,
    ) -> Result<Vec<[u8; 20]>, UploadError> {
        let (hash_tx, hash_rx) = mpsc::channel::<Bytes>(self.pipe_capacity);
        let (store_tx, store_rx) = mpsc::channel::<Bytes>(self.pipe_capacity);
        let pieces: Arc<dyn TorrentStorage> = Arc::from(self.storage.open(StorageKey::Staging(staging)));

        let hasher = tokio::spawn(hash_pieces(hash_rx));
        let writer = tokio::spawn(store_pieces(store_rx, pieces));

        let produced = produce_pieces(files, piece_length, &hash_tx, &store_tx).await;
        drop(hash_tx);
        drop(store_tx);

        let stored = writer.await?;
        let hashes = hasher.await?;
        stored?;
        let piece_count = produced?;
        debug_assert_eq!(piece_count as usize, hashes.len());
        Ok(hashes)
    }
}

impl std::fmt::Debug for UploadPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPipeline")
            .field("pipe_capacity", &self.pipe_capacity)
            .finish_non_exhaustive()
    }
}

/// Reads all files in order and sends each full piece, plus the final short
/// one, to both consumers. Returns the number of pieces sent.
async fn produce_pieces(
    files: Vec<UploadFile>,
    piece_length: u64,
    hash_tx: &mpsc::Sender<Bytes>,
    store_tx: &mpsc::Sender<Bytes>,
) -> Result<u32, UploadError> {
    let mut piece = vec![0u8; piece_length as usize];
    let mut filled = 0usize;
    let mut sent = 0u32;

    for file in files {
        let path = file.display_path();
        let mut reader = file.reader.take(file.length);
        let mut consumed = 0u64;
        loop {
            let n = reader
                .read(&mut piece[filled..])
                .await
                .map_err(|source| UploadError::Read {
                    path: path.clone(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            filled += n;
            consumed += n as u64;
            if filled == piece.len() {
                send_piece(Bytes::copy_from_slice(&piece), hash_tx, store_tx).await?;
                filled = 0;
                sent += 1;
            }
        }
        if consumed < file.length {
            return Err(UploadError::ShortFile {
                path,
                expected: file.length,
                actual: consumed,
            });
        }
    }

    if filled > 0 {
        send_piece(Bytes::copy_from_slice(&piece[..filled]), hash_tx, store_tx).await?;
        sent += 1;
    }
    Ok(sent)
}

async fn send_piece(
    piece: Bytes,
    hash_tx: &mpsc::Sender<Bytes>,
    store_tx: &mpsc::Sender<Bytes>,
) -> Result<(), UploadError> {
    hash_tx
        .send(piece.clone())
        .await
        .map_err(|_| UploadError::PipeClosed)?;
    store_tx
        .send(piece)
        .await
        .map_err(|_| UploadError::PipeClosed)
}

async fn hash_pieces(mut pieces: mpsc::Receiver<Bytes>) -> Vec<[u8; 20]> {
    let mut hashes = Vec::new();
    while let Some(piece) = pieces.recv().await {
        hashes.push(hash_piece(&piece));
    }
    hashes
}

async fn store_pieces(
    mut pieces: mpsc::Receiver<Bytes>,
    storage: Arc<dyn TorrentStorage>,
) -> Result<(), UploadError> {
    let mut index = PieceIndex::new(0);
    while let Some(piece) = pieces.recv().await {
        storage
            .write_piece(index, &piece)
            .await
            .map_err(|source| UploadError::Storage { index, source })?;
        storage
            .mark_complete(index)
            .await
            .map_err(|source| UploadError::Storage { index, source })?;
        index = PieceIndex::new(index.as_u32() + 1);
    }
    storage
        .close()
        .await
        .map_err(|source| UploadError::Storage { index, source })
}
