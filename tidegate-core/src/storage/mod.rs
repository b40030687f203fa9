//! Piece storage for torrent content.
//!
//! Pieces are written under a [`StorageKey`]. Uploads stage their pieces under
//! a random key until the info hash is known, then [`PieceStorage::finalize`]
//! moves them under the hash. Readers only ever see completed pieces.

pub mod file_storage;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
pub use file_storage::FileStorage;
pub use memory::MemoryStorage;
use uuid::Uuid;

use crate::torrent::{InfoHash, PieceIndex};

/// Namespace a set of pieces is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    Torrent(InfoHash),
    /// Upload in progress whose info hash is not known yet.
    Staging(Uuid),
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::Torrent(info_hash) => write!(f, "{info_hash}"),
            StorageKey::Staging(id) => write!(f, "staging-{id}"),
        }
    }
}

/// Storage backend shared by all torrents.
#[async_trait]
pub trait PieceStorage: Send + Sync {
    /// Opens the piece store for one key. Does no I/O until used.
    fn open(&self, key: StorageKey) -> Box<dyn TorrentStorage>;

    /// Moves staged pieces under their final info hash, replacing anything
    /// already stored for that hash.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If file system operation failed
    async fn finalize(&self, staging: Uuid, info_hash: InfoHash) -> Result<(), StorageError>;

    /// Deletes every piece stored under `key`. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If file system operation failed
    async fn remove(&self, key: StorageKey) -> Result<(), StorageError>;
}

/// Pieces of a single torrent or staged upload.
#[async_trait]
pub trait TorrentStorage: Send + Sync {
    /// Writes piece data. The piece stays invisible to readers until
    /// [`TorrentStorage::mark_complete`] succeeds.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If file system operation failed
    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError>;

    /// Marks a written piece complete.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceNotFound` - Piece was never written
    /// - `StorageError::Io` - If file system operation failed
    async fn mark_complete(&self, index: PieceIndex) -> Result<(), StorageError>;

    /// Returns a completed piece, or `None` if it is not complete.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If file system operation failed
    async fn read_piece(&self, index: PieceIndex) -> Result<Option<Bytes>, StorageError>;

    async fn is_complete(&self, index: PieceIndex) -> Result<bool, StorageError>;

    /// Releases handles. Pieces remain stored.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If flushing failed
    async fn close(&self) -> Result<(), StorageError>;
}

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Piece has not been written yet
    #[error("Piece {index} not found")]
    PieceNotFound { index: PieceIndex },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
pub(crate) fn create_test_info_hash() -> InfoHash {
    InfoHash::new([
        0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd,
        0xef, 0x01, 0x23, 0x45, 0x67,
    ])
}
