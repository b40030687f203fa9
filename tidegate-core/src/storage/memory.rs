//! In-memory piece storage for tests and ephemeral deployments

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{PieceStorage, StorageError, StorageKey, TorrentStorage};
use crate::torrent::{InfoHash, PieceIndex};

#[derive(Debug, Default)]
struct StoredPiece {
    data: Bytes,
    complete: bool,
}

type Pieces = HashMap<u32, StoredPiece>;

/// Piece storage backed by a shared map. Cloning shares the contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    keys: Arc<RwLock<HashMap<StorageKey, Pieces>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed pieces stored under `key`.
    pub fn completed_count(&self, key: StorageKey) -> usize {
        self.keys
            .read()
            .get(&key)
            .map(|pieces| pieces.values().filter(|p| p.complete).count())
            .unwrap_or(0)
    }

    pub fn contains_key(&self, key: StorageKey) -> bool {
        self.keys.read().contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[async_trait]
impl PieceStorage for MemoryStorage {
    fn open(&self, key: StorageKey) -> Box<dyn TorrentStorage> {
        Box::new(MemoryTorrentStorage {
            key,
            keys: Arc::clone(&self.keys),
        })
    }

    async fn finalize(&self, staging: Uuid, info_hash: InfoHash) -> Result<(), StorageError> {
        let mut keys = self.keys.write();
        let staged = keys.remove(&StorageKey::Staging(staging)).unwrap_or_default();
        let existing = keys.entry(StorageKey::Torrent(info_hash)).or_default();
        for (index, piece) in staged {
            let slot = existing.entry(index).or_default();
            if !slot.complete {
                *slot = piece;
            }
        }
        Ok(())
    }

    async fn remove(&self, key: StorageKey) -> Result<(), StorageError> {
        self.keys.write().remove(&key);
        Ok(())
    }
}

struct MemoryTorrentStorage {
    key: StorageKey,
    keys: Arc<RwLock<HashMap<StorageKey, Pieces>>>,
}

#[async_trait]
impl TorrentStorage for MemoryTorrentStorage {
    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        self.keys.write().entry(self.key).or_default().insert(
            index.as_u32(),
            StoredPiece {
                data: Bytes::copy_from_slice(data),
                complete: false,
            },
        );
        Ok(())
    }

    async fn mark_complete(&self, index: PieceIndex) -> Result<(), StorageError> {
        let mut keys = self.keys.write();
        let piece = keys
            .get_mut(&self.key)
            .and_then(|pieces| pieces.get_mut(&index.as_u32()))
            .ok_or(StorageError::PieceNotFound { index })?;
        piece.complete = true;
        Ok(())
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Option<Bytes>, StorageError> {
        Ok(self
            .keys
            .read()
            .get(&self.key)
            .and_then(|pieces| pieces.get(&index.as_u32()))
            .filter(|piece| piece.complete)
            .map(|piece| piece.data.clone()))
    }

    async fn is_complete(&self, index: PieceIndex) -> Result<bool, StorageError> {
        Ok(self.read_piece(index).await?.is_some())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
