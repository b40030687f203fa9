//! Directory-per-key piece storage on the local file system

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use uuid::Uuid;

use super::{PieceStorage, StorageError, StorageKey, TorrentStorage};
use crate::torrent::{InfoHash, PieceIndex};

/// File system-based storage implementation.
///
/// Each key gets its own directory under `root`. A piece is first written to
/// `piece_<n>.part` and renamed to `piece_<n>` when marked complete, so a
/// crash never exposes partial data.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: StorageKey) -> PathBuf {
        self.root.join(key.to_string())
    }
}

#[async_trait]
impl PieceStorage for FileStorage {
    fn open(&self, key: StorageKey) -> Box<dyn TorrentStorage> {
        Box::new(FileTorrentStorage {
            dir: self.key_dir(key),
        })
    }

    async fn finalize(&self, staging: Uuid, info_hash: InfoHash) -> Result<(), StorageError> {
        let staging_key = StorageKey::Staging(staging);
        let staging_dir = self.key_dir(staging_key);
        let final_dir = self.key_dir(StorageKey::Torrent(info_hash));

        if !fs::try_exists(&staging_dir).await? {
            // Zero-length uploads never write a piece.
            fs::create_dir_all(&staging_dir).await?;
        }
        if !fs::try_exists(&final_dir).await? {
            match fs::rename(&staging_dir, &final_dir).await {
                Ok(()) => return Ok(()),
                // Lost a race with a writer creating the directory.
                Err(_) if fs::try_exists(&final_dir).await? => {}
                Err(e) => return Err(e.into()),
            }
        }
        merge_pieces(&staging_dir, &final_dir).await?;
        fs::remove_dir_all(&staging_dir).await?;
        Ok(())
    }

    async fn remove(&self, key: StorageKey) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.key_dir(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Moves completed pieces from `from` into `to`, keeping pieces `to`
/// already has. Each move is a single rename, so readers of `to` never see
/// a piece disappear.
async fn merge_pieces(from: &Path, to: &Path) -> Result<(), StorageError> {
    let mut entries = fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let is_piece = name
            .to_str()
            .is_some_and(|name| name.starts_with("piece_") && !name.ends_with(".part"));
        if !is_piece {
            continue;
        }
        let target = to.join(&name);
        if !fs::try_exists(&target).await? {
            fs::rename(entry.path(), target).await?;
        }
    }
    Ok(())
}

struct FileTorrentStorage {
    dir: PathBuf,
}

impl FileTorrentStorage {
    fn piece_path(&self, index: PieceIndex) -> PathBuf {
        self.dir.join(format!("piece_{}", index.as_u32()))
    }

    fn partial_path(&self, index: PieceIndex) -> PathBuf {
        self.dir.join(format!("piece_{}.part", index.as_u32()))
    }
}

#[async_trait]
impl TorrentStorage for FileTorrentStorage {
    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.partial_path(index), data).await?;
        Ok(())
    }

    async fn mark_complete(&self, index: PieceIndex) -> Result<(), StorageError> {
        match fs::rename(self.partial_path(index), self.piece_path(index)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::PieceNotFound { index }),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Option<Bytes>, StorageError> {
        match fs::read(self.piece_path(index)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_complete(&self, index: PieceIndex) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.piece_path(index)).await?)
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::storage::create_test_info_hash;

    #[tokio::test]
    async fn test_piece_hidden_until_marked_complete() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());
        let pieces = storage.open(StorageKey::Torrent(create_test_info_hash()));

        pieces.write_piece(PieceIndex::new(0), b"hello").await.unwrap();
        assert_eq!(pieces.read_piece(PieceIndex::new(0)).await.unwrap(), None);
        assert!(!pieces.is_complete(PieceIndex::new(0)).await.unwrap());

        pieces.mark_complete(PieceIndex::new(0)).await.unwrap();
        assert_eq!(
            pieces.read_piece(PieceIndex::new(0)).await.unwrap().unwrap(),
            Bytes::from_static(b"hello")
        );
    }

    #[tokio::test]
    async fn test_mark_complete_without_write_fails() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());
        let pieces = storage.open(StorageKey::Torrent(create_test_info_hash()));
        let result = pieces.mark_complete(PieceIndex::new(3)).await;
        assert!(matches!(result, Err(StorageError::PieceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_finalize_moves_staged_pieces() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());
        let staging = Uuid::new_v4();
        let info_hash = create_test_info_hash();

        let staged = storage.open(StorageKey::Staging(staging));
        staged.write_piece(PieceIndex::new(1), b"data").await.unwrap();
        staged.mark_complete(PieceIndex::new(1)).await.unwrap();

        storage.finalize(staging, info_hash).await.unwrap();

        let final_pieces = storage.open(StorageKey::Torrent(info_hash));
        assert!(final_pieces.is_complete(PieceIndex::new(1)).await.unwrap());
        assert!(!temp_dir.path().join(format!("staging-{staging}")).exists());
    }

    #[tokio::test]
    async fn test_finalize_onto_existing_torrent_keeps_pieces_readable() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());
        let info_hash = create_test_info_hash();
        let final_pieces = storage.open(StorageKey::Torrent(info_hash));

        let first = Uuid::new_v4();
        let staged = storage.open(StorageKey::Staging(first));
        staged.write_piece(PieceIndex::new(0), b"zero").await.unwrap();
        staged.mark_complete(PieceIndex::new(0)).await.unwrap();
        storage.finalize(first, info_hash).await.unwrap();
        assert_eq!(
            final_pieces.read_piece(PieceIndex::new(0)).await.unwrap().unwrap(),
            Bytes::from_static(b"zero")
        );

        let second = Uuid::new_v4();
        let staged = storage.open(StorageKey::Staging(second));
        for (index, data) in [(0, b"zero"), (1, b"one!")] {
            staged.write_piece(PieceIndex::new(index), data).await.unwrap();
            staged.mark_complete(PieceIndex::new(index)).await.unwrap();
        }
        // The existing piece stays readable while the second upload is staged.
        assert!(final_pieces.is_complete(PieceIndex::new(0)).await.unwrap());
        storage.finalize(second, info_hash).await.unwrap();

        assert_eq!(
            final_pieces.read_piece(PieceIndex::new(0)).await.unwrap().unwrap(),
            Bytes::from_static(b"zero")
        );
        assert_eq!(
            final_pieces.read_piece(PieceIndex::new(1)).await.unwrap().unwrap(),
            Bytes::from_static(b"one!")
        );
        assert!(!temp_dir.path().join(format!("staging-{second}")).exists());
    }

    #[tokio::test]
    async fn test_remove_missing_key_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());
        storage
            .remove(StorageKey::Torrent(create_test_info_hash()))
            .await
            .unwrap();
    }
}
