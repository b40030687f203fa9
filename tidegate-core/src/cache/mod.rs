//! Metainfo cache.
//!
//! The engine does not persist metainfo, so this cache is the only thing that
//! lets a restarted gateway resume a torrent without asking peers for its
//! info. Blobs are whole bencoded metainfo files stored at `<hex>.torrent`.

pub mod file;
pub mod memory;
pub mod sled_store;

use std::sync::Arc;

use async_trait::async_trait;
pub use file::FileBlobStore;
pub use memory::MemoryBlobStore;
pub use sled_store::SledBlobStore;

use crate::config::{CacheBackend, CacheConfig};
use crate::torrent::{InfoHash, MetaInfo, TorrentError};

/// Suffix appended to the hex info hash to form a blob path.
pub const METAINFO_SUFFIX: &str = ".torrent";

/// Errors from blob stores and the metainfo cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Cached metainfo for {info_hash} is corrupt")]
    Corrupt {
        info_hash: InfoHash,
        #[source]
        source: TorrentError,
    },
}

/// Path-addressed storage for opaque blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Replaces the blob at `path`.
    ///
    /// # Errors
    /// - `CacheError::Io` / `CacheError::Database` - Backend write failed
    async fn put(&self, path: &str, data: &[u8]) -> Result<(), CacheError>;

    /// Returns the blob at `path`, or `None` if nothing was written there.
    ///
    /// # Errors
    /// - `CacheError::Io` / `CacheError::Database` - Backend read failed
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, CacheError>;
}

/// Metainfo blobs keyed by info hash.
#[derive(Clone)]
pub struct MetainfoCache {
    store: Arc<dyn BlobStore>,
}

impl MetainfoCache {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Opens the backend selected in `config`.
    ///
    /// # Errors
    /// - `CacheError::Database` - The sled database could not be opened
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let store: Arc<dyn BlobStore> = match config.backend {
            CacheBackend::File => Arc::new(FileBlobStore::new(&config.dir)),
            CacheBackend::Sled => Arc::new(SledBlobStore::open(&config.dir)?),
            CacheBackend::Memory => Arc::new(MemoryBlobStore::new()),
        };
        Ok(Self::new(store))
    }

    pub fn blob_path(info_hash: InfoHash) -> String {
        format!("{}{}", info_hash.to_hex(), METAINFO_SUFFIX)
    }

    /// Overwrites the cached blob for `info_hash`.
    ///
    /// # Errors
    /// - `CacheError::Io` / `CacheError::Database` - Backend write failed
    pub async fn put(&self, info_hash: InfoHash, metainfo_bytes: &[u8]) -> Result<(), CacheError> {
        self.store
            .put(&Self::blob_path(info_hash), metainfo_bytes)
            .await?;
        tracing::debug!(
            "Cached metainfo for {} ({} bytes)",
            info_hash,
            metainfo_bytes.len()
        );
        Ok(())
    }

    /// Cached blob for `info_hash`. A miss is `Ok(None)`.
    ///
    /// # Errors
    /// - `CacheError::Io` / `CacheError::Database` - Backend read failed
    pub async fn get(&self, info_hash: InfoHash) -> Result<Option<Vec<u8>>, CacheError> {
        self.store.get(&Self::blob_path(info_hash)).await
    }

    /// Serializes and stores `metainfo`.
    ///
    /// # Errors
    /// - `CacheError::Io` / `CacheError::Database` - Backend write failed
    pub async fn put_metainfo(
        &self,
        info_hash: InfoHash,
        metainfo: &MetaInfo,
    ) -> Result<(), CacheError> {
        self.put(info_hash, &metainfo.to_bytes()).await
    }

    /// Loads and decodes the cached metainfo for `info_hash`.
    ///
    /// # Errors
    /// - `CacheError::Corrupt` - Stored blob does not decode
    /// - `CacheError::Io` / `CacheError::Database` - Backend read failed
    pub async fn get_metainfo(&self, info_hash: InfoHash) -> Result<Option<MetaInfo>, CacheError> {
        let Some(bytes) = self.get(info_hash).await? else {
            return Ok(None);
        };
        MetaInfo::from_bytes(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Corrupt { info_hash, source })
    }
}

impl std::fmt::Debug for MetainfoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetainfoCache").finish_non_exhaustive()
    }
}
