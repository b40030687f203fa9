//! Embedded database blob store

use std::path::Path;

use async_trait::async_trait;

use super::{BlobStore, CacheError};

/// Blobs stored as values of a sled tree, keyed by path.
#[derive(Debug, Clone)]
pub struct SledBlobStore {
    db: sled::Db,
}

impl SledBlobStore {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    /// - `CacheError::Database` - Database could not be opened
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let db = sled::open(path.as_ref())?;
        tracing::info!("Opened metainfo database at {}", path.as_ref().display());
        Ok(Self { db })
    }

    /// Database that lives only as long as this handle.
    ///
    /// # Errors
    /// - `CacheError::Database` - Database could not be created
    pub fn temporary() -> Result<Self, CacheError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl SledBlobStore {
    /// Runs `op` against the database on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&sled::Db) -> Result<T, sled::Error> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
            .map_err(CacheError::from)
    }
}

#[async_trait]
impl BlobStore for SledBlobStore {
    async fn put(&self, path: &str, data: &[u8]) -> Result<(), CacheError> {
        let key = path.as_bytes().to_vec();
        let value = data.to_vec();
        self.blocking(move |db| {
            db.insert(key, value)?;
            db.flush()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = path.as_bytes().to_vec();
        self.blocking(move |db| Ok(db.get(key)?.map(|value| value.to_vec())))
            .await
    }
}
