//! Tidegate Core - session lifecycle and streaming for a torrent HTTP gateway
//!
//! Turns short-lived HTTP requests into reference-counted leases on shared
//! torrent sessions, persists metainfo across restarts, and provides the
//! streaming, event, upload and lookup building blocks the web layer serves.

pub mod cache;
pub mod config;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod lookup;
pub mod policy;
pub mod registry;
pub mod storage;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;
pub mod upload;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

pub use cache::{CacheError, MetainfoCache};
pub use config::GatewayConfig;
pub use engine::{Torrent, TorrentEngine};
pub use gateway::{Gateway, GatewayParts};
pub use lookup::LookupError;
pub use policy::{NoopPolicy, OperatorPolicy, SessionPolicy};
pub use registry::{Acquired, SessionLease, SessionRegistry};
pub use storage::{FileStorage, StorageError};
pub use streaming::StreamError;
pub use torrent::{InfoHash, TorrentError};
pub use upload::UploadError;

/// Errors that can bubble up from any gateway subsystem.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Streaming error: {0}")]
    Stream(#[from] StreamError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Torrent(e) => match e {
                TorrentError::InvalidInfoHash { reason } => format!("Invalid info hash: {reason}"),
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::InvalidMagnetLink { reason } => {
                    format!("Invalid magnet link: {reason}")
                }
                TorrentError::InfoHashMismatch { expected, actual } => {
                    format!("Metainfo is for {actual}, not {expected}")
                }
                _ => "Torrent error occurred".to_string(),
            },
            GatewayError::Upload(UploadError::NoFiles) => "Upload has no files".to_string(),
            GatewayError::Upload(_) => "Upload failed".to_string(),
            GatewayError::Lookup(LookupError::InvalidTarget { reason }) => {
                format!("Invalid target: {reason}")
            }
            GatewayError::Lookup(_) => "Lookup failed".to_string(),
            GatewayError::Stream(StreamError::FileNotFound { path }) => {
                format!("File {path:?} not found")
            }
            GatewayError::Stream(_) => "Streaming error occurred".to_string(),
            GatewayError::Storage(_) => "Storage error occurred".to_string(),
            GatewayError::Cache(_) => "Metainfo cache error occurred".to_string(),
            GatewayError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Torrent(
                TorrentError::InvalidInfoHash { .. }
                    | TorrentError::InvalidTorrentFile { .. }
                    | TorrentError::InvalidMagnetLink { .. }
                    | TorrentError::InfoHashMismatch { .. }
            ) | GatewayError::Upload(UploadError::NoFiles | UploadError::ShortFile { .. })
                | GatewayError::Lookup(LookupError::InvalidTarget { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_classified() {
        let bad_hash: GatewayError = InfoHash::from_hex("abc").unwrap_err().into();
        assert!(bad_hash.is_user_error());
        assert!(bad_hash.user_message().starts_with("Invalid info hash"));

        let storage: GatewayError = StorageError::Io(std::io::Error::other("disk")).into();
        assert!(!storage.is_user_error());
        assert_eq!(storage.user_message(), "Storage error occurred");
    }
}
