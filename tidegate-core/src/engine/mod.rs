//! Torrent engine abstraction.
//!
//! The gateway only depends on these traits. Any engine that can hand out
//! torrents by info hash, report piece completion and produce seekable
//! readers can sit behind the HTTP surface. [`LocalEngine`] serves pieces
//! found in piece storage and is what the binary runs with.

pub mod local;
pub mod reader;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
pub use local::{LocalEngine, LocalTorrent};
pub use reader::LocalTorrentReader;
use tokio::io::{AsyncRead, AsyncSeek};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::torrent::{Info, InfoHash, MetaInfo, PieceIndex, TorrentError, TorrentSpec};

/// Seekable reader over a torrent's concatenated content.
///
/// Reads block until the needed piece is complete.
pub trait TorrentReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> TorrentReader for T {}

/// A piece changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceStateChange {
    pub index: PieceIndex,
    pub complete: bool,
}

/// Subscription to a torrent's piece state changes.
///
/// Changes are delivered in the order the torrent published them. A slow
/// subscriber that falls behind skips the changes it missed.
pub struct PieceSubscription {
    info_hash: InfoHash,
    receiver: broadcast::Receiver<PieceStateChange>,
}

impl PieceSubscription {
    pub fn new(info_hash: InfoHash, receiver: broadcast::Receiver<PieceStateChange>) -> Self {
        Self {
            info_hash,
            receiver,
        }
    }

    /// Next change, or `None` once the torrent stops publishing.
    pub async fn recv(&mut self) -> Option<PieceStateChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        "Piece subscription for {} skipped {} changes",
                        self.info_hash,
                        skipped
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Unsubscribes.
    pub fn close(self) {}
}

impl fmt::Debug for PieceSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceSubscription")
            .field("info_hash", &self.info_hash)
            .finish_non_exhaustive()
    }
}

/// A live torrent inside an engine.
#[async_trait]
pub trait Torrent: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    /// Decoded info dictionary, once known.
    fn info(&self) -> Option<Arc<Info>>;

    /// Resolves once the info is known or the torrent is dropped.
    async fn info_ready(&self);

    /// Current metainfo: known info bytes plus merged trackers, nodes and web seeds.
    fn metainfo(&self) -> MetaInfo;

    /// Display name from the info, or from a magnet link until the info arrives.
    fn name(&self) -> Option<String>;

    /// Appends the spec's trackers, nodes and web seeds, skipping duplicates.
    /// Info bytes in the spec are applied if the torrent has none yet.
    ///
    /// # Errors
    /// - `TorrentError::InfoHashMismatch` - Info bytes belong to another torrent
    /// - `TorrentError::InvalidTorrentFile` - Info bytes do not decode
    fn merge_spec(&self, spec: &TorrentSpec) -> Result<(), TorrentError>;

    /// Supplies the info dictionary. No-op if the info is already known.
    ///
    /// # Errors
    /// - `TorrentError::InfoHashMismatch` - Bytes hash to a different info hash
    /// - `TorrentError::InvalidTorrentFile` - Bytes do not decode
    fn set_info_bytes(&self, info_bytes: &[u8]) -> Result<(), TorrentError>;

    /// Opens a reader over the whole content.
    ///
    /// # Errors
    /// - `TorrentError::InfoNotReady` - Info is not known yet
    /// - `TorrentError::TorrentClosed` - Torrent was dropped
    fn new_reader(&self) -> Result<Box<dyn TorrentReader>, TorrentError>;

    fn subscribe_piece_changes(&self) -> PieceSubscription;

    fn piece_complete(&self, index: PieceIndex) -> bool;

    /// Removes the torrent from its engine. Pending reads fail.
    fn drop_torrent(&self);

    fn is_closed(&self) -> bool;
}

/// Engine that owns torrents keyed by info hash.
pub trait TorrentEngine: Send + Sync {
    /// Returns the torrent for `info_hash`, creating it if needed.
    ///
    /// The flag is true when this call created it.
    fn add_info_hash(&self, info_hash: InfoHash) -> (Arc<dyn Torrent>, bool);

    fn torrent(&self, info_hash: InfoHash) -> Option<Arc<dyn Torrent>>;

    fn torrents(&self) -> Vec<Arc<dyn Torrent>>;

    /// Human readable engine state.
    ///
    /// # Errors
    /// Propagates formatter errors.
    fn write_status(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}
