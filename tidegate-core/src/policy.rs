//! Deployment policy hooks.
//!
//! The gateway consults a [`SessionPolicy`] when it seeds a new session,
//! merges a posted metainfo, evicts an idle session, and finishes an upload.
//! [`NoopPolicy`] changes nothing. [`OperatorPolicy`] applies the operator's
//! tracker and expiry settings.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::engine::Torrent;
use crate::storage::{PieceStorage, StorageKey};
use crate::torrent::{InfoHash, MetaInfo, TorrentSpec};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Eviction of {info_hash} failed: {reason}")]
    Eviction { info_hash: InfoHash, reason: String },
}

/// Strategy consulted at session lifecycle points.
///
/// Every method has a default that leaves its input unchanged.
pub trait SessionPolicy: Send + Sync {
    /// Spec merged into a session the first time it is acquired.
    fn new_session_spec(&self, _info_hash: InfoHash, cached: Option<&MetaInfo>) -> TorrentSpec {
        cached.map(TorrentSpec::from_metainfo).unwrap_or_default()
    }

    /// Spec merged into a session from a client-posted metainfo.
    fn posted_metainfo_spec(&self, posted: &MetaInfo) -> TorrentSpec {
        TorrentSpec::from_metainfo(posted)
    }

    /// Runs once an idle session's grace period ends. The registry has
    /// already forgotten the session when this is called.
    ///
    /// # Errors
    /// - `PolicyError::Eviction` - Cleanup failed; logged by the caller
    fn on_grace_expired(&self, _torrent: &Arc<dyn Torrent>) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Adjusts an uploaded metainfo before it is returned to the client.
    /// The cached copy is not affected.
    fn modify_upload_metainfo(&self, _metainfo: &mut MetaInfo) {}
}

/// Policy that changes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPolicy;

impl SessionPolicy for NoopPolicy {}

/// Applies implicit trackers and drops expired torrents.
pub struct OperatorPolicy {
    implicit_trackers: Vec<String>,
    override_existing: bool,
    expire_torrents: bool,
    cleanup_storage: Option<Arc<dyn PieceStorage>>,
}

impl OperatorPolicy {
    pub fn new(implicit_trackers: Vec<String>, override_existing: bool, expire_torrents: bool) -> Self {
        Self {
            implicit_trackers,
            override_existing,
            expire_torrents,
            cleanup_storage: None,
        }
    }

    /// Deletes a dropped torrent's pieces from `storage`.
    pub fn with_storage_cleanup(mut self, storage: Arc<dyn PieceStorage>) -> Self {
        self.cleanup_storage = Some(storage);
        self
    }

    pub fn from_config(config: &GatewayConfig, storage: Arc<dyn PieceStorage>) -> Self {
        let policy = Self::new(
            config.trackers.implicit.clone(),
            config.trackers.override_existing,
            config.sessions.expire_torrents,
        );
        if config.sessions.cleanup_storage_on_drop {
            policy.with_storage_cleanup(storage)
        } else {
            policy
        }
    }

    fn apply_trackers(&self, trackers: &mut Vec<Vec<String>>) {
        if self.override_existing {
            trackers.clear();
        }
        if !self.implicit_trackers.is_empty() {
            trackers.push(self.implicit_trackers.clone());
        }
    }
}

impl SessionPolicy for OperatorPolicy {
    fn new_session_spec(&self, _info_hash: InfoHash, cached: Option<&MetaInfo>) -> TorrentSpec {
        let mut spec = cached.map(TorrentSpec::from_metainfo).unwrap_or_default();
        self.apply_trackers(&mut spec.trackers);
        spec
    }

    fn posted_metainfo_spec(&self, posted: &MetaInfo) -> TorrentSpec {
        let mut spec = TorrentSpec::from_metainfo(posted);
        self.apply_trackers(&mut spec.trackers);
        spec
    }

    fn on_grace_expired(&self, torrent: &Arc<dyn Torrent>) -> Result<(), PolicyError> {
        if !self.expire_torrents {
            return Ok(());
        }
        let info_hash = torrent.info_hash();
        torrent.drop_torrent();
        tracing::debug!("Dropped expired torrent {}", info_hash);

        let Some(storage) = &self.cleanup_storage else {
            return Ok(());
        };
        let handle = tokio::runtime::Handle::try_current().map_err(|e| PolicyError::Eviction {
            info_hash,
            reason: format!("storage cleanup needs a runtime: {e}"),
        })?;
        let storage = Arc::clone(storage);
        handle.spawn(async move {
            if let Err(e) = storage.remove(StorageKey::Torrent(info_hash)).await {
                tracing::error!("Removing stored pieces of {} failed: {}", info_hash, e);
            }
        });
        Ok(())
    }

    fn modify_upload_metainfo(&self, metainfo: &mut MetaInfo) {
        let mut trackers = metainfo.upvert_announce_list();
        self.apply_trackers(&mut trackers);
        metainfo.announce = trackers.first().and_then(|tier| tier.first()).cloned();
        metainfo.announce_list = trackers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LocalEngine, TorrentEngine};
    use crate::storage::MemoryStorage;
    use crate::test_fixtures::TorrentFixture;

    fn cached() -> MetaInfo {
        MetaInfo {
            announce: Some("http://cached/announce".to_string()),
            ..MetaInfo::default()
        }
    }

    #[test]
    fn test_noop_policy_passes_cached_spec_through() {
        let spec = NoopPolicy.new_session_spec(InfoHash::new([0; 20]), Some(&cached()));
        assert_eq!(spec.trackers, vec![vec!["http://cached/announce".to_string()]]);
        assert!(NoopPolicy.new_session_spec(InfoHash::new([0; 20]), None).is_empty());
    }

    #[test]
    fn test_implicit_trackers_append_or_override() {
        let implicit = vec!["udp://implicit:1".to_string()];

        let appending = OperatorPolicy::new(implicit.clone(), false, true);
        let spec = appending.new_session_spec(InfoHash::new([0; 20]), Some(&cached()));
        assert_eq!(spec.trackers.len(), 2);
        assert_eq!(spec.trackers[1], implicit);

        let overriding = OperatorPolicy::new(implicit.clone(), true, true);
        let spec = overriding.posted_metainfo_spec(&cached());
        assert_eq!(spec.trackers, vec![implicit]);
    }

    #[test]
    fn test_modify_upload_metainfo_sets_announce() {
        let policy = OperatorPolicy::new(vec!["http://a".to_string()], false, true);
        let mut metainfo = MetaInfo::default();
        policy.modify_upload_metainfo(&mut metainfo);
        assert_eq!(metainfo.announce.as_deref(), Some("http://a"));
        assert_eq!(metainfo.announce_list, vec![vec!["http://a".to_string()]]);
    }

    #[tokio::test]
    async fn test_expiry_drops_torrent_and_cleans_storage() {
        let storage = MemoryStorage::new();
        let fixture = TorrentFixture::single_file("a", 16, 20);
        fixture.store_all(&storage).await;
        let engine = LocalEngine::new(Arc::new(storage.clone()));
        let (torrent, _) = engine.add_info_hash(fixture.info_hash);

        let policy = OperatorPolicy::new(Vec::new(), false, true)
            .with_storage_cleanup(Arc::new(storage.clone()));
        policy.on_grace_expired(&torrent).unwrap();
        assert!(torrent.is_closed());
        assert!(engine.torrent(fixture.info_hash).is_none());

        tokio::task::yield_now().await;
        assert!(!storage.contains_key(StorageKey::Torrent(fixture.info_hash)));
    }

    #[tokio::test]
    async fn test_expiry_disabled_keeps_torrent() {
        let engine = LocalEngine::new(Arc::new(MemoryStorage::new()));
        let (torrent, _) = engine.add_info_hash(InfoHash::new([9; 20]));
        OperatorPolicy::new(Vec::new(), false, false)
            .on_grace_expired(&torrent)
            .unwrap();
        assert!(!torrent.is_closed());
    }
}
