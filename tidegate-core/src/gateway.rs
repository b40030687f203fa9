//! Gateway service tying sessions, the metainfo cache, uploads and lookups
//! together. The HTTP layer holds one [`Gateway`] and calls nothing else.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use crate::cache::MetainfoCache;
use crate::config::GatewayConfig;
use crate::engine::{LocalEngine, Torrent, TorrentEngine};
use crate::lookup::{LookupError, MultiSourceLookup, Target};
use crate::policy::{OperatorPolicy, SessionPolicy};
use crate::registry::{Acquired, SessionRegistry};
use crate::storage::{FileStorage, MemoryStorage, PieceStorage};
use crate::torrent::{InfoHash, MagnetLink, MetaInfo, TorrentSpec};
use crate::upload::{UploadJob, UploadPipeline};
use crate::GatewayError;

/// `created by` value of uploaded torrents.
pub const UPLOAD_CREATED_BY: &str = "tidegate upload";

/// Collaborators a [`Gateway`] is assembled from.
pub struct GatewayParts {
    pub engine: Arc<dyn TorrentEngine>,
    pub storage: Arc<dyn PieceStorage>,
    pub cache: MetainfoCache,
    pub policy: Arc<dyn SessionPolicy>,
    pub lookups: MultiSourceLookup,
}

pub struct Gateway {
    engine: Arc<dyn TorrentEngine>,
    registry: SessionRegistry,
    cache: MetainfoCache,
    policy: Arc<dyn SessionPolicy>,
    uploads: UploadPipeline,
    lookups: MultiSourceLookup,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(parts: GatewayParts, config: GatewayConfig) -> Self {
        let registry = SessionRegistry::new(
            Arc::clone(&parts.engine),
            Arc::clone(&parts.policy),
            config.sessions.grace,
        );
        Self {
            engine: parts.engine,
            registry,
            cache: parts.cache,
            policy: parts.policy,
            uploads: UploadPipeline::new(parts.storage, config.upload.pipe_capacity),
            lookups: parts.lookups,
            config,
        }
    }

    /// Builds storage, cache, local engine, operator policy and lookup
    /// backends from `config`.
    ///
    /// # Errors
    /// - `GatewayError::Cache` - Cache backend could not be opened
    /// - `GatewayError::Lookup` - A lookup backend URL is invalid
    pub fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        let storage: Arc<dyn PieceStorage> = if config.storage.in_memory {
            Arc::new(MemoryStorage::new())
        } else {
            Arc::new(FileStorage::new(&config.storage.dir))
        };
        let cache = MetainfoCache::from_config(&config.cache)?;
        let lookups = MultiSourceLookup::from_config(&config.lookup)?;
        let policy: Arc<dyn SessionPolicy> =
            Arc::new(OperatorPolicy::from_config(&config, Arc::clone(&storage)));
        let engine: Arc<dyn TorrentEngine> = Arc::new(LocalEngine::new(Arc::clone(&storage)));
        tracing::info!(
            "Gateway configured: cache={} at {}, storage={}, grace={:?}, lookup backends={}",
            config.cache.backend,
            config.cache.dir.display(),
            if config.storage.in_memory {
                "memory".to_string()
            } else {
                config.storage.dir.display().to_string()
            },
            config.sessions.grace,
            lookups.backend_count()
        );
        Ok(Self::new(
            GatewayParts {
                engine,
                storage,
                cache,
                policy,
                lookups,
            },
            config,
        ))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn TorrentEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &MetainfoCache {
        &self.cache
    }

    /// Borrows the session for `info_hash`.
    ///
    /// A session created by this call is seeded from the cache through the
    /// policy before anything else sees it. A torrent the engine just added
    /// persists its metainfo once the info arrives. Cache failures are logged
    /// and treated as a miss.
    pub async fn acquire(&self, info_hash: InfoHash) -> Acquired {
        let acquired = self.registry.acquire(info_hash);
        if acquired.is_new {
            self.seed_session(&acquired.torrent).await;
        }
        if acquired.engine_new {
            self.save_when_ready(Arc::clone(&acquired.torrent));
        }
        acquired
    }

    /// Borrows the session named by a magnet link and merges its trackers.
    ///
    /// If the info is already known the merged metainfo is written back to
    /// the cache. Otherwise the pending save picks the trackers up.
    ///
    /// # Errors
    /// - `GatewayError::Torrent` - Merge rejected by the torrent
    pub async fn acquire_magnet(&self, magnet: &MagnetLink) -> Result<Acquired, GatewayError> {
        let acquired = self.acquire(magnet.info_hash).await;
        let torrent = &acquired.torrent;
        torrent.merge_spec(&TorrentSpec::from_magnet(magnet))?;
        if torrent.info().is_some() {
            if let Err(e) = self.cache.put_metainfo(magnet.info_hash, &torrent.metainfo()).await {
                tracing::warn!("Saving magnet trackers for {} failed: {}", magnet.info_hash, e);
            }
        }
        Ok(acquired)
    }

    async fn seed_session(&self, torrent: &Arc<dyn Torrent>) {
        let info_hash = torrent.info_hash();
        let cached = match self.cache.get_metainfo(info_hash).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!("Loading cached metainfo for {} failed: {}", info_hash, e);
                None
            }
        };
        if cached.is_some() {
            tracing::debug!("Seeding {} from cached metainfo", info_hash);
        }
        let spec = self.policy.new_session_spec(info_hash, cached.as_ref());
        if spec.is_empty() {
            return;
        }
        if let Err(e) = torrent.merge_spec(&spec) {
            tracing::warn!("Seeding {} from cache failed: {}", info_hash, e);
        }
    }

    /// Persists the torrent's metainfo once its info is known. Does nothing
    /// if the torrent is dropped first.
    fn save_when_ready(&self, torrent: Arc<dyn Torrent>) {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            torrent.info_ready().await;
            let info_hash = torrent.info_hash();
            if torrent.is_closed() {
                tracing::debug!("Torrent {} closed before its info arrived", info_hash);
                return;
            }
            if let Err(e) = cache.put_metainfo(info_hash, &torrent.metainfo()).await {
                tracing::warn!("Saving metainfo for {} failed: {}", info_hash, e);
            }
        });
    }

    /// Merges a client-posted metainfo into `torrent` and persists the result.
    ///
    /// A failed cache write is logged and does not fail the call.
    ///
    /// # Errors
    /// - `GatewayError::Torrent` - Posted info bytes rejected
    pub async fn put_metainfo(
        &self,
        torrent: &dyn Torrent,
        posted: &MetaInfo,
    ) -> Result<(), GatewayError> {
        let spec = self.policy.posted_metainfo_spec(posted);
        torrent.merge_spec(&spec)?;
        let info_hash = torrent.info_hash();
        if let Err(e) = self.cache.put_metainfo(info_hash, &torrent.metainfo()).await {
            tracing::warn!("Saving merged metainfo for {} failed: {}", info_hash, e);
        }
        Ok(())
    }

    /// Creates a torrent from uploaded files.
    ///
    /// The cache receives the metainfo before the policy adjusts it, so the
    /// cached copy does not depend on this deployment's settings. A session
    /// for the new torrent is opened and left in its grace period.
    ///
    /// # Errors
    /// - `GatewayError::Upload` - Reading, hashing or storing failed
    pub async fn upload(&self, job: UploadJob) -> Result<MetaInfo, GatewayError> {
        let outcome = self.uploads.run(job).await?;
        let mut metainfo = MetaInfo {
            info_bytes: outcome.info_bytes,
            created_by: Some(UPLOAD_CREATED_BY.to_string()),
            creation_date: Some(chrono::Utc::now().timestamp()),
            ..MetaInfo::default()
        };
        if let Err(e) = self.cache.put_metainfo(outcome.info_hash, &metainfo).await {
            tracing::warn!("Saving uploaded metainfo for {} failed: {}", outcome.info_hash, e);
        }
        // The cache already holds the neutral copy; no save task is started.
        let acquired = self.registry.acquire(outcome.info_hash);
        if acquired.is_new {
            self.seed_session(&acquired.torrent).await;
        }
        if let Err(e) = acquired
            .torrent
            .merge_spec(&TorrentSpec::from_metainfo(&metainfo))
        {
            tracing::warn!("Opening session for upload {} failed: {}", outcome.info_hash, e);
        }
        drop(acquired);
        self.policy.modify_upload_metainfo(&mut metainfo);
        Ok(metainfo)
    }

    /// First value any lookup backend returns.
    ///
    /// # Errors
    /// - `LookupError::NotFound` - No backend had it
    pub async fn lookup(&self, target: Target, salt: &[u8]) -> Result<Vec<u8>, LookupError> {
        self.lookups.get(target, salt).await
    }

    /// Session and engine state as text.
    ///
    /// # Errors
    /// Propagates formatter errors.
    pub fn write_status(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "Sessions: {}", self.registry.len())?;
        writeln!(out, "Grace: {:?}", self.registry.grace())?;
        self.engine.write_status(out)
    }

    pub fn status(&self) -> Result<String, fmt::Error> {
        let mut out = String::new();
        self.write_status(&mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("sessions", &self.registry.len())
            .field("lookups", &self.lookups)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::cache::MemoryBlobStore;
    use crate::policy::NoopPolicy;
    use crate::streaming::{InfoWait, open_content};
    use crate::test_fixtures::TorrentFixture;
    use crate::upload::UploadFile;

    struct Harness {
        gateway: Gateway,
        storage: MemoryStorage,
    }

    fn harness(policy: Arc<dyn SessionPolicy>) -> Harness {
        let storage = MemoryStorage::new();
        let shared: Arc<dyn PieceStorage> = Arc::new(storage.clone());
        let gateway = Gateway::new(
            GatewayParts {
                engine: Arc::new(LocalEngine::new(Arc::clone(&shared))),
                storage: shared,
                cache: MetainfoCache::new(Arc::new(MemoryBlobStore::new())),
                policy,
                lookups: MultiSourceLookup::new(Vec::new(), Duration::from_secs(1)),
            },
            GatewayConfig::for_testing(),
        );
        Harness { gateway, storage }
    }

    async fn wait_for_cache(cache: &MetainfoCache, info_hash: InfoHash) -> MetaInfo {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(cached) = cache.get_metainfo(info_hash).await.unwrap() {
                    return cached;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("metainfo cached")
    }

    #[tokio::test]
    async fn test_new_session_seeded_from_cache() {
        let Harness { gateway, .. } = harness(Arc::new(NoopPolicy));
        let fixture = TorrentFixture::single_file("movie.mkv", 16, 40);
        gateway
            .cache()
            .put_metainfo(fixture.info_hash, &fixture.metainfo())
            .await
            .unwrap();

        let acquired = gateway.acquire(fixture.info_hash).await;
        assert!(acquired.is_new);
        assert_eq!(acquired.torrent.info().unwrap().name, "movie.mkv");
        assert_eq!(
            acquired.torrent.metainfo().announce.as_deref(),
            Some("http://tracker.test/announce")
        );

        let again = gateway.acquire(fixture.info_hash).await;
        assert!(!again.is_new);
        assert_eq!(gateway.registry().ref_count(fixture.info_hash), 2);
    }

    #[tokio::test]
    async fn test_metainfo_saved_once_info_arrives() {
        let Harness { gateway, .. } = harness(Arc::new(NoopPolicy));
        let fixture = TorrentFixture::single_file("late", 16, 20);

        let acquired = gateway.acquire(fixture.info_hash).await;
        assert!(gateway.cache().get(fixture.info_hash).await.unwrap().is_none());

        acquired.torrent.set_info_bytes(&fixture.info_bytes).unwrap();
        let cached = wait_for_cache(gateway.cache(), fixture.info_hash).await;
        assert_eq!(cached.info_bytes, fixture.info_bytes);
    }

    #[tokio::test]
    async fn test_dropped_session_not_saved() {
        let Harness { gateway, .. } = harness(Arc::new(NoopPolicy));
        let info_hash = InfoHash::new([8; 20]);

        let acquired = gateway.acquire(info_hash).await;
        acquired.torrent.drop_torrent();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(gateway.cache().get(info_hash).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_cycles_do_not_accumulate_tasks() {
        let Harness { gateway, .. } = harness(Arc::new(NoopPolicy));
        let info_hash = InfoHash::new([5; 20]);
        let metrics = tokio::runtime::Handle::current().metrics();

        let mut alive = Vec::new();
        for _ in 0..5 {
            drop(gateway.acquire(info_hash).await);
            tokio::time::sleep(gateway.registry().grace() + Duration::from_millis(10)).await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            assert!(!gateway.registry().contains(info_hash));
            alive.push(metrics.num_alive_tasks());
        }
        assert!(
            alive.iter().all(|&count| count == alive[0]),
            "alive tasks per cycle: {alive:?}"
        );
    }

    #[tokio::test]
    async fn test_magnet_trackers_cached_for_known_torrent() {
        let Harness { gateway, .. } = harness(Arc::new(NoopPolicy));
        let fixture = TorrentFixture::single_file("known", 16, 20);
        gateway
            .cache()
            .put_metainfo(fixture.info_hash, &fixture.metainfo())
            .await
            .unwrap();

        let magnet = MagnetLink {
            info_hash: fixture.info_hash,
            display_name: None,
            trackers: vec!["udp://magnet.test:1337".to_string()],
        };
        let _acquired = gateway.acquire_magnet(&magnet).await.unwrap();

        let cached = gateway
            .cache()
            .get_metainfo(fixture.info_hash)
            .await
            .unwrap()
            .unwrap();
        assert!(
            cached
                .announce_list
                .iter()
                .flatten()
                .any(|tracker| tracker == "udp://magnet.test:1337")
        );
        assert_eq!(cached.info_bytes, fixture.info_bytes);
    }

    #[tokio::test]
    async fn test_put_metainfo_merges_and_caches() {
        let Harness { gateway, .. } = harness(Arc::new(NoopPolicy));
        let fixture = TorrentFixture::single_file("posted", 16, 20);
        let acquired = gateway.acquire(fixture.info_hash).await;

        gateway
            .put_metainfo(acquired.torrent.as_ref(), &fixture.metainfo())
            .await
            .unwrap();

        assert!(acquired.torrent.info().is_some());
        let cached = gateway
            .cache()
            .get_metainfo(fixture.info_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.info_bytes, fixture.info_bytes);
        assert_eq!(
            cached.announce_list,
            vec![vec!["http://tracker.test/announce".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_put_metainfo_for_other_torrent_rejected() {
        let Harness { gateway, .. } = harness(Arc::new(NoopPolicy));
        let fixture = TorrentFixture::single_file("posted", 16, 20);
        let acquired = gateway.acquire(InfoHash::new([1; 20])).await;

        let result = gateway
            .put_metainfo(acquired.torrent.as_ref(), &fixture.metainfo())
            .await;
        assert!(matches!(result, Err(GatewayError::Torrent(_))));
    }

    #[tokio::test]
    async fn test_upload_caches_neutral_metainfo_and_serves_content() {
        let policy = OperatorPolicy::new(vec!["udp://implicit:6969".to_string()], false, true);
        let Harness { gateway, storage } = harness(Arc::new(policy));
        let data: Vec<u8> = (0..100u8).collect();
        let job = UploadJob::new(
            "shared",
            vec![UploadFile::new(
                vec!["notes.txt".to_string()],
                data.len() as u64,
                Cursor::new(data.clone()),
            )],
        );

        let metainfo = gateway.upload(job).await.unwrap();
        assert_eq!(metainfo.created_by.as_deref(), Some(UPLOAD_CREATED_BY));
        assert_eq!(metainfo.announce.as_deref(), Some("udp://implicit:6969"));

        let info_hash = metainfo.info_hash();
        let cached = gateway.cache().get_metainfo(info_hash).await.unwrap().unwrap();
        assert!(cached.announce.is_none());
        assert!(cached.announce_list.is_empty());
        assert_eq!(
            storage.completed_count(crate::storage::StorageKey::Torrent(info_hash)),
            1
        );

        assert!(gateway.registry().contains(info_hash));
        assert_eq!(gateway.registry().ref_count(info_hash), 0);
        let acquired = gateway.acquire(info_hash).await;
        assert!(!acquired.is_new);
        assert!(acquired.torrent.info().is_some());
        let mut source = open_content(
            acquired.torrent.as_ref(),
            Some("notes.txt"),
            InfoWait::NoWait,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let mut served = Vec::new();
        source.reader.read_to_end(&mut served).await.unwrap();
        assert_eq!(served, data);
    }

    #[tokio::test]
    async fn test_status_lists_sessions() {
        let Harness { gateway, .. } = harness(Arc::new(NoopPolicy));
        let _acquired = gateway.acquire(InfoHash::new([2; 20])).await;
        let status = gateway.status().unwrap();
        assert!(status.starts_with("Sessions: 1\n"));
        assert!(status.contains("# Torrents: 1"));
    }
}
