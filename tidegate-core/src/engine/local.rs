//! Storage-backed engine.
//!
//! Torrents learn their info from metainfo or uploads and serve whatever
//! pieces exist in piece storage. Completion happens through
//! [`LocalTorrent::complete_piece`] or by finding completed pieces in storage.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::reader::LocalTorrentReader;
use super::{PieceStateChange, PieceSubscription, Torrent, TorrentEngine, TorrentReader};
use crate::storage::{PieceStorage, StorageKey, TorrentStorage};
use crate::torrent::{
    Info, InfoHash, MetaInfo, PieceIndex, TorrentError, TorrentSpec, hash_piece,
};

const PIECE_CHANGE_CAPACITY: usize = 256;

type TorrentMap = RwLock<HashMap<InfoHash, Arc<LocalTorrent>>>;

/// Engine serving torrents out of piece storage.
pub struct LocalEngine {
    storage: Arc<dyn PieceStorage>,
    torrents: Arc<TorrentMap>,
}

impl LocalEngine {
    pub fn new(storage: Arc<dyn PieceStorage>) -> Self {
        Self {
            storage,
            torrents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Concrete handle, for callers that complete pieces directly.
    pub fn local_torrent(&self, info_hash: InfoHash) -> Option<Arc<LocalTorrent>> {
        self.torrents.read().get(&info_hash).cloned()
    }

    pub fn storage(&self) -> &Arc<dyn PieceStorage> {
        &self.storage
    }
}

impl TorrentEngine for LocalEngine {
    fn add_info_hash(&self, info_hash: InfoHash) -> (Arc<dyn Torrent>, bool) {
        let mut torrents = self.torrents.write();
        if let Some(existing) = torrents.get(&info_hash) {
            return (Arc::clone(existing) as Arc<dyn Torrent>, false);
        }
        let pieces: Arc<dyn TorrentStorage> =
            Arc::from(self.storage.open(StorageKey::Torrent(info_hash)));
        let torrent = LocalTorrent::new(info_hash, pieces, Arc::downgrade(&self.torrents));
        torrents.insert(info_hash, Arc::clone(&torrent));
        tracing::debug!("Added torrent {}", info_hash);
        (torrent as Arc<dyn Torrent>, true)
    }

    fn torrent(&self, info_hash: InfoHash) -> Option<Arc<dyn Torrent>> {
        self.local_torrent(info_hash)
            .map(|torrent| torrent as Arc<dyn Torrent>)
    }

    fn torrents(&self) -> Vec<Arc<dyn Torrent>> {
        self.torrents
            .read()
            .values()
            .map(|torrent| Arc::clone(torrent) as Arc<dyn Torrent>)
            .collect()
    }

    fn write_status(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let mut torrents: Vec<Arc<LocalTorrent>> = self.torrents.read().values().cloned().collect();
        torrents.sort_by_key(|torrent| torrent.info_hash);

        writeln!(out, "Local engine")?;
        writeln!(out, "# Torrents: {}", torrents.len())?;
        for torrent in torrents {
            writeln!(out)?;
            torrent.write_status(out)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct TorrentState {
    info: Option<Arc<Info>>,
    info_bytes: Vec<u8>,
    display_name: Option<String>,
    trackers: Vec<Vec<String>>,
    nodes: Vec<String>,
    web_seeds: Vec<String>,
    completed: Vec<bool>,
}

/// A torrent owned by [`LocalEngine`].
pub struct LocalTorrent {
    info_hash: InfoHash,
    me: Weak<LocalTorrent>,
    pieces: Arc<dyn TorrentStorage>,
    state: Mutex<TorrentState>,
    info_ready: watch::Sender<bool>,
    completions: watch::Sender<u64>,
    piece_changes: broadcast::Sender<PieceStateChange>,
    closed: CancellationToken,
    engine: Weak<TorrentMap>,
}

impl LocalTorrent {
    fn new(
        info_hash: InfoHash,
        pieces: Arc<dyn TorrentStorage>,
        engine: Weak<TorrentMap>,
    ) -> Arc<Self> {
        let (piece_changes, _) = broadcast::channel(PIECE_CHANGE_CAPACITY);
        Arc::new_cyclic(|me| Self {
            info_hash,
            me: me.clone(),
            pieces,
            state: Mutex::new(TorrentState::default()),
            info_ready: watch::Sender::new(false),
            completions: watch::Sender::new(0),
            piece_changes,
            closed: CancellationToken::new(),
            engine,
        })
    }

    /// Stores and publishes a piece.
    ///
    /// # Errors
    /// - `TorrentError::InfoNotReady` - Info is not known yet
    /// - `TorrentError::InvalidTorrentFile` - Index out of range or data fails its hash
    /// - `TorrentError::Storage` - Storage write failed
    pub async fn complete_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), TorrentError> {
        let info = self.info().ok_or(TorrentError::InfoNotReady {
            info_hash: self.info_hash,
        })?;
        let expected = info
            .pieces
            .get(index.as_u32() as usize)
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: format!("Piece {index} out of range"),
            })?;
        if hash_piece(data) != *expected {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!("Piece {index} failed hash check"),
            });
        }

        self.pieces.write_piece(index, data).await?;
        self.pieces.mark_complete(index).await?;
        self.mark_piece_complete(index);
        Ok(())
    }

    /// Waits until `index` is complete in storage and returns its data.
    pub(crate) async fn wait_for_piece(self: Arc<Self>, index: PieceIndex) -> io::Result<Bytes> {
        let mut completions = self.completions.subscribe();
        loop {
            if let Some(data) = self.pieces.read_piece(index).await.map_err(io::Error::other)? {
                self.mark_piece_complete(index);
                return Ok(data);
            }
            tokio::select! {
                changed = completions.changed() => {
                    if changed.is_err() {
                        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "torrent closed"));
                    }
                }
                () = self.closed.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "torrent dropped"));
                }
            }
        }
    }

    fn mark_piece_complete(&self, index: PieceIndex) {
        let newly_complete = {
            let mut state = self.state.lock();
            match state.completed.get_mut(index.as_u32() as usize) {
                Some(complete) if !*complete => {
                    *complete = true;
                    true
                }
                _ => false,
            }
        };
        if newly_complete {
            tracing::debug!("Piece {} completed for torrent {}", index, self.info_hash);
            // No subscribers is fine.
            let _ = self.piece_changes.send(PieceStateChange {
                index,
                complete: true,
            });
            self.completions.send_modify(|generation| *generation += 1);
        }
    }

    /// Marks pieces already present in storage as complete.
    async fn scan_storage(self: Arc<Self>, piece_count: u32) {
        for index in (0..piece_count).map(PieceIndex::new) {
            if self.closed.is_cancelled() {
                return;
            }
            match self.pieces.is_complete(index).await {
                Ok(true) => self.mark_piece_complete(index),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        "Scanning storage for {} failed at piece {}: {}",
                        self.info_hash,
                        index,
                        e
                    );
                    return;
                }
            }
        }
    }

    fn completed_count(&self) -> usize {
        self.state.lock().completed.iter().filter(|c| **c).count()
    }

    fn write_status(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        writeln!(out, "{}", self.info_hash)?;
        match &state.info {
            Some(info) => {
                let done = state.completed.iter().filter(|c| **c).count();
                writeln!(out, "  name: {}", info.name)?;
                writeln!(out, "  pieces: {}/{}", done, info.piece_count())?;
                writeln!(out, "  length: {}", info.total_length())?;
            }
            None => writeln!(out, "  info: pending")?,
        }
        for (tier_index, tier) in state.trackers.iter().enumerate() {
            writeln!(out, "  tier {tier_index}: {}", tier.join(" "))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Torrent for LocalTorrent {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn info(&self) -> Option<Arc<Info>> {
        self.state.lock().info.clone()
    }

    async fn info_ready(&self) {
        let mut ready = self.info_ready.subscribe();
        loop {
            let is_ready = *ready.borrow_and_update();
            if is_ready {
                return;
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                () = self.closed.cancelled() => return,
            }
        }
    }

    fn metainfo(&self) -> MetaInfo {
        let state = self.state.lock();
        MetaInfo {
            info_bytes: state.info_bytes.clone(),
            announce: state.trackers.first().and_then(|tier| tier.first()).cloned(),
            announce_list: state.trackers.clone(),
            nodes: state.nodes.clone(),
            url_list: state.web_seeds.clone(),
            ..MetaInfo::default()
        }
    }

    fn name(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .info
            .as_ref()
            .map(|info| info.name.clone())
            .or_else(|| state.display_name.clone())
    }

    fn merge_spec(&self, spec: &TorrentSpec) -> Result<(), TorrentError> {
        {
            let mut state = self.state.lock();
            for tier in &spec.trackers {
                let fresh: Vec<String> = tier
                    .iter()
                    .filter(|url| !state.trackers.iter().flatten().any(|known| known == *url))
                    .cloned()
                    .collect();
                if !fresh.is_empty() {
                    state.trackers.push(fresh);
                }
            }
            for node in &spec.nodes {
                if !state.nodes.contains(node) {
                    state.nodes.push(node.clone());
                }
            }
            for seed in &spec.web_seeds {
                if !state.web_seeds.contains(seed) {
                    state.web_seeds.push(seed.clone());
                }
            }
            if state.display_name.is_none() {
                state.display_name = spec.display_name.clone();
            }
        }
        match &spec.info_bytes {
            Some(info_bytes) => self.set_info_bytes(info_bytes),
            None => Ok(()),
        }
    }

    fn set_info_bytes(&self, info_bytes: &[u8]) -> Result<(), TorrentError> {
        if self.state.lock().info.is_some() {
            return Ok(());
        }
        let actual = InfoHash::from_info_bytes(info_bytes);
        if actual != self.info_hash {
            return Err(TorrentError::InfoHashMismatch {
                expected: self.info_hash,
                actual,
            });
        }
        let info = Info::from_bytes(info_bytes)?;
        let piece_count = info.piece_count();
        {
            let mut state = self.state.lock();
            if state.info.is_some() {
                return Ok(());
            }
            state.completed = vec![false; piece_count as usize];
            state.info = Some(Arc::new(info));
            state.info_bytes = info_bytes.to_vec();
        }
        tracing::debug!("Got info for torrent {}", self.info_hash);
        self.info_ready.send_replace(true);

        if let (Some(me), Ok(handle)) = (self.me.upgrade(), tokio::runtime::Handle::try_current()) {
            handle.spawn(me.scan_storage(piece_count));
        }
        Ok(())
    }

    fn new_reader(&self) -> Result<Box<dyn TorrentReader>, TorrentError> {
        if self.closed.is_cancelled() {
            return Err(TorrentError::TorrentClosed {
                info_hash: self.info_hash,
            });
        }
        let info = self.info().ok_or(TorrentError::InfoNotReady {
            info_hash: self.info_hash,
        })?;
        let me = self.me.upgrade().ok_or(TorrentError::TorrentClosed {
            info_hash: self.info_hash,
        })?;
        Ok(Box::new(LocalTorrentReader::new(me, info)))
    }

    fn subscribe_piece_changes(&self) -> PieceSubscription {
        PieceSubscription::new(self.info_hash, self.piece_changes.subscribe())
    }

    fn piece_complete(&self, index: PieceIndex) -> bool {
        self.state
            .lock()
            .completed
            .get(index.as_u32() as usize)
            .copied()
            .unwrap_or(false)
    }

    fn drop_torrent(&self) {
        self.closed.cancel();
        if let Some(torrents) = self.engine.upgrade() {
            let mut torrents = torrents.write();
            if torrents
                .get(&self.info_hash)
                .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), self))
            {
                torrents.remove(&self.info_hash);
            }
        }
        tracing::debug!(
            "Dropped torrent {} with {} complete pieces",
            self.info_hash,
            self.completed_count()
        );
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::test_fixtures::TorrentFixture;

    fn engine() -> (LocalEngine, MemoryStorage) {
        let storage = MemoryStorage::new();
        (LocalEngine::new(Arc::new(storage.clone())), storage)
    }

    #[tokio::test]
    async fn test_add_info_hash_is_idempotent() {
        let (engine, _) = engine();
        let fixture = TorrentFixture::single_file("a.bin", 16, 40);

        let (first, created) = engine.add_info_hash(fixture.info_hash);
        assert!(created);
        let (second, created) = engine.add_info_hash(fixture.info_hash);
        assert!(!created);
        assert_eq!(first.info_hash(), second.info_hash());
        assert_eq!(engine.torrents().len(), 1);
    }

    #[tokio::test]
    async fn test_set_info_bytes_rejects_foreign_info() {
        let (engine, _) = engine();
        let fixture = TorrentFixture::single_file("a.bin", 16, 40);
        let other = TorrentFixture::single_file("b.bin", 16, 40);

        let (torrent, _) = engine.add_info_hash(fixture.info_hash);
        let result = torrent.set_info_bytes(&other.info_bytes);
        assert!(matches!(result, Err(TorrentError::InfoHashMismatch { .. })));
        assert!(torrent.info().is_none());

        torrent.set_info_bytes(&fixture.info_bytes).unwrap();
        assert_eq!(torrent.info().unwrap().total_length(), 40);
        assert_eq!(torrent.name().as_deref(), Some("a.bin"));
    }

    #[tokio::test]
    async fn test_reader_blocks_until_piece_completes() {
        let (engine, _) = engine();
        let fixture = TorrentFixture::single_file("a.bin", 16, 40);
        let (torrent, _) = engine.add_info_hash(fixture.info_hash);
        torrent.set_info_bytes(&fixture.info_bytes).unwrap();
        let local = engine.local_torrent(fixture.info_hash).unwrap();

        let mut reader = torrent.new_reader().unwrap();
        reader.seek(io::SeekFrom::Start(18)).await.unwrap();
        let read = tokio::spawn(async move {
            let mut buf = vec![0u8; 4];
            reader.read_exact(&mut buf).await.unwrap();
            buf
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!read.is_finished());

        local
            .complete_piece(PieceIndex::new(1), fixture.piece(1))
            .await
            .unwrap();
        let buf = read.await.unwrap();
        assert_eq!(buf, fixture.content[18..22].to_vec());
        assert!(torrent.piece_complete(PieceIndex::new(1)));
        assert!(!torrent.piece_complete(PieceIndex::new(0)));
    }

    #[tokio::test]
    async fn test_complete_piece_rejects_bad_data() {
        let (engine, _) = engine();
        let fixture = TorrentFixture::single_file("a.bin", 16, 40);
        engine.add_info_hash(fixture.info_hash).0.set_info_bytes(&fixture.info_bytes).unwrap();
        let local = engine.local_torrent(fixture.info_hash).unwrap();

        let result = local.complete_piece(PieceIndex::new(0), b"garbage").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_subscribers_see_completions_in_order() {
        let (engine, _) = engine();
        let fixture = TorrentFixture::single_file("a.bin", 16, 40);
        let (torrent, _) = engine.add_info_hash(fixture.info_hash);
        torrent.set_info_bytes(&fixture.info_bytes).unwrap();
        let local = engine.local_torrent(fixture.info_hash).unwrap();

        let mut subscription = torrent.subscribe_piece_changes();
        for index in [2, 0, 1] {
            local
                .complete_piece(PieceIndex::new(index), fixture.piece(index))
                .await
                .unwrap();
        }
        // Completing twice publishes once.
        local
            .complete_piece(PieceIndex::new(0), fixture.piece(0))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(subscription.recv().await.unwrap().index.as_u32());
        }
        assert_eq!(seen, vec![2, 0, 1]);
        subscription.close();
    }

    #[tokio::test]
    async fn test_existing_storage_pieces_are_found() {
        let (engine, storage) = engine();
        let fixture = TorrentFixture::single_file("a.bin", 16, 40);
        fixture.store_all(&storage).await;

        let (torrent, _) = engine.add_info_hash(fixture.info_hash);
        torrent.set_info_bytes(&fixture.info_bytes).unwrap();

        let mut reader = torrent.new_reader().unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, fixture.content);
        assert!((0..3).all(|i| torrent.piece_complete(PieceIndex::new(i))));
    }

    #[tokio::test]
    async fn test_drop_fails_pending_reads_and_releases_waiters() {
        let (engine, _) = engine();
        let fixture = TorrentFixture::single_file("a.bin", 16, 40);
        let (torrent, _) = engine.add_info_hash(fixture.info_hash);

        let waiter = {
            let torrent = Arc::clone(&torrent);
            tokio::spawn(async move { torrent.info_ready().await })
        };
        torrent.set_info_bytes(&fixture.info_bytes).unwrap();
        waiter.await.unwrap();

        let mut reader = torrent.new_reader().unwrap();
        let read = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        torrent.drop_torrent();
        assert!(read.await.unwrap().is_err());
        assert!(torrent.is_closed());
        assert!(engine.torrent(fixture.info_hash).is_none());
        assert!(matches!(
            torrent.new_reader(),
            Err(TorrentError::TorrentClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_merge_spec_dedups_trackers() {
        let (engine, _) = engine();
        let fixture = TorrentFixture::single_file("a.bin", 16, 40);
        let (torrent, _) = engine.add_info_hash(fixture.info_hash);

        let spec = TorrentSpec {
            trackers: vec![vec!["http://a".to_string(), "http://b".to_string()]],
            nodes: vec!["n:1".to_string()],
            ..TorrentSpec::default()
        };
        torrent.merge_spec(&spec).unwrap();
        torrent
            .merge_spec(&TorrentSpec {
                trackers: vec![vec!["http://b".to_string()], vec!["http://c".to_string()]],
                info_bytes: Some(fixture.info_bytes.clone()),
                ..TorrentSpec::default()
            })
            .unwrap();

        let metainfo = torrent.metainfo();
        assert_eq!(
            metainfo.announce_list,
            vec![
                vec!["http://a".to_string(), "http://b".to_string()],
                vec!["http://c".to_string()],
            ]
        );
        assert_eq!(metainfo.announce.as_deref(), Some("http://a"));
        assert_eq!(metainfo.info_bytes, fixture.info_bytes);

        let mut status = String::new();
        engine.write_status(&mut status).unwrap();
        assert!(status.contains("# Torrents: 1"));
        assert!(status.contains(&fixture.info_hash.to_string()));
    }
}
