//! Reference-counted registry of live sessions.
//!
//! Requests borrow a torrent through [`SessionRegistry::acquire`] and give it
//! back by dropping the returned [`SessionLease`]. When the last lease goes,
//! an eviction timer is armed. Acquiring again before it fires cancels it.
//! When it fires with the count still at zero the entry is removed and the
//! policy's eviction hook runs.
//!
//! All transitions happen under one mutex, so acquire, release and eviction
//! are linearizable per info hash.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::engine::{Torrent, TorrentEngine};
use crate::policy::SessionPolicy;
use crate::torrent::InfoHash;

/// Shared registry handle. Clones refer to the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    engine: Arc<dyn TorrentEngine>,
    policy: Arc<dyn SessionPolicy>,
    grace: Duration,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<InfoHash, Entry>,
    next_timer: u64,
}

struct Entry {
    torrent: Arc<dyn Torrent>,
    refs: usize,
    pending: Option<PendingEviction>,
}

struct PendingEviction {
    timer: u64,
    task: JoinHandle<()>,
}

/// Result of [`SessionRegistry::acquire`].
pub struct Acquired {
    pub torrent: Arc<dyn Torrent>,
    /// True the first time the info hash is acquired since it was last evicted.
    pub is_new: bool,
    /// True when the engine created the torrent for this acquire. An evicted
    /// torrent the policy left open is reused and reports false.
    pub engine_new: bool,
    pub lease: SessionLease,
}

impl SessionRegistry {
    pub fn new(
        engine: Arc<dyn TorrentEngine>,
        policy: Arc<dyn SessionPolicy>,
        grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                engine,
                policy,
                grace,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Borrows the session for `info_hash`, creating it if needed.
    ///
    /// Cancels any pending eviction for it. The session cannot be evicted
    /// while the returned lease is alive.
    pub fn acquire(&self, info_hash: InfoHash) -> Acquired {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let (torrent, is_new, engine_new) = match state.entries.get_mut(&info_hash) {
            Some(entry) => {
                if let Some(pending) = entry.pending.take() {
                    pending.task.abort();
                    tracing::debug!("Cancelled eviction of {}", info_hash);
                }
                entry.refs += 1;
                if entry.torrent.is_closed() {
                    // Dropped behind our back; later acquirers get a fresh one.
                    let (torrent, engine_new) = self.inner.engine.add_info_hash(info_hash);
                    entry.torrent = torrent;
                    (Arc::clone(&entry.torrent), true, engine_new)
                } else {
                    (Arc::clone(&entry.torrent), false, false)
                }
            }
            None => {
                let (torrent, engine_new) = self.inner.engine.add_info_hash(info_hash);
                state.entries.insert(
                    info_hash,
                    Entry {
                        torrent: Arc::clone(&torrent),
                        refs: 1,
                        pending: None,
                    },
                );
                (torrent, true, engine_new)
            }
        };
        drop(guard);

        Acquired {
            torrent,
            is_new,
            engine_new,
            lease: SessionLease {
                registry: Arc::clone(&self.inner),
                info_hash,
                released: false,
            },
        }
    }

    /// Outstanding leases for `info_hash`.
    pub fn ref_count(&self, info_hash: InfoHash) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .get(&info_hash)
            .map_or(0, |entry| entry.refs)
    }

    /// True while the registry holds a session, leased or in its grace period.
    pub fn contains(&self, info_hash: InfoHash) -> bool {
        self.inner.state.lock().entries.contains_key(&info_hash)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn engine(&self) -> &Arc<dyn TorrentEngine> {
        &self.inner.engine
    }

    pub fn grace(&self) -> Duration {
        self.inner.grace
    }
}

impl RegistryInner {
    fn release(self: &Arc<Self>, info_hash: InfoHash) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(entry) = state.entries.get_mut(&info_hash) else {
            panic!("released {info_hash} which has no registry entry");
        };
        entry.refs = match entry.refs.checked_sub(1) {
            Some(refs) => refs,
            None => panic!("reference count underflow for {info_hash}"),
        };
        if entry.refs > 0 {
            return;
        }

        let timer = state.next_timer;
        state.next_timer += 1;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = Arc::clone(self);
                let grace = self.grace;
                let task = handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    registry.expire(info_hash, timer);
                });
                entry.pending = Some(PendingEviction { timer, task });
            }
            Err(_) => {
                // No runtime to wait on; evict now.
                let entry = state.entries.remove(&info_hash);
                drop(guard);
                if let Some(entry) = entry {
                    self.run_eviction_hook(info_hash, &entry.torrent);
                }
            }
        }
    }

    /// Evicts `info_hash` if `timer` is still the armed one and nobody
    /// re-acquired it.
    fn expire(&self, info_hash: InfoHash, timer: u64) {
        let mut state = self.state.lock();
        let armed = state.entries.get(&info_hash).is_some_and(|entry| {
            entry.refs == 0 && entry.pending.as_ref().is_some_and(|p| p.timer == timer)
        });
        if !armed {
            return;
        }
        let Some(entry) = state.entries.remove(&info_hash) else {
            return;
        };
        tracing::debug!("Grace period for {} expired", info_hash);
        // Hook runs with the registry lock held.
        self.run_eviction_hook(info_hash, &entry.torrent);
    }

    fn run_eviction_hook(&self, info_hash: InfoHash, torrent: &Arc<dyn Torrent>) {
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.policy.on_grace_expired(torrent)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Eviction hook for {} failed: {}", info_hash, e),
            Err(_) => tracing::error!("Eviction hook for {} panicked", info_hash),
        }
    }
}

/// A borrowed reference to a session.
///
/// Releasing is idempotent. Dropping an unreleased lease releases it.
pub struct SessionLease {
    registry: Arc<RegistryInner>,
    info_hash: InfoHash,
    released: bool,
}

impl SessionLease {
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.release(self.info_hash);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("info_hash", &self.info_hash)
            .field("released", &self.released)
            .finish()
    }
}
