//! Bounded model residency manager.
//!
//! Tracks which models are resident in the colocated engine and admits or
//! evicts them under two budgets: bytes on disk (`model_cache.size_bytes`)
//! and concurrently resident models (`serving.max_concurrent_models`).
//!
//! # Concurrency design
//!
//! One mutex guards all bookkeeping ([`CacheState`]); it is held only across
//! constant-time sections and eviction-victim selection, never across I/O.
//! The `lookup → plan eviction → insert Fetching` sequence is a single
//! critical section, which is what rules out double-fetch and lost-eviction
//! races. Each entry carries a `watch` channel as its ready condition:
//! waiters subscribe under the lock and await outside it, then re-check the
//! map.
//!
//! The admission itself (artifact fetch + engine reload) runs in a spawned
//! task, so a caller that goes away mid-load does not strand the other
//! waiters. Engine reloads are serialized by a dedicated async mutex and
//! always carry the complete resident set minus the entries being evicted.

mod entry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ModelCacheConfig;
use crate::engine::EngineReloader;
use crate::provider::ModelProvider;
use crate::telemetry;
use crate::{ModelKey, MuninError, Result};

pub use entry::EntryState;
use entry::{CacheEntry, LoadSignal};

/// Snapshot of cache occupancy, for status reporting and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries in `Loaded` or `Fetching` state.
    pub resident_models: usize,
    /// Bytes held by `Loaded` and `Evicting` entries.
    pub resident_bytes: u64,
    /// All entries, including `Evicting`.
    pub entries: usize,
}

/// The per-node model cache.
///
/// Cheap to clone; clones share one state.
#[derive(Clone)]
pub struct ModelCache {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<CacheState>,
    /// Serializes engine reloads so the engine always sees a consistent
    /// resident-set config.
    reload_lock: tokio::sync::Mutex<()>,
    provider: Arc<dyn ModelProvider>,
    engine: Arc<dyn EngineReloader>,
    model_dir: PathBuf,
    model_labels: bool,
}

struct CacheState {
    entries: HashMap<ModelKey, CacheEntry>,
    total_bytes: u64,
    max_bytes: u64,
    max_concurrent: usize,
    next_seq: u64,
}

/// RAII read handle returned by [`ModelCache::acquire`]. Dropping it
/// releases the reader count; the entry stays resident.
pub struct AcquireGuard {
    shared: Arc<Shared>,
    key: ModelKey,
}

impl Drop for AcquireGuard {
    fn drop(&mut self) {
        // A poisoned lock means the process is already tearing down.
        if let Ok(mut st) = self.shared.state.lock() {
            if let Some(e) = st.entries.get_mut(&self.key) {
                e.readers = e.readers.saturating_sub(1);
            }
        }
    }
}

enum Decision {
    Hit,
    Wait(watch::Receiver<LoadSignal>),
    Admit {
        victims: Vec<ModelKey>,
        rx: watch::Receiver<LoadSignal>,
    },
}

impl ModelCache {
    /// Create the cache, taking exclusive ownership of the host model
    /// directory. Stale content from a previous run is removed; entries are
    /// not recovered across restarts.
    pub fn new(
        config: &ModelCacheConfig,
        max_concurrent: usize,
        model_labels: bool,
        provider: Arc<dyn ModelProvider>,
        engine: Arc<dyn EngineReloader>,
    ) -> Result<Self> {
        let model_dir = config.host_model_path.clone();
        std::fs::create_dir_all(&model_dir)?;
        let mut removed = 0;
        for dir_entry in std::fs::read_dir(&model_dir)? {
            let dir_entry = dir_entry?;
            if dir_entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(dir_entry.path())?;
            } else {
                std::fs::remove_file(dir_entry.path())?;
            }
            removed += 1;
        }
        if removed > 0 {
            info!(path = %model_dir.display(), removed, "cleared stale model directory");
        }

        let cache = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    total_bytes: 0,
                    max_bytes: config.size_bytes,
                    max_concurrent,
                    next_seq: 0,
                }),
                reload_lock: tokio::sync::Mutex::new(()),
                provider,
                engine,
                model_dir,
                model_labels,
            }),
        };
        cache.shared.update_gauges_now();
        Ok(cache)
    }

    /// Ensure the engine has `key` loaded and pin it for reading.
    ///
    /// Returns a guard that releases the pin on drop. A hit touches the
    /// entry and returns immediately; a miss admits the model (evicting
    /// under budget pressure) and resolves once the engine acks the new
    /// resident set. Concurrent calls for the same key share one admission.
    pub async fn acquire(&self, key: &ModelKey) -> Result<AcquireGuard> {
        // Set once this call has admitted the key; the follow-up lookup
        // that claims the loaded entry must not count another hit.
        let mut admitted = false;
        loop {
            let decision = self.decide(key, &mut admitted)?;
            let mut rx = match decision {
                Decision::Hit => {
                    return Ok(AcquireGuard {
                        shared: self.shared.clone(),
                        key: key.clone(),
                    });
                }
                Decision::Wait(rx) => rx,
                Decision::Admit { victims, rx } => {
                    let shared = self.shared.clone();
                    let task_key = key.clone();
                    tokio::spawn(async move {
                        Shared::run_load(shared, task_key, victims).await;
                    });
                    rx
                }
            };

            if rx.changed().await.is_err() {
                // Sender dropped with its entry; take another look.
                continue;
            }
            let signal = rx.borrow().clone();
            if let LoadSignal::Failed(err) = signal {
                return Err(err.duplicate());
            }
            // Ready (or an eviction finalizer poking waiters): re-examine.
        }
    }

    /// One transactional pass over the state: lookup, and on a miss plan
    /// eviction and insert the `Fetching` entry.
    fn decide(&self, key: &ModelKey, admitted: &mut bool) -> Result<Decision> {
        let mut st = self.shared.lock_state()?;
        if let Some(e) = st.entries.get_mut(key) {
            return Ok(match e.state {
                EntryState::Loaded => {
                    e.touch();
                    e.readers += 1;
                    if !*admitted {
                        self.shared.record(telemetry::CACHE_HITS_TOTAL, key);
                    }
                    Decision::Hit
                }
                EntryState::Fetching | EntryState::Evicting => Decision::Wait(e.ready.subscribe()),
            });
        }

        let victims = match st.plan_eviction(0, true) {
            Ok(victims) => victims,
            Err(()) => {
                drop(st);
                self.shared.record(telemetry::CACHE_LOAD_FAILURES_TOTAL, key);
                return Err(MuninError::Exhausted {
                    model: key.to_string(),
                });
            }
        };

        let seq = st.next_seq;
        st.next_seq += 1;
        let new_entry = CacheEntry::new_fetching(seq);
        let rx = new_entry.ready.subscribe();
        st.entries.insert(key.clone(), new_entry);
        self.shared.update_gauges(&st);
        drop(st);

        *admitted = true;
        self.shared.record(telemetry::CACHE_MISSES_TOTAL, key);
        debug!(model = %key, "admitting model");
        Ok(Decision::Admit { victims, rx })
    }

    /// Keys currently `Loaded` or `Fetching`.
    pub fn resident_set(&self) -> Vec<ModelKey> {
        match self.shared.state.lock() {
            Ok(st) => st.resident_keys(),
            Err(_) => Vec::new(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        match self.shared.state.lock() {
            Ok(st) => CacheStats {
                resident_models: st.resident_count(),
                resident_bytes: st.total_bytes,
                entries: st.entries.len(),
            },
            Err(_) => CacheStats {
                resident_models: 0,
                resident_bytes: 0,
                entries: 0,
            },
        }
    }
}

impl Shared {
    fn lock_state(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|e| MuninError::Configuration(format!("cache state lock poisoned: {e}")))
    }

    /// Drive one admission to completion and signal every waiter.
    async fn run_load(shared: Arc<Shared>, key: ModelKey, mut victims: Vec<ModelKey>) {
        match Self::load(&shared, &key, &mut victims).await {
            Ok(evicted) => {
                for victim in &evicted {
                    shared.record(telemetry::CACHE_EVICTIONS_TOTAL, victim);
                    shared.remove_model_files(victim).await;
                }
                info!(model = %key, evicted = evicted.len(), "model loaded");
            }
            Err(err) => {
                warn!(model = %key, error = %err, "model load failed");
                shared.record(telemetry::CACHE_LOAD_FAILURES_TOTAL, &key);
                shared.fail_load(&key, &victims, err).await;
            }
        }
    }

    /// Fetch, re-plan the disk budget with the measured size, reload the
    /// engine, and flip the entry to `Loaded`. Returns the victims removed
    /// after the engine acked the reduced resident set.
    async fn load(
        shared: &Arc<Shared>,
        key: &ModelKey,
        victims: &mut Vec<ModelKey>,
    ) -> Result<Vec<ModelKey>> {
        let dest = shared.model_dir.join(&key.name).join(&key.version);
        // The per-model base path must exist before the engine sees the
        // resident-set config referencing it.
        tokio::fs::create_dir_all(shared.model_dir.join(&key.name)).await?;

        let measured = shared.provider.fetch(key, &dest).await?;

        // Size estimation for an unfetched model is zero, so the disk
        // budget is enforced here, reactively, with the measured size.
        {
            let mut st = shared.lock_state()?;
            match st.plan_eviction(measured, false) {
                Ok(more) => victims.extend(more),
                Err(()) => {
                    return Err(MuninError::Exhausted {
                        model: key.to_string(),
                    })
                }
            }
            if let Some(e) = st.entries.get_mut(key) {
                e.size_on_disk = measured;
            }
        }

        let resident = {
            let _serialized = shared.reload_lock.lock().await;
            let resident = shared.lock_state()?.resident_keys();
            shared.engine.reload(&resident).await?;
            resident
        };
        debug!(model = %key, resident = resident.len(), "engine ack");

        // Finalize: the reload above is the unload ack for the victims.
        let mut st = shared.lock_state()?;
        if let Some(e) = st.entries.get_mut(key) {
            e.state = EntryState::Loaded;
            e.touch();
            st.total_bytes += measured;
        }
        let mut evicted = Vec::with_capacity(victims.len());
        for victim in victims.drain(..) {
            if let Some(e) = st.entries.remove(&victim) {
                st.total_bytes = st.total_bytes.saturating_sub(e.size_on_disk);
                // Wake anyone parked on the evicted entry so they restart.
                e.ready.send_replace(LoadSignal::Ready);
                evicted.push(victim);
            }
        }
        if let Some(e) = st.entries.get(key) {
            e.ready.send_replace(LoadSignal::Ready);
        }
        shared.update_gauges(&st);
        Ok(evicted)
    }

    /// Undo a failed admission: drop the `Fetching` entry, restore the
    /// planned victims (the engine never acked their unload), and broadcast
    /// the failure.
    async fn fail_load(&self, key: &ModelKey, victims: &[ModelKey], err: MuninError) {
        let err = Arc::new(err);
        if let Ok(mut st) = self.state.lock() {
            for victim in victims {
                if let Some(e) = st.entries.get_mut(victim) {
                    e.state = EntryState::Loaded;
                    e.ready.send_replace(LoadSignal::Ready);
                }
            }
            if let Some(e) = st.entries.remove(key) {
                e.ready.send_replace(LoadSignal::Failed(err));
            }
            self.update_gauges(&st);
        }
        self.remove_model_files(key).await;
    }

    /// Best-effort removal of a model's on-disk tree.
    async fn remove_model_files(&self, key: &ModelKey) {
        let path = self.model_dir.join(&key.name).join(&key.version);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!(model = %key, "removed model files"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(model = %key, error = %e, "failed to remove model files"),
        }
    }

    fn record(&self, name: &'static str, key: &ModelKey) {
        if self.model_labels {
            metrics::counter!(
                name,
                "model" => key.name.clone(),
                "version" => key.version.clone()
            )
            .increment(1);
        } else {
            metrics::counter!(name).increment(1);
        }
    }

    fn update_gauges(&self, st: &CacheState) {
        metrics::gauge!(telemetry::CACHE_RESIDENT_MODELS).set(st.resident_count() as f64);
        metrics::gauge!(telemetry::CACHE_RESIDENT_BYTES).set(st.total_bytes as f64);
    }

    fn update_gauges_now(&self) {
        if let Ok(st) = self.state.lock() {
            self.update_gauges(&st);
        }
    }
}

impl CacheState {
    fn resident_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.state, EntryState::Loaded | EntryState::Fetching))
            .count()
    }

    fn resident_keys(&self) -> Vec<ModelKey> {
        let mut keys: Vec<ModelKey> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, EntryState::Loaded | EntryState::Fetching))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Mark least-recently-used idle entries `Evicting` until both budgets
    /// accommodate an incoming entry of `incoming` bytes. `reserve_slot` is
    /// set when the caller is about to insert a new `Fetching` entry.
    ///
    /// Errors when the budgets cannot be met even with every idle entry
    /// evicted; already-marked victims stay marked only on success.
    fn plan_eviction(&mut self, incoming: u64, reserve_slot: bool) -> std::result::Result<Vec<ModelKey>, ()> {
        let mut victims = Vec::new();
        let mut planned_free = 0u64;
        let slot = usize::from(reserve_slot);
        loop {
            let disk_ok = self.total_bytes.saturating_sub(planned_free) + incoming <= self.max_bytes;
            let concurrency_ok = self.resident_count() + slot <= self.max_concurrent;
            if disk_ok && concurrency_ok {
                return Ok(victims);
            }
            let victim = self
                .entries
                .iter_mut()
                .filter(|(_, e)| e.state == EntryState::Loaded && e.readers == 0)
                .min_by_key(|(_, e)| (e.last_access, e.inserted_seq));
            match victim {
                Some((k, e)) => {
                    e.state = EntryState::Evicting;
                    planned_free += e.size_on_disk;
                    victims.push(k.clone());
                }
                None => {
                    // Roll back: the admission fails but the map must not
                    // keep phantom Evicting entries.
                    for k in victims {
                        if let Some(e) = self.entries.get_mut(&k) {
                            e.state = EntryState::Loaded;
                        }
                    }
                    return Err(());
                }
            }
        }
    }
}
