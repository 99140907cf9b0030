//! Cache entry bookkeeping types.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::MuninError;

/// Residency state of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Admission in flight: artifact fetch or engine reload pending.
    Fetching,
    /// Resident in the engine and servable.
    Loaded,
    /// Selected for eviction; removed once the engine acks the reduced
    /// resident set. Never holds readers.
    Evicting,
}

/// Terminal signal of one admission round, broadcast to waiters.
#[derive(Clone)]
pub(crate) enum LoadSignal {
    Pending,
    Ready,
    Failed(Arc<MuninError>),
}

/// Per-model bookkeeping. All fields are guarded by the cache-wide mutex.
pub(crate) struct CacheEntry {
    pub size_on_disk: u64,
    pub last_access: Instant,
    /// Monotonic insertion counter; breaks `last_access` ties in eviction
    /// planning.
    pub inserted_seq: u64,
    pub state: EntryState,
    pub readers: u32,
    /// One-shot-per-transition signal: waiters subscribe under the lock and
    /// await outside it, then re-check the map.
    pub ready: watch::Sender<LoadSignal>,
}

impl CacheEntry {
    pub fn new_fetching(seq: u64) -> Self {
        let (ready, _) = watch::channel(LoadSignal::Pending);
        Self {
            size_on_disk: 0,
            last_access: Instant::now(),
            inserted_seq: seq,
            state: EntryState::Fetching,
            readers: 0,
            ready,
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}
