//! Per-request cooldown accounting.
//!
//! The tracker keeps two structures keyed by fetcher identity: the
//! tracker items themselves (retry count plus earliest-wake
//! timestamp), and a cache of wakeup hints the scheduler consults so
//! it can skip polling a fetcher until its cooldown has passed.
//!
//! A wakeup of [Timestamp::ZERO] means "not in cooldown". A wakeup in
//! the future means the fetcher stays scheduler-visible but must not
//! be selected; once the wakeup has passed the fetcher is eligible
//! again.

use std::collections::HashMap;
use std::sync::Mutex;
use warren_api::{FetcherId, Timestamp};

/// Retry count and cooldown wakeup for one fetcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CooldownTrackerItem {
    /// Retries so far, for fetchers with an unbounded budget.
    pub retry_count: u32,
    /// Absolute wall-clock wakeup time. [Timestamp::ZERO] when not in
    /// cooldown.
    pub cooldown_wakeup: Timestamp,
}

impl Default for CooldownTrackerItem {
    fn default() -> Self {
        Self {
            retry_count: 0,
            cooldown_wakeup: Timestamp::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct CooldownInner {
    items: HashMap<FetcherId, CooldownTrackerItem>,
    cached_wakeups: HashMap<FetcherId, Timestamp>,
}

/// The cooldown tracker shared by every fetcher on a node.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    inner: Mutex<CooldownInner>,
}

impl CooldownTracker {
    /// Construct a new CooldownTracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (a snapshot of) the item for a fetcher, creating it with
    /// zeros if absent. Idempotent.
    pub fn make(&self, fetcher: FetcherId) -> CooldownTrackerItem {
        *self
            .inner
            .lock()
            .unwrap()
            .items
            .entry(fetcher)
            .or_default()
    }

    /// Run a closure against the (created-if-absent) item for a
    /// fetcher, under the tracker lock.
    pub fn with_item<R>(
        &self,
        fetcher: FetcherId,
        f: impl FnOnce(&mut CooldownTrackerItem) -> R,
    ) -> R {
        f(self
            .inner
            .lock()
            .unwrap()
            .items
            .entry(fetcher)
            .or_default())
    }

    /// Drop all state for a fetcher.
    pub fn remove(&self, fetcher: FetcherId) {
        let mut lock = self.inner.lock().unwrap();
        lock.items.remove(&fetcher);
        lock.cached_wakeups.remove(&fetcher);
    }

    /// Record a hint so the scheduler can skip polling the fetcher
    /// until `time`. If `force` is false and an earlier wake is
    /// already cached, the earlier one is kept.
    pub fn set_cached_wakeup(
        &self,
        time: Timestamp,
        fetcher: FetcherId,
        force: bool,
    ) {
        let mut lock = self.inner.lock().unwrap();
        let entry = lock.cached_wakeups.entry(fetcher).or_insert(time);
        if force || time < *entry {
            *entry = time;
        }
    }

    /// The cached wakeup hint for a fetcher, if any.
    pub fn cached_wakeup(&self, fetcher: FetcherId) -> Option<Timestamp> {
        self.inner
            .lock()
            .unwrap()
            .cached_wakeups
            .get(&fetcher)
            .copied()
    }

    /// Drop the cached wakeup hint so the scheduler re-polls the
    /// fetcher immediately.
    pub fn clear_cached_wakeup(&self, fetcher: FetcherId) {
        self.inner.lock().unwrap().cached_wakeups.remove(&fetcher);
    }
}
