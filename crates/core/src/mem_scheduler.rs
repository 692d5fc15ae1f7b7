//! In-memory request scheduler.
//!
//! Keeps the registered fetchers, the set of keys currently in
//! flight, and a recently-failed memo, all in one mutex-guarded map
//! bundle. There is no queue fairness or priority here: embedders
//! and tests drive registered fetchers explicitly through
//! [MemScheduler::poll].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use warren_api::*;

#[derive(Debug, Default)]
struct SchedState {
    registered: HashMap<FetcherId, DynSchedulableFetcher>,
    register_calls: u64,
    in_flight: HashMap<RoutingKey, FetcherId>,
    recently_failed: HashMap<RoutingKey, Timestamp>,
}

#[derive(Debug, Default)]
struct MemSchedulerInner {
    state: Mutex<SchedState>,
}

/// An in-memory [RequestScheduler].
#[derive(Debug, Default)]
pub struct MemScheduler {
    inner: Arc<MemSchedulerInner>,
}

impl MemScheduler {
    /// Construct a new MemScheduler.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record that a key was asked for and failed recently; fetchers
    /// polling for it before `until` will be suppressed or put into
    /// cooldown depending on their retry budget.
    pub fn note_recently_failed(&self, key: RoutingKey, until: Timestamp) {
        self.inner
            .state
            .lock()
            .unwrap()
            .recently_failed
            .insert(key, until);
    }

    /// Mark a key as in flight on behalf of a fetcher.
    pub fn mark_fetching(&self, key: RoutingKey, owner: FetcherId) {
        self.inner.state.lock().unwrap().in_flight.insert(key, owner);
    }

    /// Clear the in-flight marking for a key.
    pub fn clear_fetching(&self, key: &RoutingKey) {
        self.inner.state.lock().unwrap().in_flight.remove(key);
    }

    /// Whether a fetcher is currently registered.
    pub fn is_registered(&self, fetcher: FetcherId) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .registered
            .contains_key(&fetcher)
    }

    /// How many times `register` has been called, including
    /// reschedules.
    pub fn register_calls(&self) -> u64 {
        self.inner.state.lock().unwrap().register_calls
    }

    /// Drive one registered fetcher: ask it to choose work the way
    /// the real queue would.
    pub fn poll(&self, fetcher: FetcherId) -> Option<WorkToken> {
        let f = self
            .inner
            .state
            .lock()
            .unwrap()
            .registered
            .get(&fetcher)
            .cloned()?;
        let view = self.fetching_keys();
        f.choose_key(&view)
    }
}

impl RequestScheduler for MemScheduler {
    fn register(
        &self,
        fetcher: DynSchedulableFetcher,
        _reschedule: bool,
    ) -> WrnResult<()> {
        let mut lock = self.inner.state.lock().unwrap();
        lock.register_calls += 1;
        lock.registered.insert(fetcher.fetcher_id(), fetcher);
        Ok(())
    }

    fn remove_pending_keys(&self, fetcher: FetcherId, complain: bool) {
        let found = self
            .inner
            .state
            .lock()
            .unwrap()
            .registered
            .contains_key(&fetcher);
        if complain && !found {
            tracing::warn!(?fetcher, "no pending keys to remove");
        }
    }

    fn unregister(&self, fetcher: FetcherId) {
        let mut lock = self.inner.state.lock().unwrap();
        lock.registered.remove(&fetcher);
        lock.in_flight.retain(|_, owner| *owner != fetcher);
    }

    fn fetching_keys(&self) -> DynKeysFetching {
        Arc::new(MemKeysFetching {
            inner: self.inner.clone(),
        })
    }
}

#[derive(Debug)]
struct MemKeysFetching {
    inner: Arc<MemSchedulerInner>,
}

impl KeysFetching for MemKeysFetching {
    fn has_key(&self, key: &RoutingKey, asking: FetcherId) -> bool {
        match self.inner.state.lock().unwrap().in_flight.get(key) {
            Some(owner) => *owner != asking,
            None => false,
        }
    }

    fn check_recently_failed(
        &self,
        key: &RoutingKey,
        _real_time: bool,
    ) -> Timestamp {
        self.inner
            .state
            .lock()
            .unwrap()
            .recently_failed
            .get(key)
            .copied()
            .unwrap_or(Timestamp::ZERO)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    #[derive(Debug)]
    struct NullFetcher(FetcherId);

    impl SchedulableFetcher for NullFetcher {
        fn fetcher_id(&self) -> FetcherId {
            self.0
        }

        fn choose_key(
            &self,
            _already_fetching: &DynKeysFetching,
        ) -> Option<WorkToken> {
            Some(WorkToken)
        }

        fn list_keys(&self) -> Vec<RoutingKey> {
            Vec::new()
        }

        fn get_cooldown_time(&self, _now: Timestamp) -> CooldownState {
            CooldownState::Ready
        }

        fn on_got_key(&self, _key: RoutingKey, _block: KeyBlock) {}
    }

    #[test]
    fn register_unregister() {
        let sched = MemScheduler::create();
        let id = FetcherId::next();
        let f: DynSchedulableFetcher = Arc::new(NullFetcher(id));
        sched.register(f, false).unwrap();
        assert!(sched.is_registered(id));
        assert_eq!(Some(WorkToken), sched.poll(id));
        sched.unregister(id);
        assert!(!sched.is_registered(id));
        assert_eq!(None, sched.poll(id));
    }

    #[test]
    fn fetching_view_excludes_owner() {
        let sched = MemScheduler::create();
        let key = RoutingKey::from(Bytes::from_static(b"k"));
        let me = FetcherId::next();
        let other = FetcherId::next();
        sched.mark_fetching(key.clone(), other);
        let view = sched.fetching_keys();
        assert!(view.has_key(&key, me));
        assert!(!view.has_key(&key, other));
        sched.clear_fetching(&key);
        assert!(!view.has_key(&key, me));
    }

    #[test]
    fn recently_failed_memo() {
        let sched = MemScheduler::create();
        let key = RoutingKey::from(Bytes::from_static(b"k"));
        let view = sched.fetching_keys();
        assert_eq!(
            Timestamp::ZERO,
            view.check_recently_failed(&key, false),
        );
        let until = Timestamp::now() + std::time::Duration::from_secs(5);
        sched.note_recently_failed(key.clone(), until);
        assert_eq!(until, view.check_recently_failed(&key, false));
    }
}
