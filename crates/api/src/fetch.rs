//! Fetch-side collaborator traits.
//!
//! A fetch is one outstanding retrieval of a keyed block. The fetcher
//! registers with a scheduler; the scheduler calls back into the
//! fetcher to pick work; cooldown and recently-failed suppression
//! gate what the fetcher offers. The scheduler's own queue structure
//! is an environment concern.

use crate::{
    ClientKeyBlock, FetchError, KeyBlock, RoutingKey, Timestamp,
    WrnResult,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Number of attempts between successive cooldown periods at the
/// scheduler level. A bounded retry budget smaller than this cannot
/// absorb a recently-failed memo as cooldown and surfaces it instead.
pub const COOLDOWN_RETRIES: u32 = 3;

/// Process-unique identity of one fetcher. The cooldown tracker and
/// the scheduler's fetching view key their per-request state by this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FetcherId(pub u64);

impl FetcherId {
    /// Allocate a fresh process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The synthetic work item a ready fetcher hands to the scheduler.
/// There is exactly one key per fetcher, so the item carries no data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkToken;

/// The cooldown-visible state of a fetcher at one point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownState {
    /// The fetcher is finished or cancelled; drop it from the queue.
    Finished,
    /// The fetcher is eligible for selection right now.
    Ready,
    /// The key is currently being fetched by someone else; poll again
    /// when that fetch resolves (hierarchical cooldown, never stored
    /// on the tracker).
    Fetching,
    /// In cooldown until the given wall-clock time.
    WakeAt(Timestamp),
}

/// Runtime-changeable fetch parameters shared by reference with the
/// fetchers using them.
#[derive(Debug)]
pub struct FetchContext {
    inner: Mutex<FetchParams>,
}

#[derive(Clone, Copy, Debug)]
struct FetchParams {
    cooldown_retries: u32,
    cooldown_time: Duration,
    local_request_only: bool,
}

impl FetchContext {
    /// Construct a new FetchContext.
    pub fn new(
        cooldown_retries: u32,
        cooldown_time: Duration,
        local_request_only: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FetchParams {
                cooldown_retries,
                cooldown_time,
                local_request_only,
            }),
        })
    }

    /// Attempts between successive cooldown periods.
    pub fn cooldown_retries(&self) -> u32 {
        self.inner.lock().unwrap().cooldown_retries
    }

    /// Length of one cooldown period.
    pub fn cooldown_time(&self) -> Duration {
        self.inner.lock().unwrap().cooldown_time
    }

    /// Whether the fetch must not leave the local store.
    pub fn local_request_only(&self) -> bool {
        self.inner.lock().unwrap().local_request_only
    }

    /// Change the cooldown parameters at runtime. Fetchers must be
    /// told through their `on_changed_fetch_context` to pick the new
    /// values up.
    pub fn set_cooldown(
        &self,
        cooldown_retries: u32,
        cooldown_time: Duration,
    ) {
        let mut lock = self.inner.lock().unwrap();
        lock.cooldown_retries = cooldown_retries;
        lock.cooldown_time = cooldown_time;
    }
}

/// The scheduler's view of what is currently being fetched.
pub trait KeysFetching: 'static + Send + Sync + std::fmt::Debug {
    /// Whether the key is currently in flight for someone other than
    /// the asking fetcher.
    fn has_key(&self, key: &RoutingKey, asking: FetcherId) -> bool;

    /// The earliest time at which a recently-failed memo for the key
    /// expires, or [Timestamp::ZERO] when there is none.
    fn check_recently_failed(
        &self,
        key: &RoutingKey,
        real_time: bool,
    ) -> Timestamp;
}

/// Trait-object [KeysFetching].
pub type DynKeysFetching = Arc<dyn KeysFetching>;

/// What the scheduler calls back into when it polls a registered
/// fetcher.
pub trait SchedulableFetcher:
    'static + Send + Sync + std::fmt::Debug
{
    /// The identity of this fetcher.
    fn fetcher_id(&self) -> FetcherId;

    /// Scheduler hook: pick work. Returns the synthetic work token
    /// when the fetcher is ready to send, else nothing.
    fn choose_key(
        &self,
        already_fetching: &DynKeysFetching,
    ) -> Option<WorkToken>;

    /// The keys this fetcher is listening for. Empty once finished or
    /// cancelled.
    fn list_keys(&self) -> Vec<RoutingKey>;

    /// The cooldown-visible state at `now`.
    fn get_cooldown_time(&self, now: Timestamp) -> CooldownState;

    /// Key-listener path: a block for the key has arrived.
    fn on_got_key(&self, key: RoutingKey, block: KeyBlock);
}

/// Trait-object [SchedulableFetcher].
pub type DynSchedulableFetcher = Arc<dyn SchedulableFetcher>;

/// The request scheduler the fetchers register with. The queue data
/// structure behind it is an environment concern.
pub trait RequestScheduler: 'static + Send + Sync + std::fmt::Debug {
    /// Register a fetcher. `reschedule` re-registers an already-known
    /// fetcher without reinstalling its key listeners.
    fn register(
        &self,
        fetcher: DynSchedulableFetcher,
        reschedule: bool,
    ) -> WrnResult<()>;

    /// Remove the pending-key listeners of a fetcher. `complain`
    /// logs when there was nothing to remove.
    fn remove_pending_keys(&self, fetcher: FetcherId, complain: bool);

    /// Remove a fetcher from the queue.
    fn unregister(&self, fetcher: FetcherId);

    /// The view of what is currently being fetched.
    fn fetching_keys(&self) -> DynKeysFetching;
}

/// Trait-object [RequestScheduler].
pub type DynRequestScheduler = Arc<dyn RequestScheduler>;

/// The outcome hooks of a single-key fetch, implemented by whoever
/// owns the fetcher (e.g. the parent request pulling a block into a
/// larger download).
pub trait FetchDelegate: 'static + Send + Sync + std::fmt::Debug {
    /// The block arrived and decoded successfully.
    fn on_fetched(&self, block: ClientKeyBlock, from_store: bool);

    /// The block arrived but failed to verify or decode. Fatal for
    /// the attempt.
    fn on_block_decode_error(&self);

    /// The key was not in the local store and the context forbids
    /// going to the network.
    fn not_found_in_store(&self);

    /// A low-level failure surfaced past the retry logic.
    fn on_failure(&self, e: FetchError);

    /// The fetcher entered a finite cooldown period.
    fn on_enter_finite_cooldown(&self) {}
}

/// Trait-object [FetchDelegate].
pub type DynFetchDelegate = Arc<dyn FetchDelegate>;
