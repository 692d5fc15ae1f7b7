//! Single-key fetcher: one outstanding retrieval of a keyed block.
//!
//! The fetcher registers with the request scheduler and is then driven
//! entirely through callbacks:
//!
//! - The scheduler polls `choose_key` to ask whether the fetcher is
//!   ready to send. Readiness is gated by whether the key is already
//!   in flight and by the node's recently-failed memo.
//! - Low-level failures flow through [SingleKeyFetcher::retry], which
//!   keeps the retry budget and decides when to enter a cooldown
//!   period instead of hammering the network.
//! - The key-listener path delivers arrived blocks through
//!   `on_got_key`; decoded blocks are handed to the owning request
//!   through its [FetchDelegate].
//!
//! Retry counts for unbounded budgets live on the cooldown tracker
//! item, which shares its lifetime with the scheduler registration;
//! bounded counts live on the fetcher itself. This keeps tracker
//! memory flat for short-lived fetches.

use crate::cooldown::CooldownTracker;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warren_api::*;

/// Fetcher configuration types.
pub mod config {
    use super::*;

    /// Configuration parameters for the single-key fetcher.
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct FetcherModConfig {
        /// Attempts between successive cooldown periods. Default: 3.
        #[serde(default = "default_cooldown_retries")]
        pub cooldown_retries: u32,
        /// Length of one cooldown period in milliseconds.
        /// Default: 30 min.
        #[serde(default = "default_cooldown_time_ms")]
        pub cooldown_time_ms: u64,
    }

    fn default_cooldown_retries() -> u32 {
        COOLDOWN_RETRIES
    }

    fn default_cooldown_time_ms() -> u64 {
        30 * 60 * 1000
    }

    impl Default for FetcherModConfig {
        fn default() -> Self {
            Self {
                cooldown_retries: default_cooldown_retries(),
                cooldown_time_ms: default_cooldown_time_ms(),
            }
        }
    }

    impl warren_api::config::ModConfig for FetcherModConfig {}

    impl FetcherModConfig {
        /// Build a fetch context from these parameters.
        pub fn to_context(
            &self,
            local_request_only: bool,
        ) -> Arc<FetchContext> {
            FetchContext::new(
                self.cooldown_retries,
                Duration::from_millis(self.cooldown_time_ms),
                local_request_only,
            )
        }
    }
}

#[derive(Debug)]
struct FetcherState {
    retry_count: u32,
    cancelled: bool,
    finished: bool,
    // 0/0 means "not read from the context yet"; a context with both
    // values zero is indistinguishable from that, which is fine
    // because rereading it is idempotent.
    cached_cooldown_tries: u32,
    cached_cooldown_time: Duration,
}

/// Drives one key through scheduler registration, cooldown, and
/// success/failure.
#[derive(Debug)]
pub struct SingleKeyFetcher {
    id: FetcherId,
    key: ClientKey,
    /// `None` is an unbounded budget.
    max_retries: Option<u32>,
    real_time: bool,
    ctx: Arc<FetchContext>,
    scheduler: DynRequestScheduler,
    cooldown: Arc<CooldownTracker>,
    delegate: DynFetchDelegate,
    state: Mutex<FetcherState>,
}

impl SingleKeyFetcher {
    /// Construct a new SingleKeyFetcher. It does nothing until
    /// [schedule](Self::schedule)d.
    pub fn new(
        key: ClientKey,
        max_retries: Option<u32>,
        real_time: bool,
        ctx: Arc<FetchContext>,
        scheduler: DynRequestScheduler,
        cooldown: Arc<CooldownTracker>,
        delegate: DynFetchDelegate,
    ) -> Arc<Self> {
        let id = FetcherId::next();
        tracing::trace!(?id, key = %key.routing_key(), "creating fetcher");
        Arc::new(Self {
            id,
            key,
            max_retries,
            real_time,
            ctx,
            scheduler,
            cooldown,
            delegate,
            state: Mutex::new(FetcherState {
                retry_count: 0,
                cancelled: false,
                finished: false,
                cached_cooldown_tries: 0,
                cached_cooldown_time: Duration::ZERO,
            }),
        })
    }

    /// The key being fetched.
    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    /// Register with the scheduler.
    pub fn schedule(self: &Arc<Self>) -> WrnResult<()> {
        self.scheduler.register(self.clone(), false)
    }

    /// Re-register with the scheduler without reinstalling key
    /// listeners.
    pub fn reschedule(self: &Arc<Self>) -> WrnResult<()> {
        self.scheduler.register(self.clone(), true)
    }

    /// Whether there is nothing left to fetch: the block arrived (and
    /// possibly failed to decode, which is fatal for the attempt) or
    /// the fetch was cancelled.
    pub fn is_empty(&self) -> bool {
        let lock = self.state.lock().unwrap();
        lock.cancelled || lock.finished
    }

    /// Whether the fetch was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Try again after a retriable failure. Returns whether the
    /// fetcher will retry.
    pub fn retry(&self) -> bool {
        if self.is_empty() {
            tracing::trace!(id = ?self.id, "not retrying because empty");
            return false;
        }
        // We want 0, 1, ... max i.e. max+1 attempts (max=0 means try
        // once with no retries).
        let r = match self.max_retries {
            None => self.cooldown.with_item(self.id, |item| {
                item.retry_count += 1;
                item.retry_count
            }),
            Some(_) => {
                let mut lock = self.state.lock().unwrap();
                lock.retry_count += 1;
                lock.retry_count
            }
        };
        tracing::debug!(
            id = ?self.id,
            max = ?self.max_retries,
            current = r,
            "attempting to retry",
        );
        if let Some(max) = self.max_retries {
            if r > max {
                self.unregister();
                return false;
            }
        }
        self.check_cached_cooldown_data();
        let (tries, time) = {
            let lock = self.state.lock().unwrap();
            (lock.cached_cooldown_tries, lock.cached_cooldown_time)
        };
        if tries == 0 || r % tries == 0 {
            // Enter the cooldown queue. Don't reschedule yet.
            let now = Timestamp::now();
            let entered = self.cooldown.with_item(self.id, |item| {
                if item.cooldown_wakeup > now {
                    None
                } else {
                    item.cooldown_wakeup = now + time;
                    Some(item.cooldown_wakeup)
                }
            });
            match entered {
                None => {
                    tracing::error!(
                        id = ?self.id,
                        "already on the cooldown queue",
                    );
                }
                Some(wake) => {
                    tracing::debug!(
                        id = ?self.id,
                        ?wake,
                        "entering cooldown",
                    );
                    self.cooldown.set_cached_wakeup(wake, self.id, true);
                    self.delegate.on_enter_finite_cooldown();
                }
            }
            true
        } else {
            // Clear the cached wakeup so the scheduler re-polls
            // immediately.
            self.cooldown.clear_cached_wakeup(self.id);
            true
        }
    }

    fn check_cached_cooldown_data(&self) {
        {
            let lock = self.state.lock().unwrap();
            if !(lock.cached_cooldown_tries == 0
                && lock.cached_cooldown_time == Duration::ZERO)
            {
                return;
            }
        }
        self.reread_cooldown_data();
    }

    fn reread_cooldown_data(&self) {
        let tries = self.ctx.cooldown_retries();
        let time = self.ctx.cooldown_time();
        let mut lock = self.state.lock().unwrap();
        lock.cached_cooldown_tries = tries;
        lock.cached_cooldown_time = time;
    }

    /// Reread the cached cooldown values after the fetch context
    /// changed.
    pub fn on_changed_fetch_context(&self) {
        if self.is_empty() {
            return;
        }
        self.reread_cooldown_data();
    }

    /// Low-level success path: attempt to verify/decode the block and
    /// dispatch to the delegate.
    pub fn on_success(&self, block: KeyBlock, from_store: bool) {
        match ClientKeyBlock::decode(&self.key, block) {
            Ok(decoded) => self.delegate.on_fetched(decoded, from_store),
            Err(e) => {
                tracing::debug!(id = ?self.id, %e, "block decode error");
                self.delegate.on_block_decode_error();
            }
        }
    }

    /// Cancel: unregister from the scheduler and the cooldown
    /// tracker. Callbacks already in flight become no-ops.
    pub fn cancel(&self) {
        {
            self.state.lock().unwrap().cancelled = true;
        }
        self.unregister_all();
    }

    /// Called before the request goes to the network. Returns true if
    /// the request was consumed (local-only context and the key was
    /// not in the store).
    pub fn pre_register(&self, to_network: bool) -> bool {
        if !to_network {
            return false;
        }
        if self.ctx.local_request_only() {
            self.delegate.not_found_in_store();
            return true;
        }
        false
    }

    /// Remove the pending-key listeners and then remove from the
    /// queue as well.
    fn unregister_all(&self) {
        self.scheduler.remove_pending_keys(self.id, false);
        self.unregister();
    }

    fn unregister(&self) {
        self.cooldown.remove(self.id);
        self.scheduler.unregister(self.id);
    }
}

impl SchedulableFetcher for SingleKeyFetcher {
    fn fetcher_id(&self) -> FetcherId {
        self.id
    }

    fn choose_key(
        &self,
        already_fetching: &DynKeysFetching,
    ) -> Option<WorkToken> {
        let k = self.key.routing_key();
        if already_fetching.has_key(k, self.id) {
            return None;
        }
        let l = already_fetching.check_recently_failed(k, self.real_time);
        let now = Timestamp::now();
        if l > Timestamp::ZERO && l > now {
            let absorb = match self.max_retries {
                None => true,
                Some(max) => max >= COOLDOWN_RETRIES,
            };
            if absorb {
                tracing::debug!(
                    id = ?self.id,
                    until = ?l,
                    "recently failed, entering cooldown",
                );
                self.cooldown.with_item(self.id, |item| {
                    item.cooldown_wakeup = item.cooldown_wakeup.max(l);
                });
            } else {
                self.delegate.on_failure(FetchError::RecentlyFailed);
            }
            return None;
        }
        Some(WorkToken)
    }

    fn list_keys(&self) -> Vec<RoutingKey> {
        if self.is_empty() {
            return Vec::new();
        }
        vec![self.key.routing_key().clone()]
    }

    fn get_cooldown_time(&self, now: Timestamp) -> CooldownState {
        {
            let lock = self.state.lock().unwrap();
            if lock.cancelled || lock.finished {
                return CooldownState::Finished;
            }
        }
        let wake = self.cooldown.with_item(self.id, |item| {
            if item.cooldown_wakeup <= now {
                item.cooldown_wakeup = Timestamp::ZERO;
            }
            item.cooldown_wakeup
        });
        if wake == Timestamp::ZERO {
            let fetching = self.scheduler.fetching_keys();
            if fetching.has_key(self.key.routing_key(), self.id) {
                // Hierarchical cooldown: the request is already
                // running elsewhere. Never stored on the tracker.
                return CooldownState::Fetching;
            }
            return CooldownState::Ready;
        }
        self.cooldown.set_cached_wakeup(wake, self.id, true);
        CooldownState::WakeAt(wake)
    }

    fn on_got_key(&self, key: RoutingKey, block: KeyBlock) {
        {
            let mut lock = self.state.lock().unwrap();
            if lock.finished {
                tracing::trace!(
                    id = ?self.id,
                    "on_got_key called twice",
                );
                return;
            }
            if lock.cancelled {
                return;
            }
            if key != *self.key.routing_key() {
                drop(lock);
                tracing::warn!(
                    id = ?self.id,
                    got = %key,
                    want = %self.key.routing_key(),
                    "got sent key but want another",
                );
                return;
            }
            lock.finished = true;
        }
        // Key has already been removed from the pending set.
        self.unregister();
        self.on_success(block, false);
    }
}
