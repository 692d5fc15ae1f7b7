//! Node-side collaborator traits.
//!
//! These are the seams between the request handler state machine and
//! its environment: the source peer's transport queue, the downstream
//! request sender, the packet-level block transmitter, and the node
//! itself (store lookup, UID bookkeeping, statistics).

use crate::{
    protocol::WireProto, BoxFut, DynPartialBlock, KeyBlock, NodeKey,
    WrnResult,
};
use bytes::Bytes;
use std::sync::{Arc, Mutex};

/// Distance between two normalized ring locations in `[0, 1)`.
pub fn ring_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).abs();
    d.min(1.0 - d)
}

/// Completion callback for an asynchronous message send.
pub trait AsyncSendCallback: 'static + Send + Sync {
    /// The message was handed to the wire.
    fn acknowledged(&self) {}

    /// The peer disconnected before the message could be sent.
    fn disconnected(&self) {}
}

/// Trait-object [AsyncSendCallback].
pub type DynAsyncSendCallback = Arc<dyn AsyncSendCallback>;

/// Byte accounting hooks, fed by the transport and transmitter layers.
pub trait ByteCounter: 'static + Send + Sync {
    /// `n` bytes were sent on behalf of this request.
    fn sent_bytes(&self, n: u64);

    /// `n` bytes were received on behalf of this request.
    fn received_bytes(&self, n: u64);

    /// `n` bytes of useful payload were sent.
    fn sent_payload(&self, n: u64);
}

/// Trait-object [ByteCounter].
pub type DynByteCounter = Arc<dyn ByteCounter>;

/// The connection to the peer a request came from.
pub trait PeerLink: 'static + Send + Sync + std::fmt::Debug {
    /// Decrement hops-to-live according to this peer's policy and
    /// return the new value.
    fn decrement_htl(&self, htl: u16) -> u16;

    /// Queue a message for asynchronous delivery. May block briefly
    /// on the outbound queue; errors mean the peer is gone.
    fn send_async(
        &self,
        msg: WireProto,
        cb: Option<DynAsyncSendCallback>,
        priority: u8,
        ctr: Option<DynByteCounter>,
    ) -> WrnResult<()>;
}

/// Trait-object [PeerLink].
pub type DynPeerLink = Arc<dyn PeerLink>;

/// Terminal (and one non-terminal) statuses of a downstream request
/// sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SenderStatus {
    /// The sender has not resolved yet.
    NotFinished,
    /// The data could not be found downstream.
    DataNotFound,
    /// The sender generated a rejected-overload locally.
    GeneratedRejectedOverload,
    /// The downstream request timed out.
    TimedOut,
    /// The sender hit an internal error.
    InternalError,
    /// Routing dead-ended.
    RouteNotFound,
    /// The data was found.
    Success,
    /// A received block failed verification.
    VerifyFailure,
    /// A block transfer from downstream failed.
    TransferFailed,
}

impl SenderStatus {
    /// Whether this status was generated locally, i.e. the failure is
    /// ours rather than the network's. Locally generated failures are
    /// excluded from remote-fetch byte statistics.
    pub fn is_locally_generated(&self) -> bool {
        matches!(
            self,
            SenderStatus::GeneratedRejectedOverload
                | SenderStatus::TimedOut
                | SenderStatus::InternalError
        )
    }
}

/// Status-change wait mask bit: a (non-local) rejected-overload was
/// seen and should be forwarded.
pub const WAIT_REJECTED_OVERLOAD: u16 = 1;
/// Status-change wait mask bit: the sender started receiving data
/// (CHK) and a transfer can begin.
pub const WAIT_TRANSFERRING_DATA: u16 = 2;
/// Status-change wait mask bit: the sender reached a terminal status.
pub const WAIT_FINISHED: u16 = 4;

/// Observer of sender status changes.
pub trait StatusObserver: 'static + Send + Sync + std::fmt::Debug {
    /// The sender's status mask changed. The observer may suspend
    /// (e.g. to stream a block transfer) before returning, so the
    /// future owns the observer.
    fn on_status_change(self: Arc<Self>, mask: u16) -> BoxFut<'static, ()>;
}

/// Trait-object [StatusObserver].
pub type DynStatusObserver = Arc<dyn StatusObserver>;

/// A downstream request in flight, shared between every handler
/// coalescing onto it.
pub trait RequestSender: 'static + Send + Sync + std::fmt::Debug {
    /// Subscribe for the next status change beyond `seen_mask`.
    fn callback_when_status_change(
        &self,
        observer: DynStatusObserver,
        seen_mask: u16,
    );

    /// The current status.
    fn status(&self) -> SenderStatus;

    /// Raw headers of the received block.
    fn headers(&self) -> Bytes;

    /// The partial-receive state of an in-flight CHK transfer.
    fn partial_block(&self) -> DynPartialBlock;

    /// Raw data of a received SSK block.
    fn ssk_data(&self) -> Option<Bytes>;

    /// The received SSK block itself (carries the public key).
    fn ssk_block(&self) -> Option<KeyBlock>;

    /// Hops left on the downstream request.
    fn htl(&self) -> u16;

    /// Whether a transfer to us has started.
    fn transfer_started(&self) -> bool;

    /// Total bytes this sender sent downstream.
    fn total_sent_bytes(&self) -> u64;

    /// Total bytes this sender received from downstream.
    fn total_received_bytes(&self) -> u64;
}

/// Trait-object [RequestSender].
pub type DynRequestSender = Arc<dyn RequestSender>;

/// Streams one block to a peer, packet by packet. This is the main
/// long-running operation of a request handler.
pub trait BlockTransmitter: 'static + Send + Sync + std::fmt::Debug {
    /// Stream the block. Resolves true on success.
    fn send(&self) -> BoxFut<'static, bool>;
}

/// Trait-object [BlockTransmitter].
pub type DynBlockTransmitter = Arc<dyn BlockTransmitter>;

/// The outcome of asking the node to resolve a key.
#[derive(Debug)]
pub enum MakeSenderResult {
    /// The key was in the local store.
    Local(KeyBlock),
    /// A downstream fetch is required (possibly coalesced with other
    /// requests for the same key).
    Sender(DynRequestSender),
    /// Out of hops; no downstream fetch will be made.
    OutOfHops,
}

/// A thread-safe running average accumulator.
#[derive(Debug, Default)]
pub struct RunningAverage {
    inner: Mutex<(u64, f64)>,
}

impl RunningAverage {
    /// Report one sample.
    pub fn report(&self, value: u64) {
        let mut lock = self.inner.lock().unwrap();
        lock.0 += 1;
        lock.1 += value as f64;
    }

    /// The current average, zero before any sample.
    pub fn current_value(&self) -> f64 {
        let lock = self.inner.lock().unwrap();
        if lock.0 == 0 {
            0.0
        } else {
            lock.1 / lock.0 as f64
        }
    }

    /// The number of samples reported.
    pub fn count(&self) -> u64 {
        self.inner.lock().unwrap().0
    }
}

/// The fetch byte-cost statistics a node maintains. Writes funnel in
/// from request handlers after they reach their terminal state.
#[derive(Debug, Default)]
pub struct NodeStats {
    /// Bytes sent per remote CHK fetch.
    pub remote_chk_fetch_bytes_sent_average: RunningAverage,
    /// Bytes received per remote CHK fetch.
    pub remote_chk_fetch_bytes_received_average: RunningAverage,
    /// Bytes sent per successful remote CHK fetch.
    pub successful_chk_fetch_bytes_sent_average: RunningAverage,
    /// Bytes received per successful remote CHK fetch.
    pub successful_chk_fetch_bytes_received_average: RunningAverage,
    /// Bytes sent per remote SSK fetch.
    pub remote_ssk_fetch_bytes_sent_average: RunningAverage,
    /// Bytes received per remote SSK fetch.
    pub remote_ssk_fetch_bytes_received_average: RunningAverage,
    /// Bytes sent per successful remote SSK fetch.
    pub successful_ssk_fetch_bytes_sent_average: RunningAverage,
    /// Bytes received per successful remote SSK fetch.
    pub successful_ssk_fetch_bytes_received_average: RunningAverage,
}

/// The node a request handler runs inside.
pub trait Node: 'static + Send + Sync + std::fmt::Debug {
    /// Resolve a key: a local-store hit, a downstream sender, or
    /// nothing when out of hops. The routing policy behind this is an
    /// environment concern.
    #[allow(clippy::too_many_arguments)]
    fn make_request_sender(
        &self,
        key: NodeKey,
        htl: u16,
        uid: u64,
        source: DynPeerLink,
        closest_location: f64,
        reset_closest_location: bool,
        local_only: bool,
        can_write_client_cache: bool,
        offer_replies: bool,
    ) -> WrnResult<MakeSenderResult>;

    /// Wrap complete raw block data as partial-receive state for
    /// transmission.
    fn make_received_block(&self, data: Bytes) -> DynPartialBlock;

    /// Construct a block transmitter streaming `prb` to `source`.
    fn make_block_transmitter(
        &self,
        source: DynPeerLink,
        uid: u64,
        prb: DynPartialBlock,
        ctr: DynByteCounter,
    ) -> DynBlockTransmitter;

    /// A handler started transferring a block for this uid.
    fn add_transferring_request_handler(&self, uid: u64);

    /// A handler stopped transferring a block for this uid.
    fn remove_transferring_request_handler(&self, uid: u64);

    /// Release the uid slot of a completed request.
    fn unlock_uid(&self, uid: u64, is_ssk: bool, is_insert: bool);

    /// `n` bytes of useful payload were sent.
    fn sent_payload(&self, n: u64);

    /// The node's statistics accumulators.
    fn stats(&self) -> &NodeStats;

    /// The maximum hops-to-live this node resets requests to.
    fn max_htl(&self) -> u16;

    /// This node's normalized ring location.
    fn location(&self) -> f64;
}

/// Trait-object [Node].
pub type DynNode = Arc<dyn Node>;
