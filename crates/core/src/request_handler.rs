//! The state machine executed when a remote peer asks this node for a
//! key.
//!
//! Does not do the actual fetching; that is separated off into the
//! request sender so transfer coalescing comes for free. The handler
//! decrements HTL, acknowledges the request, asks the node to resolve
//! the key (local store hit, downstream sender, or out of hops), and
//! streams data or error codes back on the wire.
//!
//! Phases move one way, `Initialize -> WaitForFirstReply ->
//! Finished`, with no loops. Every terminal path runs the finish
//! step: the transferring-UID slot is released, the UID is unlocked,
//! and the byte cost of the request is reported into the node
//! statistics.

use std::sync::{Arc, Mutex};
use warren_api::{protocol::WireProto, *};

#[cfg(test)]
mod test;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Initialize,
    WaitForFirstReply,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyOutcome {
    Done,
    Resubscribed,
}

/// An incoming request, as parsed off the wire by the transport
/// layer.
#[derive(Clone, Debug)]
pub struct IncomingRequest {
    /// The 64-bit identifier pairing this request with its replies.
    pub uid: u64,
    /// The key being asked for.
    pub key: NodeKey,
    /// Hops-to-live as advertised by the requester.
    pub htl: u16,
    /// The closest-to-the-key location seen on the path so far.
    pub closest_location: f64,
    /// Whether the requester wants the SSK public key sent along.
    pub need_pub_key: bool,
}

#[derive(Debug)]
struct HandlerState {
    phase: Phase,
    wait_status: u16,
    status: SenderStatus,
    final_transfer_failed: bool,
    should_have_started_transfer: bool,
    sender: Option<DynRequestSender>,
    finalized: bool,
}

#[derive(Debug, Default)]
struct ByteCounts {
    sent: u64,
    received: u64,
}

/// Answers one incoming request: local hit, downstream sender, or
/// error reply.
#[derive(Debug)]
pub struct RequestHandler {
    uid: u64,
    node: DynNode,
    source: DynPeerLink,
    key: NodeKey,
    htl: u16,
    closest_location: f64,
    reset_closest_location: bool,
    needs_pub_key: bool,
    state: Mutex<HandlerState>,
    bytes: Mutex<ByteCounts>,
}

impl RequestHandler {
    /// Construct a handler for one incoming request. When this node
    /// is closer to the key than the advertised closest location, it
    /// adopts its own location and resets HTL to the node maximum.
    pub fn new(
        req: IncomingRequest,
        node: DynNode,
        source: DynPeerLink,
    ) -> Arc<Self> {
        let mut htl = req.htl;
        let mut closest_location = req.closest_location;
        let my_location = node.location();
        let key_location = req.key.routing_key().location();
        let reset_closest_location = if ring_distance(
            key_location,
            my_location,
        ) < ring_distance(key_location, closest_location)
        {
            closest_location = my_location;
            htl = node.max_htl();
            true
        } else {
            false
        };
        let needs_pub_key = req.key.is_ssk() && req.need_pub_key;
        Arc::new(Self {
            uid: req.uid,
            node,
            source,
            key: req.key,
            htl,
            closest_location,
            reset_closest_location,
            needs_pub_key,
            state: Mutex::new(HandlerState {
                phase: Phase::Initialize,
                wait_status: 0,
                status: SenderStatus::NotFinished,
                final_transfer_failed: false,
                should_have_started_transfer: false,
                sender: None,
                finalized: false,
            }),
            bytes: Mutex::new(ByteCounts::default()),
        })
    }

    /// The request uid.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Whether the handler has reached its terminal phase.
    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Finished
    }

    /// Run the request to its first suspension point: local hits and
    /// out-of-hops requests complete here; downstream fetches
    /// subscribe to the sender and complete from its status-change
    /// callback.
    pub async fn run(self: Arc<Self>) {
        tracing::debug!(uid = self.uid, "handling a request");
        let htl = self.source.decrement_htl(self.htl);

        if !self.send(WireProto::accepted(self.uid)) {
            self.finish();
            return;
        }

        let made = self.node.make_request_sender(
            self.key.clone(),
            htl,
            self.uid,
            self.source.clone(),
            self.closest_location,
            self.reset_closest_location,
            false,
            true,
            false,
        );
        match made {
            Err(e) => {
                tracing::error!(uid = self.uid, %e, "make sender failed");
                self.finish();
            }
            Ok(MakeSenderResult::Local(block)) => {
                self.handle_local_hit(block).await;
                self.finish();
            }
            Ok(MakeSenderResult::OutOfHops) => {
                self.send(WireProto::data_not_found(self.uid));
                // For byte logging.
                self.set_status(SenderStatus::DataNotFound);
                self.finish();
            }
            Ok(MakeSenderResult::Sender(rs)) => {
                {
                    let mut lock = self.state.lock().unwrap();
                    lock.phase = Phase::WaitForFirstReply;
                    lock.sender = Some(rs.clone());
                }
                let observer: DynStatusObserver = self.clone();
                rs.callback_when_status_change(observer, 0);
            }
        }
    }

    async fn handle_local_hit(self: &Arc<Self>, block: KeyBlock) {
        match &block.key {
            ClientKey::Ssk { pub_key, .. } => {
                self.node.sent_payload(block.data.len() as u64);
                if !self.send(WireProto::ssk_data_found(
                    self.uid,
                    block.headers.clone(),
                    block.data.clone(),
                )) {
                    return;
                }
                if self.needs_pub_key {
                    self.send(WireProto::ssk_pub_key(
                        self.uid,
                        pub_key.clone(),
                    ));
                }
                // For byte logging.
                self.set_status(SenderStatus::Success);
            }
            ClientKey::Chk { .. } => {
                if !self.send(WireProto::chk_data_found(
                    self.uid,
                    block.headers.clone(),
                )) {
                    return;
                }
                let prb = self.node.make_received_block(block.data);
                let ctr: DynByteCounter = self.clone();
                let bt = self.node.make_block_transmitter(
                    self.source.clone(),
                    self.uid,
                    prb,
                    ctr,
                );
                self.node.add_transferring_request_handler(self.uid);
                if bt.send().await {
                    // For byte logging.
                    self.set_status(SenderStatus::Success);
                }
            }
        }
    }

    async fn wait_for_first_reply(self: &Arc<Self>) -> BodyOutcome {
        let (rs, ws) = {
            let lock = self.state.lock().unwrap();
            if lock.phase != Phase::WaitForFirstReply {
                return BodyOutcome::Done;
            }
            match lock.sender.clone() {
                Some(rs) => (rs, lock.wait_status),
                None => {
                    drop(lock);
                    tracing::error!(
                        uid = self.uid,
                        "waiting without a sender",
                    );
                    return BodyOutcome::Done;
                }
            }
        };

        if ws & WAIT_REJECTED_OVERLOAD != 0 {
            // Forward the downstream overload, then keep going.
            self.send(WireProto::rejected_overload(self.uid, false));
        }

        if ws & WAIT_TRANSFERRING_DATA != 0 {
            // Is a CHK.
            if !self.send(WireProto::chk_data_found(
                self.uid,
                rs.headers(),
            )) {
                return BodyOutcome::Done;
            }
            let prb = rs.partial_block();
            let ctr: DynByteCounter = self.clone();
            let bt = self.node.make_block_transmitter(
                self.source.clone(),
                self.uid,
                prb,
                ctr,
            );
            self.node.add_transferring_request_handler(self.uid);
            if !bt.send().await {
                self.state.lock().unwrap().final_transfer_failed = true;
            }
            return BodyOutcome::Done;
        }

        let status = rs.status();
        self.set_status(status);

        match status {
            SenderStatus::NotFinished => {
                rs.callback_when_status_change(self.observer(), ws);
                BodyOutcome::Resubscribed
            }
            SenderStatus::DataNotFound => {
                self.send(WireProto::data_not_found(self.uid));
                BodyOutcome::Done
            }
            SenderStatus::GeneratedRejectedOverload
            | SenderStatus::TimedOut
            | SenderStatus::InternalError => {
                // Locally generated; the source needs to reduce its
                // send rate.
                self.send(WireProto::rejected_overload(self.uid, true));
                BodyOutcome::Done
            }
            SenderStatus::RouteNotFound => {
                self.send(WireProto::route_not_found(
                    self.uid,
                    rs.htl() as u32,
                ));
                BodyOutcome::Done
            }
            SenderStatus::Success => {
                if self.key.is_ssk() {
                    let data = rs.ssk_data().unwrap_or_default();
                    if !self.send(WireProto::ssk_data_found(
                        self.uid,
                        rs.headers(),
                        data.clone(),
                    )) {
                        return BodyOutcome::Done;
                    }
                    self.node.sent_payload(data.len() as u64);
                    if self.needs_pub_key {
                        match rs
                            .ssk_block()
                            .and_then(|b| b.key.pub_key().cloned())
                        {
                            Some(pub_key) => {
                                self.send(WireProto::ssk_pub_key(
                                    self.uid,
                                    pub_key,
                                ));
                            }
                            None => tracing::error!(
                                uid = self.uid,
                                "ssk success without a public key",
                            ),
                        }
                    }
                } else if !rs.transfer_started() {
                    tracing::error!(
                        uid = self.uid,
                        "status is SUCCESS but we never started a \
                         transfer",
                    );
                }
                BodyOutcome::Done
            }
            SenderStatus::VerifyFailure => {
                if !self.key.is_ssk()
                    && !self.arm_transfer_latch(&rs, ws)
                {
                    return BodyOutcome::Done;
                }
                self.send(WireProto::rejected_overload(self.uid, true));
                BodyOutcome::Done
            }
            SenderStatus::TransferFailed => {
                if !self.key.is_ssk()
                    && !self.arm_transfer_latch(&rs, ws)
                {
                    return BodyOutcome::Done;
                }
                // The other side knows; no reply.
                BodyOutcome::Done
            }
        }
    }

    /// One-shot guard against a verify/transfer failure being
    /// reported twice without an intervening transfer start. Arms the
    /// latch and re-subscribes once; a second report without a
    /// transfer is an internal error and gets no reply.
    fn arm_transfer_latch(
        self: &Arc<Self>,
        rs: &DynRequestSender,
        ws: u16,
    ) -> bool {
        let violated = {
            let mut lock = self.state.lock().unwrap();
            if lock.should_have_started_transfer {
                true
            } else {
                lock.should_have_started_transfer = true;
                false
            }
        };
        if violated {
            tracing::error!(
                uid = self.uid,
                status = ?self.state.lock().unwrap().status,
                "repeated failure status but transfer not started",
            );
            return false;
        }
        rs.callback_when_status_change(self.observer(), ws);
        true
    }

    fn observer(self: &Arc<Self>) -> DynStatusObserver {
        self.clone()
    }

    fn set_status(&self, status: SenderStatus) {
        self.state.lock().unwrap().status = status;
    }

    fn send(&self, msg: WireProto) -> bool {
        match self.source.send_async(msg, None, 0, None) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(uid = self.uid, %e, "send failed");
                false
            }
        }
    }

    /// Runs on every terminal path: move to `Finished`, release the
    /// transferring-UID slot, unlock the UID, and report the byte
    /// cost unless the request failed in a locally generated way.
    fn finish(&self) {
        let (rs, status, final_transfer_failed) = {
            let mut lock = self.state.lock().unwrap();
            if lock.finalized {
                return;
            }
            lock.finalized = true;
            lock.phase = Phase::Finished;
            (
                lock.sender.clone(),
                lock.status,
                lock.final_transfer_failed,
            )
        };
        self.node.remove_transferring_request_handler(self.uid);
        self.node.unlock_uid(self.uid, self.key.is_ssk(), false);

        if final_transfer_failed || status.is_locally_generated() {
            return;
        }
        let (sent_local, received_local) = {
            let lock = self.bytes.lock().unwrap();
            (lock.sent, lock.received)
        };
        // Remote fetches report whenever a sender exists; a local hit
        // has no sender but a completed transfer still counts.
        if rs.is_none()
            && !(status == SenderStatus::Success
                && sent_local + received_local > 0)
        {
            return;
        }
        let (sender_sent, sender_received) = match &rs {
            Some(rs) => {
                (rs.total_sent_bytes(), rs.total_received_bytes())
            }
            None => (0, 0),
        };
        let sent = sender_sent + sent_local;
        let received = sender_received + received_local;
        let stats = self.node.stats();
        if self.key.is_ssk() {
            tracing::debug!(
                uid = self.uid,
                sent,
                received,
                ?status,
                "remote ssk fetch cost",
            );
            stats.remote_ssk_fetch_bytes_sent_average.report(sent);
            stats
                .remote_ssk_fetch_bytes_received_average
                .report(received);
            if status == SenderStatus::Success {
                stats
                    .successful_ssk_fetch_bytes_sent_average
                    .report(sent);
                stats
                    .successful_ssk_fetch_bytes_received_average
                    .report(received);
            }
        } else {
            tracing::debug!(
                uid = self.uid,
                sent,
                received,
                ?status,
                "remote chk fetch cost",
            );
            stats.remote_chk_fetch_bytes_sent_average.report(sent);
            stats
                .remote_chk_fetch_bytes_received_average
                .report(received);
            if status == SenderStatus::Success {
                stats
                    .successful_chk_fetch_bytes_sent_average
                    .report(sent);
                stats
                    .successful_chk_fetch_bytes_received_average
                    .report(received);
            }
        }
    }
}

impl StatusObserver for RequestHandler {
    fn on_status_change(
        self: Arc<Self>,
        mask: u16,
    ) -> BoxFut<'static, ()> {
        Box::pin(async move {
            {
                let mut lock = self.state.lock().unwrap();
                lock.wait_status = mask;
                if lock.phase != Phase::WaitForFirstReply {
                    return;
                }
            }
            let outcome = self.wait_for_first_reply().await;
            if outcome != BodyOutcome::Resubscribed {
                self.finish();
            }
        })
    }
}

impl ByteCounter for RequestHandler {
    fn sent_bytes(&self, n: u64) {
        self.bytes.lock().unwrap().sent += n;
    }

    fn received_bytes(&self, n: u64) {
        self.bytes.lock().unwrap().received += n;
    }

    fn sent_payload(&self, n: u64) {
        self.node.sent_payload(n);
    }
}
