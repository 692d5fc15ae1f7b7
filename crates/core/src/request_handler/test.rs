use super::*;
use bytes::Bytes;
use warren_api::protocol::wire_proto::Ty;
use warren_test_utils::id::{random_chk, random_ssk};

#[derive(Debug, Default)]
struct RecPeer {
    msgs: Mutex<Vec<WireProto>>,
    fail: Mutex<bool>,
}

impl RecPeer {
    fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn trace(&self) -> Vec<Ty> {
        self.msgs.lock().unwrap().iter().map(|m| m.ty()).collect()
    }

    fn msgs(&self) -> Vec<WireProto> {
        self.msgs.lock().unwrap().clone()
    }
}

impl PeerLink for RecPeer {
    fn decrement_htl(&self, htl: u16) -> u16 {
        htl.saturating_sub(1)
    }

    fn send_async(
        &self,
        msg: WireProto,
        _cb: Option<DynAsyncSendCallback>,
        _priority: u8,
        _ctr: Option<DynByteCounter>,
    ) -> WrnResult<()> {
        if *self.fail.lock().unwrap() {
            return Err(WrnError::other("peer gone"));
        }
        self.msgs.lock().unwrap().push(msg);
        Ok(())
    }
}

#[derive(Debug)]
struct TestPrb(Bytes);

impl PartialBlock for TestPrb {
    fn raw_data(&self) -> Bytes {
        self.0.clone()
    }
}

struct TestTransmitter {
    ok: bool,
    bytes: u64,
    ctr: DynByteCounter,
}

impl std::fmt::Debug for TestTransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestTransmitter")
            .field("ok", &self.ok)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl BlockTransmitter for TestTransmitter {
    fn send(&self) -> BoxFut<'static, bool> {
        let ok = self.ok;
        let bytes = self.bytes;
        let ctr = self.ctr.clone();
        Box::pin(async move {
            if bytes > 0 {
                ctr.sent_bytes(bytes);
            }
            ok
        })
    }
}

#[derive(Debug)]
struct RecNode {
    result: Mutex<Option<MakeSenderResult>>,
    sender_args: Mutex<Option<(NodeKey, u16, u64, f64, bool)>>,
    transferring_added: Mutex<Vec<u64>>,
    transferring_removed: Mutex<Vec<u64>>,
    unlocks: Mutex<Vec<(u64, bool, bool)>>,
    payloads: Mutex<Vec<u64>>,
    stats: NodeStats,
    transmit_ok: Mutex<bool>,
    transmit_bytes: Mutex<u64>,
    location: f64,
}

impl RecNode {
    fn create() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            sender_args: Mutex::new(None),
            transferring_added: Mutex::new(Vec::new()),
            transferring_removed: Mutex::new(Vec::new()),
            unlocks: Mutex::new(Vec::new()),
            payloads: Mutex::new(Vec::new()),
            stats: NodeStats::default(),
            transmit_ok: Mutex::new(true),
            transmit_bytes: Mutex::new(1_024),
            location: 0.5,
        })
    }

    fn script(&self, result: MakeSenderResult) {
        *self.result.lock().unwrap() = Some(result);
    }
}

impl Node for RecNode {
    fn make_request_sender(
        &self,
        key: NodeKey,
        htl: u16,
        uid: u64,
        _source: DynPeerLink,
        closest_location: f64,
        reset_closest_location: bool,
        _local_only: bool,
        _can_write_client_cache: bool,
        _offer_replies: bool,
    ) -> WrnResult<MakeSenderResult> {
        *self.sender_args.lock().unwrap() =
            Some((key, htl, uid, closest_location, reset_closest_location));
        Ok(self
            .result
            .lock()
            .unwrap()
            .take()
            .unwrap_or(MakeSenderResult::OutOfHops))
    }

    fn make_received_block(&self, data: Bytes) -> DynPartialBlock {
        Arc::new(TestPrb(data))
    }

    fn make_block_transmitter(
        &self,
        _source: DynPeerLink,
        _uid: u64,
        _prb: DynPartialBlock,
        ctr: DynByteCounter,
    ) -> DynBlockTransmitter {
        Arc::new(TestTransmitter {
            ok: *self.transmit_ok.lock().unwrap(),
            bytes: *self.transmit_bytes.lock().unwrap(),
            ctr,
        })
    }

    fn add_transferring_request_handler(&self, uid: u64) {
        self.transferring_added.lock().unwrap().push(uid);
    }

    fn remove_transferring_request_handler(&self, uid: u64) {
        self.transferring_removed.lock().unwrap().push(uid);
    }

    fn unlock_uid(&self, uid: u64, is_ssk: bool, is_insert: bool) {
        self.unlocks.lock().unwrap().push((uid, is_ssk, is_insert));
    }

    fn sent_payload(&self, n: u64) {
        self.payloads.lock().unwrap().push(n);
    }

    fn stats(&self) -> &NodeStats {
        &self.stats
    }

    fn max_htl(&self) -> u16 {
        10
    }

    fn location(&self) -> f64 {
        self.location
    }
}

#[derive(Debug)]
struct ScriptedSender {
    status: Mutex<SenderStatus>,
    headers: Bytes,
    data: Bytes,
    ssk_block: Option<KeyBlock>,
    htl: u16,
    transfer_started: Mutex<bool>,
    sent: u64,
    received: u64,
    observers: Mutex<Vec<(DynStatusObserver, u16)>>,
}

impl ScriptedSender {
    fn new(status: SenderStatus, ssk_block: Option<KeyBlock>) -> Self {
        Self {
            status: Mutex::new(status),
            headers: Bytes::from_static(b"sender-headers"),
            data: Bytes::from_static(b"sender-data"),
            ssk_block,
            htl: 3,
            transfer_started: Mutex::new(false),
            sent: 100,
            received: 200,
            observers: Mutex::new(Vec::new()),
        }
    }

    fn create(status: SenderStatus) -> Arc<Self> {
        Arc::new(Self::new(status, None))
    }

    fn create_ssk(status: SenderStatus, key: &ClientKey) -> Arc<Self> {
        Arc::new(Self::new(
            status,
            Some(KeyBlock::new(
                key.clone(),
                Bytes::from_static(b"sender-headers"),
                Bytes::from_static(b"sender-data"),
            )),
        ))
    }

    fn set_status(&self, status: SenderStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn subscriber_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    /// Deliver a status-change callback to the most recent
    /// subscriber, the way the real sender would.
    async fn fire(&self, mask: u16) {
        let (observer, _) = self
            .observers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("nobody subscribed");
        observer.on_status_change(mask).await;
    }
}

impl RequestSender for ScriptedSender {
    fn callback_when_status_change(
        &self,
        observer: DynStatusObserver,
        seen_mask: u16,
    ) {
        self.observers.lock().unwrap().push((observer, seen_mask));
    }

    fn status(&self) -> SenderStatus {
        *self.status.lock().unwrap()
    }

    fn headers(&self) -> Bytes {
        self.headers.clone()
    }

    fn partial_block(&self) -> DynPartialBlock {
        Arc::new(TestPrb(self.data.clone()))
    }

    fn ssk_data(&self) -> Option<Bytes> {
        self.ssk_block.as_ref().map(|b| b.data.clone())
    }

    fn ssk_block(&self) -> Option<KeyBlock> {
        self.ssk_block.clone()
    }

    fn htl(&self) -> u16 {
        self.htl
    }

    fn transfer_started(&self) -> bool {
        *self.transfer_started.lock().unwrap()
    }

    fn total_sent_bytes(&self) -> u64 {
        self.sent
    }

    fn total_received_bytes(&self) -> u64 {
        self.received
    }
}

const UID: u64 = 42;

fn request(key: &ClientKey) -> IncomingRequest {
    IncomingRequest {
        uid: UID,
        key: key.node_key(),
        htl: 5,
        closest_location: 0.0,
        need_pub_key: true,
    }
}

struct Setup {
    node: Arc<RecNode>,
    peer: Arc<RecPeer>,
    handler: Arc<RequestHandler>,
}

fn setup(key: &ClientKey, result: MakeSenderResult) -> Setup {
    warren_test_utils::enable_tracing();
    let node = RecNode::create();
    let peer = RecPeer::create();
    node.script(result);
    let handler =
        RequestHandler::new(request(key), node.clone(), peer.clone());
    Setup { node, peer, handler }
}

fn assert_uid_lifecycle(s: &Setup) {
    let added = s.node.transferring_added.lock().unwrap().clone();
    let removed = s.node.transferring_removed.lock().unwrap().clone();
    let unlocks = s.node.unlocks.lock().unwrap().clone();
    assert!(added.len() <= removed.len());
    assert!(added.iter().all(|uid| removed.contains(uid)));
    assert_eq!(1, unlocks.len());
    assert_eq!(UID, unlocks[0].0);
    // Never an insert unlock.
    assert!(!unlocks[0].2);
}

#[tokio::test]
async fn local_chk_hit_streams_the_block() {
    let key = random_chk();
    let block = KeyBlock::new(
        key.clone(),
        Bytes::from_static(b"h"),
        Bytes::from_static(b"payload"),
    );
    let s = setup(&key, MakeSenderResult::Local(block));
    s.handler.clone().run().await;

    assert_eq!(vec![Ty::Accepted, Ty::ChkDataFound], s.peer.trace());
    assert!(s.handler.is_finished());
    assert_eq!(vec![UID], *s.node.transferring_added.lock().unwrap());
    assert_uid_lifecycle(&s);
    // The transfer cost went into the remote CHK statistics.
    let stats = s.node.stats();
    assert_eq!(1, stats.remote_chk_fetch_bytes_sent_average.count());
    assert!(
        stats.remote_chk_fetch_bytes_sent_average.current_value()
            >= 1_024.0
    );
    assert_eq!(
        1,
        stats.successful_chk_fetch_bytes_sent_average.count()
    );
}

#[tokio::test]
async fn local_ssk_hit_sends_data_and_pub_key() {
    let key = random_ssk();
    let block = KeyBlock::new(
        key.clone(),
        Bytes::from_static(b"h"),
        Bytes::from_static(b"ssk-payload"),
    );
    let s = setup(&key, MakeSenderResult::Local(block));
    s.handler.clone().run().await;

    assert_eq!(
        vec![Ty::Accepted, Ty::SskDataFound, Ty::SskPubKey],
        s.peer.trace(),
    );
    let pk_msg = &s.peer.msgs()[2];
    assert_eq!(key.pub_key().cloned(), pk_msg.pub_key);
    // Payload byte counting went to the node.
    assert_eq!(vec![11], *s.node.payloads.lock().unwrap());
    // No block transfer for SSK.
    assert!(s.node.transferring_added.lock().unwrap().is_empty());
    assert_uid_lifecycle(&s);
}

#[tokio::test]
async fn local_ssk_hit_without_need_pub_key() {
    let key = random_ssk();
    let block = KeyBlock::new(
        key.clone(),
        Bytes::from_static(b"h"),
        Bytes::from_static(b"ssk-payload"),
    );
    let node = RecNode::create();
    let peer = RecPeer::create();
    node.script(MakeSenderResult::Local(block));
    let mut req = request(&key);
    req.need_pub_key = false;
    let handler = RequestHandler::new(req, node.clone(), peer.clone());
    handler.run().await;

    assert_eq!(vec![Ty::Accepted, Ty::SskDataFound], peer.trace());
}

#[tokio::test]
async fn out_of_hops_sends_data_not_found() {
    let key = random_chk();
    let s = setup(&key, MakeSenderResult::OutOfHops);
    s.handler.clone().run().await;

    assert_eq!(vec![Ty::Accepted, Ty::DataNotFound], s.peer.trace());
    assert!(s.handler.is_finished());
    assert_uid_lifecycle(&s);
    // Nothing reported for a local miss.
    assert_eq!(0, s.node.stats.remote_chk_fetch_bytes_sent_average.count());
}

#[tokio::test]
async fn htl_is_decremented_and_forwarded() {
    let key = random_chk();
    let s = setup(&key, MakeSenderResult::OutOfHops);
    s.handler.clone().run().await;

    let (arg_key, htl, uid, _closest, _reset) =
        s.node.sender_args.lock().unwrap().clone().unwrap();
    assert_eq!(key.node_key(), arg_key);
    assert_eq!(UID, uid);
    // The handler was constructed closer to the key than the
    // advertised closest location or not; either way the peer
    // decremented whatever HTL the handler started with.
    let args_reset = _reset;
    if args_reset {
        assert_eq!(9, htl);
    } else {
        assert_eq!(4, htl);
    }
}

#[tokio::test]
async fn sender_data_not_found() {
    let key = random_chk();
    let sender = ScriptedSender::create(SenderStatus::DataNotFound);
    let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
    s.handler.clone().run().await;

    // Still waiting: only the ACCEPTED went out.
    assert_eq!(vec![Ty::Accepted], s.peer.trace());
    assert!(!s.handler.is_finished());
    assert_eq!(1, sender.subscriber_count());

    sender.fire(WAIT_FINISHED).await;
    assert_eq!(vec![Ty::Accepted, Ty::DataNotFound], s.peer.trace());
    assert!(s.handler.is_finished());
    assert_uid_lifecycle(&s);
    // Remote byte cost reported, but not as successful.
    let stats = s.node.stats();
    assert_eq!(1, stats.remote_chk_fetch_bytes_sent_average.count());
    assert_eq!(
        100.0,
        stats.remote_chk_fetch_bytes_sent_average.current_value(),
    );
    assert_eq!(
        200.0,
        stats.remote_chk_fetch_bytes_received_average.current_value(),
    );
    assert_eq!(0, stats.successful_chk_fetch_bytes_sent_average.count());
}

#[tokio::test]
async fn locally_generated_failures_reject_and_skip_stats() {
    for status in [
        SenderStatus::GeneratedRejectedOverload,
        SenderStatus::TimedOut,
        SenderStatus::InternalError,
    ] {
        let key = random_chk();
        let sender = ScriptedSender::create(status);
        let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
        s.handler.clone().run().await;
        sender.fire(WAIT_FINISHED).await;

        let msgs = s.peer.msgs();
        assert_eq!(
            vec![Ty::Accepted, Ty::RejectedOverload],
            s.peer.trace(),
            "{status:?}",
        );
        assert_eq!(Some(true), msgs[1].local, "{status:?}");
        assert!(s.handler.is_finished());
        assert_uid_lifecycle(&s);
        assert_eq!(
            0,
            s.node.stats.remote_chk_fetch_bytes_sent_average.count(),
            "{status:?}",
        );
    }
}

#[tokio::test]
async fn downstream_overload_is_forwarded_non_local() {
    let key = random_chk();
    let sender = ScriptedSender::create(SenderStatus::DataNotFound);
    let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
    s.handler.clone().run().await;
    sender.fire(WAIT_REJECTED_OVERLOAD | WAIT_FINISHED).await;

    let msgs = s.peer.msgs();
    assert_eq!(
        vec![Ty::Accepted, Ty::RejectedOverload, Ty::DataNotFound],
        s.peer.trace(),
    );
    assert_eq!(Some(false), msgs[1].local);
}

#[tokio::test]
async fn route_not_found_carries_hops_left() {
    let key = random_chk();
    let sender = ScriptedSender::create(SenderStatus::RouteNotFound);
    let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
    s.handler.clone().run().await;
    sender.fire(WAIT_FINISHED).await;

    let msgs = s.peer.msgs();
    assert_eq!(vec![Ty::Accepted, Ty::RouteNotFound], s.peer.trace());
    assert_eq!(Some(3), msgs[1].hops_left);
    assert_uid_lifecycle(&s);
}

#[tokio::test]
async fn transferring_data_starts_a_transfer() {
    let key = random_chk();
    let sender = ScriptedSender::create(SenderStatus::NotFinished);
    let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
    s.handler.clone().run().await;
    sender.fire(WAIT_TRANSFERRING_DATA).await;

    assert_eq!(vec![Ty::Accepted, Ty::ChkDataFound], s.peer.trace());
    assert_eq!(vec![UID], *s.node.transferring_added.lock().unwrap());
    assert!(s.handler.is_finished());
    assert_uid_lifecycle(&s);
    // Transfer bytes plus sender totals reported.
    let stats = s.node.stats();
    assert_eq!(
        (100 + 1_024) as f64,
        stats.remote_chk_fetch_bytes_sent_average.current_value(),
    );
}

#[tokio::test]
async fn failed_transfer_skips_byte_accounting() {
    let key = random_chk();
    let sender = ScriptedSender::create(SenderStatus::NotFinished);
    let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
    *s.node.transmit_ok.lock().unwrap() = false;
    s.handler.clone().run().await;
    sender.fire(WAIT_TRANSFERRING_DATA).await;

    assert!(s.handler.is_finished());
    assert_uid_lifecycle(&s);
    assert_eq!(
        0,
        s.node.stats.remote_chk_fetch_bytes_sent_average.count(),
    );
}

#[tokio::test]
async fn not_finished_resubscribes_without_a_reply() {
    let key = random_chk();
    let sender = ScriptedSender::create(SenderStatus::NotFinished);
    let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
    s.handler.clone().run().await;
    sender.fire(0).await;

    // No reply, not finished, subscribed again.
    assert_eq!(vec![Ty::Accepted], s.peer.trace());
    assert!(!s.handler.is_finished());
    assert_eq!(2, sender.subscriber_count());
    assert!(s.node.unlocks.lock().unwrap().is_empty());

    // The next callback resolves it.
    sender.set_status(SenderStatus::DataNotFound);
    sender.fire(WAIT_FINISHED).await;
    assert_eq!(vec![Ty::Accepted, Ty::DataNotFound], s.peer.trace());
    assert!(s.handler.is_finished());
    assert_uid_lifecycle(&s);
}

#[tokio::test]
async fn ssk_success_sends_data_and_pub_key() {
    let key = random_ssk();
    let sender =
        ScriptedSender::create_ssk(SenderStatus::Success, &key);
    let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
    s.handler.clone().run().await;
    sender.fire(WAIT_FINISHED).await;

    assert_eq!(
        vec![Ty::Accepted, Ty::SskDataFound, Ty::SskPubKey],
        s.peer.trace(),
    );
    assert_eq!(vec![11], *s.node.payloads.lock().unwrap());
    assert!(s.handler.is_finished());
    assert_uid_lifecycle(&s);
    // Successful SSK statistics get sent and received separately.
    let stats = s.node.stats();
    assert_eq!(
        100.0,
        stats.successful_ssk_fetch_bytes_sent_average.current_value(),
    );
    assert_eq!(
        200.0,
        stats
            .successful_ssk_fetch_bytes_received_average
            .current_value(),
    );
}

#[tokio::test]
async fn chk_success_without_transfer_sends_nothing() {
    let key = random_chk();
    let sender = ScriptedSender::create(SenderStatus::Success);
    let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
    s.handler.clone().run().await;
    sender.fire(WAIT_FINISHED).await;

    // Logged as an error, but no reply: the transfer was supposed to
    // be the reply.
    assert_eq!(vec![Ty::Accepted], s.peer.trace());
    assert!(s.handler.is_finished());
    assert_uid_lifecycle(&s);
}

#[tokio::test]
async fn verify_failure_resubscribes_once_then_rejects() {
    let key = random_chk();
    let sender = ScriptedSender::create(SenderStatus::VerifyFailure);
    let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
    s.handler.clone().run().await;
    sender.fire(WAIT_FINISHED).await;

    let msgs = s.peer.msgs();
    assert_eq!(
        vec![Ty::Accepted, Ty::RejectedOverload],
        s.peer.trace(),
    );
    assert_eq!(Some(true), msgs[1].local);
    // Re-subscribed once for a possible late transfer.
    assert_eq!(2, sender.subscriber_count());
    assert!(s.handler.is_finished());
    assert_uid_lifecycle(&s);

    // A late callback after finishing is dropped.
    sender.fire(WAIT_FINISHED).await;
    assert_eq!(2, s.peer.msgs().len());
}

#[tokio::test]
async fn transfer_failed_sends_no_reply() {
    let key = random_chk();
    let sender = ScriptedSender::create(SenderStatus::TransferFailed);
    let s = setup(&key, MakeSenderResult::Sender(sender.clone()));
    s.handler.clone().run().await;
    sender.fire(WAIT_FINISHED).await;

    // The other side is assumed to know.
    assert_eq!(vec![Ty::Accepted], s.peer.trace());
    assert!(s.handler.is_finished());
    assert_uid_lifecycle(&s);
}

#[tokio::test]
async fn peer_gone_still_unlocks_the_uid() {
    let key = random_chk();
    let s = setup(&key, MakeSenderResult::OutOfHops);
    *s.peer.fail.lock().unwrap() = true;
    s.handler.clone().run().await;

    assert!(s.handler.is_finished());
    assert_uid_lifecycle(&s);
}
