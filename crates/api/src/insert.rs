//! Insert-side collaborator traits.
//!
//! An insert is driven by callbacks: a single-file inserter is
//! started, and reports everything it learns (the routing URI, inline
//! metadata for small data, terminal success or failure, state
//! transitions, block-set finalization) back to its parent through
//! [PutCompletionCallback]. Callbacks may interleave across siblings
//! and may fire before `start()` returns.

use crate::{
    ClientKey, ClientMeta, DynBucket, DynBucketFactory,
    DynEventProducer, InsertError, Metadata, Uri,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique identity of one put state. Parents track which of a
/// child's successive states is current by id; the ids themselves are
/// never dereferenced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PutStateId(pub u64);

impl PutStateId {
    /// Allocate a fresh process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One state in the lifecycle of an insert. Implementations are
/// identified by [PutStateId]; everything else about them is opaque
/// to the parent.
pub trait PutState: 'static + Send + Sync + std::fmt::Debug {
    /// The stable identity of this state object.
    fn state_id(&self) -> PutStateId;
}

/// Trait-object [PutState].
pub type DynPutState = Arc<dyn PutState>;

/// The parent interface of a single-file inserter.
///
/// Transitions must be reflected synchronously in the parent's
/// current-state bookkeeping; the block accounting hooks are fanned in
/// unconditionally so progress accounting stays centralized.
pub trait PutCompletionCallback:
    'static + Send + Sync + std::fmt::Debug
{
    /// The insert completed successfully.
    fn on_success(&self, state: &dyn PutState);

    /// The insert failed terminally.
    fn on_failure(&self, e: InsertError, state: &dyn PutState);

    /// A routing URI has been assigned to the inserted data.
    fn on_encode(&self, key: ClientKey, state: &dyn PutState);

    /// For small data, the metadata is delivered directly instead of
    /// a URI.
    fn on_metadata(&self, meta: Metadata, state: Option<&dyn PutState>);

    /// The identity of the current child state changed.
    fn on_transition(&self, old: &dyn PutState, new: DynPutState);

    /// The finite set of output blocks is known.
    fn on_block_set_finished(&self, state: &dyn PutState);

    /// One more block will be inserted.
    fn add_block(&self);

    /// `num` more blocks will be inserted.
    fn add_blocks(&self, num: u32);

    /// A block completed. `dont_notify` suppresses the progress
    /// event.
    fn completed_block(&self, dont_notify: bool);

    /// A block failed retriably.
    fn failed_block(&self);

    /// A block failed fatally.
    fn fatally_failed_block(&self);

    /// `blocks` more blocks are required to succeed.
    fn add_must_succeed_blocks(&self, blocks: u32);
}

/// Trait-object [PutCompletionCallback].
pub type DynPutCompletionCallback = Arc<dyn PutCompletionCallback>;

/// The input to a single-file insert: a bucket of data, optional
/// client metadata, and the target URI (the empty CHK placeholder
/// until a real content hash exists).
#[derive(Clone, Debug)]
pub struct InsertBlock {
    /// The data to insert.
    pub data: DynBucket,
    /// Client metadata, if any.
    pub meta: Option<ClientMeta>,
    /// The target URI.
    pub target: Uri,
}

impl InsertBlock {
    /// Construct a new InsertBlock.
    pub fn new(
        data: DynBucket,
        meta: Option<ClientMeta>,
        target: Uri,
    ) -> Self {
        Self { data, meta, target }
    }
}

/// One outstanding single-file insert. Turns one data bucket into one
/// inserted block and reports back a URI or raw metadata through the
/// parent callback. The inserter is itself a [PutState]: it is the
/// first current state of whatever owns it.
pub trait SingleFileInserter: PutState {
    /// Start the insert. Callbacks on the parent may fire before this
    /// returns.
    fn start(self: Arc<Self>) -> Result<(), InsertError>;

    /// Cancel the insert. In-flight work is not preempted; its
    /// callbacks must be no-ops on a finished parent.
    fn cancel(&self);
}

/// Trait-object [SingleFileInserter].
pub type DynSingleFileInserter = Arc<dyn SingleFileInserter>;

/// A factory for creating single-file inserters.
pub trait SingleFileInserterFactory:
    'static + Send + Sync + std::fmt::Debug
{
    /// Construct an inserter for one block.
    ///
    /// - `cb` - the parent callback.
    /// - `is_metadata` - the block holds serialized metadata rather
    ///   than document data.
    /// - `get_chk_only` - compute keys without actually sending
    ///   inserts to the network.
    /// - `report_metadata_only` - for data small enough, report
    ///   inline metadata through `on_metadata` instead of a URI.
    fn create(
        &self,
        cb: DynPutCompletionCallback,
        block: InsertBlock,
        is_metadata: bool,
        get_chk_only: bool,
        report_metadata_only: bool,
    ) -> Result<DynSingleFileInserter, InsertError>;
}

/// Trait-object [SingleFileInserterFactory].
pub type DynSingleFileInserterFactory = Arc<dyn SingleFileInserterFactory>;

/// The outer client of a manifest insert.
pub trait ClientCallback: 'static + Send + Sync + std::fmt::Debug {
    /// The whole insert completed. Invoked at most once, and only
    /// after every leaf reported and the manifest itself was
    /// inserted.
    fn on_success(&self);

    /// The insert failed terminally. Invoked at most once, mutually
    /// exclusive with `on_success`.
    fn on_failure(&self, e: InsertError);

    /// The final URI of the manifest is known. Invoked exactly once,
    /// before `on_success`.
    fn on_generated_uri(&self, uri: &Uri);
}

/// Trait-object [ClientCallback].
pub type DynClientCallback = Arc<dyn ClientCallback>;

/// Shared context for an insert: the collaborators a putter needs.
#[derive(Clone, Debug)]
pub struct InsertContext {
    /// Factory for immutable buckets.
    pub bucket_factory: DynBucketFactory,
    /// Sink for progress events.
    pub event_producer: DynEventProducer,
    /// Factory for single-file inserters.
    pub inserter_factory: DynSingleFileInserterFactory,
}

impl InsertContext {
    /// Construct a new InsertContext.
    pub fn new(
        bucket_factory: DynBucketFactory,
        event_producer: DynEventProducer,
        inserter_factory: DynSingleFileInserterFactory,
    ) -> Self {
        Self {
            bucket_factory,
            event_producer,
            inserter_factory,
        }
    }
}
