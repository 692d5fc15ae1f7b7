//! Progress event types.

use std::sync::Arc;

/// A snapshot of block-level insert progress, produced whenever the
/// centralized accounting on a putter changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SplitfileProgressEvent {
    /// Total number of blocks.
    pub total: u32,
    /// Blocks completed successfully.
    pub successful: u32,
    /// Blocks failed (retriably).
    pub failed: u32,
    /// Blocks failed fatally.
    pub fatally_failed: u32,
    /// Minimum number of blocks that must succeed.
    pub min_success: u32,
    /// Whether the set of blocks is final.
    pub block_set_finalized: bool,
}

/// Consumer of progress events.
pub trait EventProducer: 'static + Send + Sync + std::fmt::Debug {
    /// Deliver one progress event.
    fn produce(&self, event: SplitfileProgressEvent);
}

/// Trait-object [EventProducer].
pub type DynEventProducer = Arc<dyn EventProducer>;

/// An event producer that discards everything.
#[derive(Debug, Default)]
pub struct NullEventProducer;

impl EventProducer for NullEventProducer {
    fn produce(&self, _event: SplitfileProgressEvent) {}
}
