//! Data bucket types.
//!
//! A bucket is a handle to a blob of data owned by whoever created it.
//! The on-disk (or in-memory) representation belongs to the
//! environment; the lifecycle components only read and measure.

use crate::WrnResult;
use bytes::Bytes;
use std::sync::Arc;

/// A handle to a blob of data.
pub trait Bucket: 'static + Send + Sync + std::fmt::Debug {
    /// The size of the data in bytes.
    fn size(&self) -> u64;

    /// Read the entire contents.
    fn read(&self) -> WrnResult<Bytes>;
}

/// Trait-object [Bucket].
pub type DynBucket = Arc<dyn Bucket>;

/// A factory for materializing immutable buckets.
pub trait BucketFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Create an immutable bucket holding the given bytes. May fail
    /// with an I/O-sourced error.
    fn make_immutable_bucket(&self, data: Bytes) -> WrnResult<DynBucket>;
}

/// Trait-object [BucketFactory].
pub type DynBucketFactory = Arc<dyn BucketFactory>;
