//! In-memory bucket implementation.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use warren_api::*;

/// A bucket holding its data in memory.
#[derive(Debug)]
pub struct MemBucket {
    data: Bytes,
}

impl MemBucket {
    /// Construct a new MemBucket over the given bytes.
    pub fn new(data: impl Into<Bytes>) -> DynBucket {
        Arc::new(Self { data: data.into() })
    }
}

impl Bucket for MemBucket {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self) -> WrnResult<Bytes> {
        Ok(self.data.clone())
    }
}

/// A bucket factory materializing [MemBucket]s. Keeps the bytes of
/// every bucket it made, and can be switched to fail, for exercising
/// bucket-error paths.
#[derive(Debug, Default)]
pub struct MemBucketFactory {
    fail: Mutex<bool>,
    created: Mutex<Vec<Bytes>>,
}

impl MemBucketFactory {
    /// Construct a new MemBucketFactory.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent `make_immutable_bucket` call fail with
    /// an I/O error.
    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    /// The bytes of every bucket made so far, in creation order.
    pub fn created(&self) -> Vec<Bytes> {
        self.created.lock().unwrap().clone()
    }
}

impl BucketFactory for MemBucketFactory {
    fn make_immutable_bucket(&self, data: Bytes) -> WrnResult<DynBucket> {
        if *self.fail.lock().unwrap() {
            return Err(WrnError::other_src(
                "make immutable bucket",
                std::io::Error::other("mem bucket factory set to fail"),
            ));
        }
        self.created.lock().unwrap().push(data.clone());
        Ok(MemBucket::new(data))
    }
}
