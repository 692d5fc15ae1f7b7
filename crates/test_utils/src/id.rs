//! Test utilities associated with ids and keys.

use bytes::Bytes;
use warren_api::*;

use crate::random_bytes;

/// Create a random id.
pub fn random_id() -> Id {
    Id(Bytes::from(random_bytes(32)))
}

/// Create a random routing key.
pub fn random_routing_key() -> RoutingKey {
    RoutingKey(random_id())
}

/// Create a random content-hash client key.
pub fn random_chk() -> ClientKey {
    ClientKey::chk(random_id().0)
}

/// Create a random signed-subspace client key.
pub fn random_ssk() -> ClientKey {
    ClientKey::ssk(random_id().0, Bytes::from(random_bytes(32)))
}

/// Create a block stored under the given key.
pub fn block_for(key: &ClientKey) -> KeyBlock {
    KeyBlock::new(
        key.clone(),
        Bytes::from(random_bytes(16)),
        Bytes::from(random_bytes(64)),
    )
}
