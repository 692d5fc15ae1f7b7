//! Key and block types.
//!
//! Keys come in two variants: content-hash keys (CHK), derived from
//! the hash of the inserted bytes, and signed-subspace keys (SSK),
//! which carry an associated public key for mutable slots. The
//! cryptographic derivation of either is outside this crate; these
//! types only model identity and routing visibility.

use crate::{Id, KeyVerifyError, RoutingKey, Uri};
use bytes::Bytes;
use std::sync::Arc;

/// The routing-visible form of a key, as carried in request messages.
/// Discriminates CHK from SSK but carries no key material beyond the
/// routing hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKey {
    /// A content-hash key.
    Chk(RoutingKey),
    /// A signed-subspace key.
    Ssk(RoutingKey),
}

impl NodeKey {
    /// The routing key.
    pub fn routing_key(&self) -> &RoutingKey {
        match self {
            NodeKey::Chk(r) => r,
            NodeKey::Ssk(r) => r,
        }
    }

    /// Whether this is a signed-subspace key.
    pub fn is_ssk(&self) -> bool {
        matches!(self, NodeKey::Ssk(_))
    }
}

/// A full client-side key. Immutable. For SSK additionally carries the
/// public key of the subspace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClientKey {
    /// A content-hash key.
    Chk {
        /// The routing-visible hash.
        routing: RoutingKey,
    },
    /// A signed-subspace key.
    Ssk {
        /// The routing-visible hash.
        routing: RoutingKey,
        /// The public key of the subspace.
        pub_key: Bytes,
    },
}

impl ClientKey {
    /// Construct a CHK from routing bytes.
    pub fn chk(routing: impl Into<RoutingKey>) -> Self {
        Self::Chk {
            routing: routing.into(),
        }
    }

    /// Construct an SSK from routing bytes and a public key.
    pub fn ssk(routing: impl Into<RoutingKey>, pub_key: Bytes) -> Self {
        Self::Ssk {
            routing: routing.into(),
            pub_key,
        }
    }

    /// The routing key.
    pub fn routing_key(&self) -> &RoutingKey {
        match self {
            ClientKey::Chk { routing } => routing,
            ClientKey::Ssk { routing, .. } => routing,
        }
    }

    /// The routing-visible form of this key.
    pub fn node_key(&self) -> NodeKey {
        match self {
            ClientKey::Chk { routing } => NodeKey::Chk(routing.clone()),
            ClientKey::Ssk { routing, .. } => NodeKey::Ssk(routing.clone()),
        }
    }

    /// Whether this is a signed-subspace key.
    pub fn is_ssk(&self) -> bool {
        matches!(self, ClientKey::Ssk { .. })
    }

    /// The public key, for SSK variants.
    pub fn pub_key(&self) -> Option<&Bytes> {
        match self {
            ClientKey::Chk { .. } => None,
            ClientKey::Ssk { pub_key, .. } => Some(pub_key),
        }
    }

    /// The printable content address of this key.
    pub fn uri(&self) -> Uri {
        match self {
            ClientKey::Chk { routing } => {
                Uri(format!("CHK@{routing}"))
            }
            ClientKey::Ssk { routing, .. } => {
                Uri(format!("SSK@{routing}"))
            }
        }
    }
}

/// A raw keyed block: the key plus raw header and payload bytes, as
/// stored locally or reassembled from partial-receive state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyBlock {
    /// The key this block is stored under.
    pub key: ClientKey,
    /// Raw header bytes.
    pub headers: Bytes,
    /// Raw payload bytes.
    pub data: Bytes,
}

impl KeyBlock {
    /// Construct a new KeyBlock.
    pub fn new(key: ClientKey, headers: Bytes, data: Bytes) -> Self {
        Self { key, headers, data }
    }
}

/// A block verified against the client key that requested it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientKeyBlock {
    /// The verified key.
    pub key: ClientKey,
    /// Raw header bytes.
    pub headers: Bytes,
    /// Decoded payload bytes.
    pub data: Bytes,
}

impl ClientKeyBlock {
    /// Verify a raw block against the key that requested it.
    ///
    /// The delivered block's routing key must match the requested
    /// key's, and an SSK block must carry its public key. Fails with
    /// [KeyVerifyError] otherwise.
    pub fn decode(
        key: &ClientKey,
        block: KeyBlock,
    ) -> Result<Self, KeyVerifyError> {
        if block.key.routing_key() != key.routing_key() {
            return Err(KeyVerifyError::new(format!(
                "routing key mismatch: got {}, want {}",
                block.key.routing_key(),
                key.routing_key(),
            )));
        }
        if key.is_ssk() && block.key.pub_key().is_none() {
            return Err(KeyVerifyError::new(
                "ssk block delivered without public key",
            ));
        }
        Ok(Self {
            key: key.clone(),
            headers: block.headers,
            data: block.data,
        })
    }
}

/// Partial-receive state handed to a block transmitter. Contents are
/// owned by the packet I/O layer and opaque to this crate.
pub trait PartialBlock: 'static + Send + Sync + std::fmt::Debug {
    /// The complete raw data, once every packet has been received.
    fn raw_data(&self) -> Bytes;
}

/// Trait-object [PartialBlock].
pub type DynPartialBlock = Arc<dyn PartialBlock>;

/// Make a routing key from raw content bytes.
///
/// This is the identity derivation used by the in-memory
/// implementations: the first 32 bytes of the content, zero-padded.
/// Real deployments derive routing keys cryptographically; that
/// derivation is supplied by the environment.
pub fn synthetic_routing_key(content: &[u8]) -> RoutingKey {
    let mut value = content[..32.min(content.len())].to_vec();
    value.resize(32, 0);
    RoutingKey(Id(Bytes::from(value)))
}

#[cfg(test)]
mod test {
    use super::*;

    fn chk(b: &'static [u8]) -> ClientKey {
        ClientKey::chk(Bytes::from_static(b))
    }

    #[test]
    fn decode_happy() {
        let key = chk(b"some-routing-key");
        let block = KeyBlock::new(
            key.clone(),
            Bytes::from_static(b"h"),
            Bytes::from_static(b"d"),
        );
        let decoded = ClientKeyBlock::decode(&key, block).unwrap();
        assert_eq!(Bytes::from_static(b"d"), decoded.data);
    }

    #[test]
    fn decode_rejects_mismatched_routing_key() {
        let key = chk(b"some-routing-key");
        let block = KeyBlock::new(
            chk(b"another-routing-key"),
            Bytes::new(),
            Bytes::new(),
        );
        ClientKeyBlock::decode(&key, block).unwrap_err();
    }

    #[test]
    fn decode_rejects_ssk_without_pub_key() {
        let routing = Bytes::from_static(b"ssk-routing");
        let key = ClientKey::ssk(
            routing.clone(),
            Bytes::from_static(b"pub"),
        );
        // A block that lost its pub key along the way.
        let block = KeyBlock::new(
            ClientKey::chk(routing),
            Bytes::new(),
            Bytes::new(),
        );
        ClientKeyBlock::decode(&key, block).unwrap_err();
    }

    #[test]
    fn uri_is_variant_prefixed() {
        let key = chk(b"k");
        assert!(key.uri().as_str().starts_with("CHK@"));
        let key = ClientKey::ssk(
            Bytes::from_static(b"k"),
            Bytes::from_static(b"p"),
        );
        assert!(key.uri().as_str().starts_with("SSK@"));
    }

    #[test]
    fn synthetic_routing_key_pads() {
        let k = synthetic_routing_key(b"abc");
        assert_eq!(32, k.0 .0.len());
        // Deterministic for equal content.
        assert_eq!(k, synthetic_routing_key(b"abc"));
        assert_ne!(k, synthetic_routing_key(b"abd"));
    }
}
