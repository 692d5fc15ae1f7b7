#![deny(missing_docs)]
//! Warren API contains the collaborator traits and the basic types
//! required to define the api of the warren request lifecycle:
//! hierarchical insert orchestration, single-key fetching with
//! cooldown, and the node-side request handler.
//!
//! If you want to use warren itself, please see the warren_core crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub(crate) mod serde_bytes_base64 {
    pub fn serialize<S>(
        b: &bytes::Bytes,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use base64::prelude::*;
        serializer.serialize_str(&BASE64_URL_SAFE_NO_PAD.encode(b))
    }

    pub fn deserialize<'de, D, T: From<bytes::Bytes>>(
        deserializer: D,
    ) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use base64::prelude::*;
        let s: &'de str = serde::Deserialize::deserialize(deserializer)?;
        BASE64_URL_SAFE_NO_PAD
            .decode(s)
            .map(|v| bytes::Bytes::copy_from_slice(&v).into())
            .map_err(serde::de::Error::custom)
    }
}

mod error;
pub use error::*;

pub mod id;
pub use id::{Id, RoutingKey, Uri};

mod timestamp;
pub use timestamp::*;

pub mod key;
pub use key::*;

pub mod protocol;

pub mod config;

pub mod bucket;
pub use bucket::*;

pub mod manifest;
pub use manifest::*;

pub mod event;
pub use event::*;

pub mod insert;
pub use insert::*;

pub mod fetch;
pub use fetch::*;

pub mod node;
pub use node::*;
