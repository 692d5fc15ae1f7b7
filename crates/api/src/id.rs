//! Types dealing with data identity.

macro_rules! imp_deref {
    ($i:ty, $t:ty) => {
        impl std::ops::Deref for $i {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

macro_rules! imp_from {
    ($a:ty, $b:ty, $i:ident => $e:expr) => {
        impl From<$b> for $a {
            fn from($i: $b) -> Self {
                $e
            }
        }
    };
}

/// Base data identity type meant for newtyping.
/// You probably want [RoutingKey].
///
/// In warren these bytes should ONLY be the actual hash bytes of the
/// identity being tracked, without prefix or suffix.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Id(#[serde(with = "crate::serde_bytes_base64")] pub bytes::Bytes);

imp_deref!(Id, bytes::Bytes);
imp_from!(Id, bytes::Bytes, b => Id(b));

impl Id {
    /// Get the location u32 based off this Id.
    ///
    /// This is accomplished by directly xor-ing every successive 4
    /// bytes in the hash. It is okay if the hash len is not a multiple
    /// of 4, it will stop with the ending byte of the hash.
    ///
    /// The remaining 4 bytes are then interpreted as a little-endian
    /// u32.
    pub fn loc(&self) -> u32 {
        let mut out = [0_u8; 4];
        for i in 0..self.0.len() {
            out[i % 4] ^= self.0[i];
        }
        u32::from_le_bytes(out)
    }
}

fn display_base64(
    b: &bytes::Bytes,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    use base64::prelude::*;
    f.write_str(&BASE64_URL_SAFE_NO_PAD.encode(b))
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        display_base64(&self.0, f)
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        display_base64(&self.0, f)
    }
}

/// The routing-visible hash of a key. This is what travels in request
/// messages, what the scheduler indexes pending fetches by, and what
/// the local store is keyed on.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct RoutingKey(pub Id);

imp_deref!(RoutingKey, Id);
imp_from!(RoutingKey, bytes::Bytes, b => RoutingKey(Id(b)));
imp_from!(RoutingKey, Id, b => RoutingKey(b));

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        display_base64(&self.0 .0, f)
    }
}

impl std::fmt::Debug for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        display_base64(&self.0 .0, f)
    }
}

impl RoutingKey {
    /// The normalized ring location of this key, in `[0, 1)`.
    pub fn location(&self) -> f64 {
        self.0.loc() as f64 / (u32::MAX as f64 + 1.0)
    }
}

/// Printable content address produced by inserting a block.
/// Constant once emitted.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Uri(pub String);

impl Uri {
    /// The placeholder target used for an insert whose content hash is
    /// not known yet.
    pub fn empty_chk() -> Self {
        Self("CHK@".into())
    }

    /// Get the uri as a str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

imp_from!(Uri, String, s => Uri(s));
imp_from!(Uri, &str, s => Uri(s.into()));

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
