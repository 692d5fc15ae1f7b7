//! Warren wire protocol reply types.
//!
//! Every reply a request handler produces travels as a single
//! [WireProto] envelope: a message type, the request uid, and the
//! optional payload fields the type calls for. The message type names
//! are the compatibility surface; the framing of the envelope on the
//! underlying connection belongs to the transport.

use crate::{WrnError, WrnResult};

/// A warren reply message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireProto {
    /// The message type.
    #[prost(enumeration = "wire_proto::Ty", tag = "1")]
    pub ty: i32,
    /// The 64-bit identifier pairing this reply with its request.
    #[prost(uint64, tag = "2")]
    pub uid: u64,
    /// Raw block headers (CHK_DATA_FOUND, SSK_DATA_FOUND).
    #[prost(bytes = "bytes", optional, tag = "3")]
    pub headers: ::core::option::Option<::prost::bytes::Bytes>,
    /// Raw block data (SSK_DATA_FOUND).
    #[prost(bytes = "bytes", optional, tag = "4")]
    pub data: ::core::option::Option<::prost::bytes::Bytes>,
    /// Public key bytes (SSK_PUB_KEY).
    #[prost(bytes = "bytes", optional, tag = "5")]
    pub pub_key: ::core::option::Option<::prost::bytes::Bytes>,
    /// Hops left on the downstream request (ROUTE_NOT_FOUND).
    #[prost(uint32, optional, tag = "6")]
    pub hops_left: ::core::option::Option<u32>,
    /// Whether the overload was generated locally
    /// (REJECTED_OVERLOAD).
    #[prost(bool, optional, tag = "7")]
    pub local: ::core::option::Option<bool>,
}

/// Nested types for [WireProto].
pub mod wire_proto {
    /// The reply message type.
    #[derive(
        Clone,
        Copy,
        Debug,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Ty {
        /// Unspecified message type.
        Unspecified = 0,
        /// The request was accepted and is being worked on.
        Accepted = 1,
        /// A CHK block was found; headers attached, payload follows
        /// as a streamed block transfer.
        ChkDataFound = 2,
        /// An SSK block was found; headers and data attached.
        SskDataFound = 3,
        /// The public key for an SSK, when the requester asked for it.
        SskPubKey = 4,
        /// The data could not be found.
        DataNotFound = 5,
        /// Routing dead-ended before the data was found.
        RouteNotFound = 6,
        /// The request was rejected due to overload.
        RejectedOverload = 7,
    }

    impl Ty {
        /// String value of the enum field names used in the ProtoBuf
        /// definition.
        pub fn as_str_name(&self) -> &'static str {
            match self {
                Ty::Unspecified => "UNSPECIFIED",
                Ty::Accepted => "ACCEPTED",
                Ty::ChkDataFound => "CHK_DATA_FOUND",
                Ty::SskDataFound => "SSK_DATA_FOUND",
                Ty::SskPubKey => "SSK_PUB_KEY",
                Ty::DataNotFound => "DATA_NOT_FOUND",
                Ty::RouteNotFound => "ROUTE_NOT_FOUND",
                Ty::RejectedOverload => "REJECTED_OVERLOAD",
            }
        }
    }
}

impl WireProto {
    fn base(ty: wire_proto::Ty, uid: u64) -> Self {
        Self {
            ty: ty as i32,
            uid,
            headers: None,
            data: None,
            pub_key: None,
            hops_left: None,
            local: None,
        }
    }

    /// An ACCEPTED reply.
    pub fn accepted(uid: u64) -> Self {
        Self::base(wire_proto::Ty::Accepted, uid)
    }

    /// A CHK_DATA_FOUND reply carrying the block headers.
    pub fn chk_data_found(uid: u64, headers: bytes::Bytes) -> Self {
        Self {
            headers: Some(headers),
            ..Self::base(wire_proto::Ty::ChkDataFound, uid)
        }
    }

    /// An SSK_DATA_FOUND reply carrying headers and data.
    pub fn ssk_data_found(
        uid: u64,
        headers: bytes::Bytes,
        data: bytes::Bytes,
    ) -> Self {
        Self {
            headers: Some(headers),
            data: Some(data),
            ..Self::base(wire_proto::Ty::SskDataFound, uid)
        }
    }

    /// An SSK_PUB_KEY reply carrying the subspace public key.
    pub fn ssk_pub_key(uid: u64, pub_key: bytes::Bytes) -> Self {
        Self {
            pub_key: Some(pub_key),
            ..Self::base(wire_proto::Ty::SskPubKey, uid)
        }
    }

    /// A DATA_NOT_FOUND reply.
    pub fn data_not_found(uid: u64) -> Self {
        Self::base(wire_proto::Ty::DataNotFound, uid)
    }

    /// A ROUTE_NOT_FOUND reply carrying the hops left downstream.
    pub fn route_not_found(uid: u64, hops_left: u32) -> Self {
        Self {
            hops_left: Some(hops_left),
            ..Self::base(wire_proto::Ty::RouteNotFound, uid)
        }
    }

    /// A REJECTED_OVERLOAD reply. `local` is true when the overload
    /// was generated by this node rather than forwarded.
    pub fn rejected_overload(uid: u64, local: bool) -> Self {
        Self {
            local: Some(local),
            ..Self::base(wire_proto::Ty::RejectedOverload, uid)
        }
    }

    /// Encode this message to bytes.
    pub fn encode(&self) -> WrnResult<bytes::Bytes> {
        let mut out = bytes::BytesMut::new();
        prost::Message::encode(self, &mut out)
            .map_err(|e| WrnError::other_src("encode wire message", e))?;
        Ok(out.freeze())
    }

    /// Decode a message from bytes.
    pub fn decode(data: bytes::Bytes) -> WrnResult<Self> {
        <Self as prost::Message>::decode(data)
            .map_err(|e| WrnError::other_src("decode wire message", e))
    }
}
