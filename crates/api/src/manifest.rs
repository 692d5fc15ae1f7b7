//! Manifest model types.
//!
//! A manifest is a directory-like structure mapping names to inserted
//! object URIs or to nested manifests. The input to a manifest insert
//! is a tree of [ManifestElement]s; the output is a serialized
//! [Metadata::RedirectionManifest] in which every entry is either a
//! redirect or the inline metadata bytes of a small leaf.

use crate::{DynBucket, InsertError, Uri};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Client metadata attached to a document.
#[derive(
    Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct ClientMeta {
    /// The MIME type of the document.
    pub mime: String,
}

impl ClientMeta {
    /// Construct client metadata for a MIME type.
    pub fn new(mime: impl Into<String>) -> Self {
        Self { mime: mime.into() }
    }
}

/// One leaf of a manifest tree. Exactly one of `target_uri` and `data`
/// is set: a prebuilt redirect to existing content, or a bucket of
/// data to insert. The name contains no `/` (flattened forms join
/// path segments with `/`; see the putter's flatten/unflatten
/// helpers).
#[derive(Clone, Debug)]
pub struct ManifestElement {
    /// The document name.
    pub name: String,
    /// Redirect target, for prebuilt redirects.
    pub target_uri: Option<Uri>,
    /// Data to insert, for fresh content.
    pub data: Option<DynBucket>,
    /// Explicit MIME type. MIME guessing from the name is an
    /// environment concern; absent means no client metadata.
    pub mime_override: Option<String>,
    /// The size of the data, zero for redirects.
    pub size: u64,
}

impl ManifestElement {
    /// A fresh-content element wrapping a data bucket.
    pub fn from_bucket(
        name: impl Into<String>,
        data: DynBucket,
        mime_override: Option<String>,
    ) -> Self {
        let size = data.size();
        Self {
            name: name.into(),
            target_uri: None,
            data: Some(data),
            mime_override,
            size,
        }
    }

    /// A prebuilt redirect element.
    pub fn from_target(
        name: impl Into<String>,
        target: Uri,
        mime_override: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target_uri: Some(target),
            data: None,
            mime_override,
            size: 0,
        }
    }

    /// This element under a different (e.g. fully path-qualified)
    /// name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.name = name.into();
        out
    }
}

/// A node of a manifest tree: a leaf element or a nested subtree.
#[derive(Clone, Debug)]
pub enum ManifestNode {
    /// A leaf element.
    Leaf(ManifestElement),
    /// A nested subtree.
    Dir(ManifestTree),
}

/// A manifest tree: mapping from path segment to leaf or subtree.
pub type ManifestTree = BTreeMap<String, ManifestNode>;

/// A node of serialized metadata inside a redirection manifest:
/// either the inline metadata bytes of one document, or a nested
/// subtree.
#[derive(
    Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub enum MetaNode {
    /// Inline serialized metadata of one document.
    Inline(Bytes),
    /// A nested subtree.
    Dir(BTreeMap<String, MetaNode>),
}

/// A metadata object, as inserted into the network.
#[derive(
    Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub enum Metadata {
    /// A redirect to a single target URI.
    SimpleRedirect {
        /// The redirect target.
        target: Uri,
        /// Client metadata, if any.
        mime: Option<String>,
    },
    /// A redirection manifest with metadata: each entry is either a
    /// URI redirect or inline metadata bytes for small leaves. The
    /// empty-string key, when present, names the default document.
    RedirectionManifest {
        /// The entries by name.
        entries: BTreeMap<String, MetaNode>,
    },
}

impl Metadata {
    /// Construct a simple redirect.
    pub fn simple_redirect(target: Uri, mime: Option<String>) -> Self {
        Self::SimpleRedirect { target, mime }
    }

    /// Construct a redirection manifest with metadata from a tree of
    /// serialized entries.
    pub fn redirection_manifest_with_metadata(
        entries: BTreeMap<String, MetaNode>,
    ) -> Self {
        Self::RedirectionManifest { entries }
    }

    /// Serialize this metadata object.
    pub fn to_bytes(&self) -> Result<Bytes, InsertError> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(|e| {
                InsertError::internal(format!(
                    "serialize metadata: {e}"
                ))
            })
    }

    /// Deserialize a metadata object.
    pub fn from_bytes(data: &[u8]) -> Result<Self, InsertError> {
        postcard::from_bytes(data).map_err(|e| {
            InsertError::internal(format!("deserialize metadata: {e}"))
        })
    }
}
