//! Warren error types.

use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Construct a new DynInnerError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The general warren error type. Collaborator traits that can fail in
/// environment-specific ways (transport queues, bucket I/O, scheduler
/// registration) use this as their error.
///
/// This type is required to implement `Clone` to ease the use of
/// shared futures, which require the entire `Result` to be `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WrnError {
    /// Generic warren internal error.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },
}

impl WrnError {
    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }
}

/// The general warren result type.
pub type WrnResult<T> = Result<T, WrnError>;

/// Terminal error taxonomy on the insert side. Every one of these is
/// fatal for a manifest insert: the putter cancels its remaining
/// children and reports the failure to the client exactly once.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InsertError {
    /// A caller-supplied URI (e.g. the explicit default document name)
    /// did not resolve.
    #[error("invalid uri: {0}")]
    InvalidUri(Arc<str>),

    /// The bucket factory failed to materialize a bucket.
    #[error("bucket error (src: {0})")]
    BucketError(#[source] DynInnerError),

    /// A protocol invariant was violated.
    #[error("internal error: {0}")]
    Internal(Arc<str>),

    /// A child inserter failed; the failure is passed through verbatim.
    #[error("child insert failed: {0}")]
    Child(Arc<str>),
}

impl InsertError {
    /// Construct an invalid-uri error.
    pub fn invalid_uri<C: std::fmt::Display>(ctx: C) -> Self {
        Self::InvalidUri(ctx.to_string().into_boxed_str().into())
    }

    /// Construct a bucket error from an underlying I/O failure.
    pub fn bucket<S: std::error::Error + 'static + Send + Sync>(
        src: S,
    ) -> Self {
        Self::BucketError(DynInnerError::new(src))
    }

    /// Construct an internal error.
    pub fn internal<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Internal(ctx.to_string().into_boxed_str().into())
    }

    /// Construct a child passthrough error.
    pub fn child<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Child(ctx.to_string().into_boxed_str().into())
    }
}

/// Low-level failure taxonomy on the fetch side.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// The key was asked for and failed recently somewhere on the
    /// network; the request was suppressed before leaving this node.
    #[error("recently failed")]
    RecentlyFailed,

    /// A block was delivered but did not verify against the requested
    /// key. Fatal for the attempt.
    #[error("block decode failed (src: {0})")]
    DecodeFailed(#[source] DynInnerError),

    /// The key was not in the local store and the fetch context forbids
    /// going to the network.
    #[error("not found in local store")]
    StoreNotFound,

    /// A transient transport- or scheduler-level failure; the fetcher
    /// may retry.
    #[error("transient fetch failure: {0}")]
    Transient(Arc<str>),
}

impl FetchError {
    /// Construct a transient error.
    pub fn transient<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Transient(ctx.to_string().into_boxed_str().into())
    }
}

/// A delivered block failed verification against its key.
#[derive(Debug, Clone, thiserror::Error)]
#[error("key verify failed: {ctx}")]
pub struct KeyVerifyError {
    /// Context describing the mismatch.
    pub ctx: Arc<str>,
}

impl KeyVerifyError {
    /// Construct a new KeyVerifyError.
    pub fn new<C: std::fmt::Display>(ctx: C) -> Self {
        Self {
            ctx: ctx.to_string().into_boxed_str().into(),
        }
    }
}

impl From<KeyVerifyError> for FetchError {
    fn from(e: KeyVerifyError) -> Self {
        FetchError::DecodeFailed(DynInnerError::new(e))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            "bla (src: None)",
            WrnError::other("bla").to_string().as_str(),
        );
        assert_eq!(
            "foo (src: bar)",
            WrnError::other_src("foo", std::io::Error::other("bar"))
                .to_string()
                .as_str(),
        );
    }

    #[test]
    fn insert_error_display() {
        assert_eq!(
            "invalid uri: missing.html",
            InsertError::invalid_uri("missing.html").to_string().as_str(),
        );
        assert_eq!(
            "bucket error (src: disk full)",
            InsertError::bucket(std::io::Error::other("disk full"))
                .to_string()
                .as_str(),
        );
    }

    #[test]
    fn ensure_error_types_are_send_and_sync() {
        fn ensure<T: std::fmt::Display + Send + Sync>(_t: T) {}
        ensure(WrnError::other("bla"));
        ensure(InsertError::internal("bla"));
        ensure(FetchError::RecentlyFailed);
    }
}
