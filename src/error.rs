//! Error taxonomy shared across the crate. Each layer gets its own enum so
//! callers can match on the specific failure mode instead of a string.

use thiserror::Error;

/// Failure modes of [`crate::node::NodeInfo::allocate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocateError {
    #[error("insufficient GPU memory in one device")]
    Insufficient,

    #[error("optimistic lock conflict patching pod annotations")]
    Conflict,

    #[error("cluster API error: {0}")]
    Api(String),

    #[error("failed to bind pod to node: {0}")]
    Bind(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

/// Failure modes of cache-level node lookups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("node {0} not found in cluster view")]
    NodeNotFound(String),

    #[error("cluster API error: {0}")]
    Api(String),
}

/// Wraps the underlying cluster client's errors so the rest of the crate
/// never has to name `kube::Error` directly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("cluster API error: {0}")]
    Api(String),

    #[error("not found")]
    NotFound,

    #[error("optimistic lock conflict: {0}")]
    Conflict(String),
}

impl From<CacheError> for AllocateError {
    fn from(e: CacheError) -> Self {
        AllocateError::Api(e.to_string())
    }
}

impl From<ClusterError> for AllocateError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Conflict(_) => AllocateError::Conflict,
            ClusterError::NotFound => AllocateError::Api("pod not found".into()),
            ClusterError::Api(msg) => AllocateError::Api(msg),
        }
    }
}

/// Top-level error surfaced to HTTP handlers, used to build the extender's
/// JSON error envelope. Handlers never panic; every fallible path here
/// collapses into this type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtenderError {
    #[error("failed to parse request: {0}")]
    Parse(String),

    #[error("node is not for GPU share, need skip")]
    NotGpuSharingNode,

    #[error(transparent)]
    Allocate(#[from] AllocateError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("pod identity mismatch: {0}")]
    IdentityMismatch(String),
}

/// The exact text used by the upstream cluster API to signal an optimistic
/// concurrency conflict on a patch. Matched verbatim, as the protocol this
/// extends has no structured conflict error code.
pub const OPTIMISTIC_LOCK_ERROR_MSG: &str =
    "the object has been modified; please apply your changes to the latest version and try again";
