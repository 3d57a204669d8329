//! # Errors
//!
//! Error taxonomy of the reconcile engine.
//!
//! "Not ready yet" is not an error: steps report it as a wait outcome and the
//! driver requeues with a bounded delay.

use thiserror::Error;

/// Failures talking to the object store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} was modified concurrently")]
    Conflict(String),

    #[error("Object is missing {0}")]
    MissingMetadata(&'static str),
}

/// Failures surfaced by a reconcile pass
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// A builder cannot construct a valid child from the spec
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// Transient failure talking to the object store
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A merge, render or generation step failed unexpectedly
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReconcilerError {
    /// Condition reason recorded for this error
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcilerError::InvalidSpec(_) => "InvalidSpec",
            ReconcilerError::Store(_) => "BackendError",
            ReconcilerError::Internal(_) => "InternalError",
        }
    }

    pub(crate) fn internal(context: &str, error: impl std::fmt::Display) -> Self {
        ReconcilerError::Internal(format!("{context}: {error}"))
    }
}
