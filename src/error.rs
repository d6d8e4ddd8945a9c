//! Error types for the liberator controller

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the controller's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the object store adapter
#[derive(Error, Debug)]
pub enum StoreError {
    /// The object does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Optimistic concurrency rejection: the object changed since it was read
    #[error("conflict writing {kind} {name}: object was modified")]
    Conflict { kind: &'static str, name: String },

    /// Connectivity, timeout or any other API failure
    #[error("transient failure on {kind} {name}: {source}")]
    Transient {
        kind: &'static str,
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    /// Map a kube API error onto the store taxonomy
    pub fn from_kube(kind: &'static str, name: impl Into<String>, err: kube::Error) -> Self {
        let name = name.into();
        match err {
            kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound { kind, name },
            kube::Error::Api(api_err) if api_err.code == 409 => StoreError::Conflict { kind, name },
            other => StoreError::Transient {
                kind,
                name,
                source: Box::new(other),
            },
        }
    }

    /// Create a transient failure from any error or message
    pub fn transient(
        kind: &'static str,
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        StoreError::Transient {
            kind,
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Controller error types
#[derive(Error, Debug)]
pub enum Error {
    /// Object store read or write failed
    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed claim identity handed to the reconciler
    #[error("Invalid claim identity: {0}")]
    InvalidIdentity(String),

    /// Reconciliation was cancelled before it finished
    #[error("Reconciliation cancelled")]
    Cancelled,

    /// Reconciliation ran past its deadline
    #[error("Reconciliation exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),

    /// Kubernetes API error outside the reconcile path
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Leader election lease could not be renewed in time
    #[error("Leadership lost: {0}")]
    LeadershipLost(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid identity error
    pub fn invalid_identity(msg: impl Into<String>) -> Self {
        Error::InvalidIdentity(msg.into())
    }

    /// Whether the host should requeue the request after this error.
    ///
    /// Contract violations are dropped so they cannot loop forever.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::InvalidIdentity(_) | Error::Config(_))
    }

    /// Short label used for metrics and structured logs
    pub fn class(&self) -> &'static str {
        match self {
            Error::Store(StoreError::NotFound { .. }) => "not_found",
            Error::Store(StoreError::Conflict { .. }) => "conflict",
            Error::Store(StoreError::Transient { .. }) => "transient",
            Error::InvalidIdentity(_) => "invalid_identity",
            Error::Cancelled => "cancelled",
            Error::DeadlineExceeded(_) => "deadline_exceeded",
            Error::Kube(_) => "kube",
            Error::Config(_) => "config",
            Error::LeadershipLost(_) => "leadership_lost",
        }
    }
}
