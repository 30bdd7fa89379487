//! Error types for the Berth control plane
//!
//! One taxonomy shared by every layer: validation failures short-circuit,
//! store uniqueness violations surface as `AlreadyExists`, and everything
//! that touches an external system keeps its source error attached.

use thiserror::Error;

/// Main error type for Berth operations
#[derive(Debug, Error)]
pub enum Error {
    /// Structural validation failure in an RPC input or event payload
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what's invalid
        message: String,
    },

    /// Missing instance, pod, or binding
    #[error("{what} not found")]
    NotFound {
        /// What was looked up (e.g., "instance 42", "pod for instance 42")
        what: String,
    },

    /// Duplicate identifier at the store or cluster layer
    #[error("{what} already exists")]
    AlreadyExists {
        /// The duplicated object
        what: String,
    },

    /// External-port pool depletion
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// Description of the exhausted pool
        message: String,
    },

    /// Inconsistent persisted state (e.g., instance with empty tenant)
    #[error("failed precondition: {message}")]
    FailedPrecondition {
        /// Description of the precondition
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Database error
    #[error("store error: {source}")]
    Store {
        /// The underlying sqlx error
        #[from]
        source: sqlx::Error,
    },

    /// Message broker error
    #[error("broker error: {source}")]
    Broker {
        /// The underlying lapin error
        #[from]
        source: lapin::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "exec", "consumer")
        context: String,
    },
}

/// Default context value when no specific context is available
const UNKNOWN_CONTEXT: &str = "unknown";

impl Error {
    /// Create a validation error with the given message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given object
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an already-exists error for the given object
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    /// Create a resource-exhausted error with the given message
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: msg.into(),
        }
    }

    /// Create a failed-precondition error with the given message
    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error names a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
            || matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Whether this error names a duplicate object
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
            || matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this error is retryable
    ///
    /// Validation, not-found, and duplicate errors require a caller-side
    /// fix; transient store, broker, and cluster errors do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors, not on 4xx responses
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::InvalidArgument { .. } => false,
            Error::NotFound { .. } => false,
            Error::AlreadyExists { .. } => false,
            Error::ResourceExhausted { .. } => false,
            Error::FailedPrecondition { .. } => false,
            Error::Store { .. } => true,
            Error::Broker { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::InvalidArgument { .. } => tonic::Status::invalid_argument(message),
            Error::NotFound { .. } => tonic::Status::not_found(message),
            Error::AlreadyExists { .. } => tonic::Status::already_exists(message),
            Error::ResourceExhausted { .. } => tonic::Status::resource_exhausted(message),
            Error::FailedPrecondition { .. } => tonic::Status::failed_precondition(message),
            Error::Kube { .. } | Error::Store { .. } | Error::Broker { .. } => {
                tonic::Status::internal(message)
            }
            Error::Internal { .. } => tonic::Status::internal(message),
        }
    }
}
