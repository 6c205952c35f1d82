//! Error types for the Canopy controller

use thiserror::Error;

/// Main error type for Canopy operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that does not map onto a more specific variant
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The named object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: &'static str,
        /// Object key
        name: String,
    },

    /// An object with the same name already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: &'static str,
        /// Object key
        name: String,
    },

    /// Optimistic concurrency check failed (stale resource version)
    #[error("conflict writing {kind} {name}: object was modified")]
    Conflict {
        /// Resource kind
        kind: &'static str,
        /// Object key
        name: String,
    },

    /// Validation error for CRD specs or configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Client certificate or kubeconfig generation failed
    #[error("credential error: {0}")]
    Credential(String),

    /// Notification rendering or delivery failed
    #[error("notification error: {0}")]
    Notification(String),

    /// Unexpected internal failure (panicked reconcile, closed channel)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error for the given kind and key
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create an already-exists error for the given kind and key
    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Create a conflict error for the given kind and key
    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a credential error with the given message
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create a notification error with the given message
    pub fn notification(msg: impl Into<String>) -> Self {
        Self::Notification(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the error means the object is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when a write lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True when a create collided with an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether re-running the operation later can succeed.
    ///
    /// Client-side API errors (4xx other than conflicts) and malformed input
    /// will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(ae)) => !(400..500).contains(&ae.code) || ae.code == 429,
            Self::Kube(_) => true,
            Self::Conflict { .. } | Self::AlreadyExists { .. } => true,
            Self::Internal(_) | Self::Notification(_) | Self::Credential(_) => true,
            Self::NotFound { .. } | Self::Validation(_) | Self::Serialization(_) => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
