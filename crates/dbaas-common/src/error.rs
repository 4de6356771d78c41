//! Error types for the DBaaS control plane
//!
//! Errors carry the resource they relate to so that a failed reconcile
//! can be traced back to a specific facade, provider, or namespace.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status the API server returns for stale writes and create races
const HTTP_CONFLICT: u16 = 409;

/// HTTP status the API server returns for missing objects
const HTTP_NOT_FOUND: u16 = 404;

/// Main error type for DBaaS operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource is structurally unusable (bad reference, foreign owner, ...)
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// `namespace/name` of the offending resource
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being (de)serialized, if known
        kind: Option<String>,
    },

    /// A facade references a provider that has no registration
    #[error("provider {provider} referenced by {resource} is not registered")]
    ProviderNotFound {
        /// Provider name the facade asked for
        provider: String,
        /// `namespace/name` of the facade
        resource: String,
    },

    /// A connection or instance references an inventory that does not exist
    #[error("inventory {namespace}/{name} not found")]
    InventoryNotFound {
        /// Inventory name
        name: String,
        /// Inventory namespace
        namespace: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "registry", "watch", "authz")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a resource
    pub fn validation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a provider-not-found error
    pub fn provider_not_found(provider: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::ProviderNotFound {
            provider: provider.into(),
            resource: resource.into(),
        }
    }

    /// Create an inventory-not-found error
    pub fn inventory_not_found(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::InventoryNotFound {
            name: name.into(),
            namespace: namespace.into(),
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

    /// True when the API server rejected a write because the object changed
    /// underneath us (stale resourceVersion) or was created concurrently.
    ///
    /// Conflicts are always retried locally and never surfaced to users.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source } if crate::kube_utils::is_conflict(source))
    }

    /// True when the API server reported the target object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == HTTP_NOT_FOUND
        )
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec change to clear.
    /// Missing providers and inventories may be installed later, so they retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == HTTP_CONFLICT || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::ProviderNotFound { .. } => true,
            Error::InventoryNotFound { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
