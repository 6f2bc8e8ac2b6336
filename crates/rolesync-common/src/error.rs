//! Error types for rolesync
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the reconciliation key, object identity, or
//! subsystem where the failure happened.

use thiserror::Error;

/// Main error type for rolesync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The PolicyDomain for a reconciliation key is not in the cache
    #[error("policy domain {key} does not exist in cache")]
    DomainNotFound {
        /// Reconciliation key that was looked up
        key: String,
    },

    /// A queue entry could not be interpreted as a reconciliation key
    #[error("malformed reconciliation key {key:?}")]
    MalformedKey {
        /// The raw key
        key: String,
    },

    /// The signed policy payload could not be converted
    #[error("conversion error for {domain}: {message}")]
    Conversion {
        /// Domain being converted
        domain: String,
        /// Description of what failed
        message: String,
    },

    /// Applying a change item to the cluster failed
    #[error("apply error for {kind} {name}: {message}")]
    Apply {
        /// Kind of the authorization object
        kind: String,
        /// Namespaced name of the object (namespace/name)
        name: String,
        /// Description of what failed
        message: String,
        /// Whether the failure was an optimistic-concurrency conflict
        conflict: bool,
    },

    /// Watch caches did not reach their initial sync in time
    #[error("timed out waiting for caches to sync: {}", caches.join(", "))]
    CacheSync {
        /// Names of the caches that never synced
        caches: Vec<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "worker", "config-store")
        context: String,
    },
}

impl Error {
    /// Create a domain-not-found error for a reconciliation key
    pub fn domain_not_found(key: impl Into<String>) -> Self {
        Self::DomainNotFound { key: key.into() }
    }

    /// Create a malformed-key error
    pub fn malformed_key(key: impl Into<String>) -> Self {
        Self::MalformedKey { key: key.into() }
    }

    /// Create a conversion error for a domain
    pub fn conversion(domain: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conversion {
            domain: domain.into(),
            message: msg.into(),
        }
    }

    /// Create an apply error for an object
    pub fn apply(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
            conflict: false,
        }
    }

    /// Create an apply error caused by a stale resourceVersion
    pub fn apply_conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
            conflict: true,
        }
    }

    /// Create a cache sync error listing the caches that never synced
    pub fn cache_sync(caches: Vec<String>) -> Self {
        Self::CacheSync { caches }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is worth a rate-limited requeue
    ///
    /// Malformed keys and conversion failures cannot succeed on retry.
    /// A missing domain may show up on the next cache event, and apply
    /// conflicts resolve once the cache catches up with the new version.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::DomainNotFound { .. } => true,
            Error::MalformedKey { .. } => false,
            Error::Conversion { .. } => false,
            Error::Apply { .. } => true,
            Error::CacheSync { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}
