//! Core error types for fleet object and cluster operations.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;

/// Core error type shared by the object model and cluster backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Object access errors
    #[error("object has no accessible metadata: {reason}")]
    MissingMetadata { reason: String },

    #[error("{kind} '{key}' not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: String, key: String },

    #[error("conflict updating {kind} '{key}': expected resource version {expected}, found {actual}")]
    Conflict {
        kind: String,
        key: String,
        expected: String,
        actual: String,
    },

    // Selector errors
    #[error("invalid label selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    // Cluster errors
    #[error("cache for cluster '{cluster}' is unavailable: {reason}")]
    CacheUnavailable { cluster: String, reason: String },

    #[error("client for cluster '{cluster}' is unavailable: {reason}")]
    ClientUnavailable { cluster: String, reason: String },

    #[error("namespace '{namespace}' is outside the cache scope of cluster '{cluster}'")]
    OutOfScope { cluster: String, namespace: String },

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Create a missing metadata error.
    pub fn missing_metadata(reason: impl Into<String>) -> Self {
        Self::MissingMetadata {
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create an invalid selector error.
    pub fn invalid_selector(selector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSelector {
            selector: selector.into(),
            reason: reason.into(),
        }
    }

    /// Create a cache unavailable error.
    pub fn cache_unavailable(cluster: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CacheUnavailable {
            cluster: cluster.into(),
            reason: reason.into(),
        }
    }

    /// Create a client unavailable error.
    pub fn client_unavailable(cluster: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ClientUnavailable {
            cluster: cluster.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("Pod", "default/pod-a");
        assert_eq!(err.to_string(), "Pod 'default/pod-a' not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_invalid_selector_display() {
        let err = Error::invalid_selector("app in (", "unterminated value set");
        assert!(err.to_string().contains("app in ("));
        assert!(err.to_string().contains("unterminated"));
        assert!(!err.is_not_found());
    }
}
