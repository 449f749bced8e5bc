//! Error types for the reconciler crate.

use std::fmt;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone)]
pub enum Error {
    /// Reconciliation of one request failed.
    ReconcileFailed { reason: String },
    /// Registering an event handler on a cluster failed.
    WatchFailed {
        cluster: String,
        kind: String,
        reason: String,
    },
    /// A watched cluster's cache never synced.
    CacheSyncFailed { cluster: String },
    /// A watched cluster's cache stopped with an error.
    CacheFailed { cluster: String, reason: String },
    /// Invalid configuration.
    InvalidConfig { reason: String },
    /// Error returned by a cluster collaborator.
    Cluster(fleet_core::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReconcileFailed { reason } => {
                write!(f, "reconciliation failed: {reason}")
            }
            Self::WatchFailed {
                cluster,
                kind,
                reason,
            } => {
                write!(f, "failed to watch {kind} on cluster '{cluster}': {reason}")
            }
            Self::CacheSyncFailed { cluster } => {
                write!(f, "cache for cluster '{cluster}' failed to sync")
            }
            Self::CacheFailed { cluster, reason } => {
                write!(f, "cache for cluster '{cluster}' failed: {reason}")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
            Self::Cluster(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cluster(err) => Some(err),
            _ => None,
        }
    }
}

impl From<fleet_core::Error> for Error {
    fn from(err: fleet_core::Error) -> Self {
        Self::Cluster(err)
    }
}

impl Error {
    /// Create a reconcile failed error.
    pub fn reconcile_failed(reason: impl Into<String>) -> Self {
        Self::ReconcileFailed {
            reason: reason.into(),
        }
    }

    /// Create a watch failed error.
    pub fn watch_failed(
        cluster: impl Into<String>,
        kind: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::WatchFailed {
            cluster: cluster.into(),
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create a cache sync failed error.
    pub fn cache_sync_failed(cluster: impl Into<String>) -> Self {
        Self::CacheSyncFailed {
            cluster: cluster.into(),
        }
    }

    /// Create a cache failed error.
    pub fn cache_failed(cluster: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CacheFailed {
            cluster: cluster.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
