//! Cluster collaborators for fleet.
//!
//! - **Interface**: [`Cluster`], [`Cache`] and [`Client`], the capabilities
//!   the reconciliation core needs from one cluster
//! - **Events**: [`ResourceEventHandler`] and the closure-based [`HandlerFuncs`]
//! - **Backend**: [`InMemoryCluster`], an in-process cluster with an informer
//!   cache, periodic resync and namespace scoping

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cluster;
pub mod handler;
pub mod memory;

pub use cluster::{Cache, Client, Cluster};
pub use handler::{HandlerFuncs, ResourceEventHandler};
pub use memory::{CacheOptions, ClusterOptions, InMemoryClient, InMemoryCluster};
