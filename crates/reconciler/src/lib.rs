//! Level-triggered reconciliation across many clusters.
//!
//! Events from any number of clusters are turned into [`Request`]s, which
//! name an object and the cluster it lives in. Requests flow through a
//! deduplicating, rate-limited work queue to a pool of workers that call a
//! user-supplied [`Reconciler`].
//!
//! # Key Concepts
//!
//! ## Requests
//!
//! A request says *which* object to look at, never *what* changed. Many events
//! for the same object collapse into one queued request, and a reconciler
//! reads the current state through [`Request::client`].
//!
//! ## Results
//!
//! - Error: requeue with per-item backoff and pause the worker
//! - `requeue_after`: requeue once the delay has elapsed
//! - `requeue`: requeue with per-item backoff
//! - Otherwise: converged, reset the backoff
//!
//! ## Wiring
//!
//! - [`Controller`] owns a reconciler, its queue and the clusters it watches
//! - [`EnqueueRequestHandler`] turns cluster events into requests, for the
//!   object itself or for its owners
//! - [`WatchOptions`] filters events on the client side
//! - [`Manager`] starts and syncs caches before running controllers
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use fleet_cluster::{ClusterOptions, InMemoryCluster};
//! use fleet_core::ResourceKind;
//! use fleet_reconciler::{
//!     Controller, ControllerOptions, Manager, ReconcileResult, ReconcilerFn, Request, WatchOptions,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> fleet_reconciler::Result<()> {
//!     let token = CancellationToken::new();
//!     let cluster = Arc::new(InMemoryCluster::new("c1", ClusterOptions::default()));
//!     let reconciler = ReconcilerFn::new(|req: Request| async move {
//!         println!("reconciling {req}");
//!         Ok(ReconcileResult::done())
//!     });
//!
//!     let mut controller = Controller::new("pods", Arc::new(reconciler), ControllerOptions::default())?;
//!     controller
//!         .watch_resource_reconcile_object(&token, cluster, &ResourceKind::new("", "v1", "Pod"), WatchOptions::new())
//!         .await?;
//!
//!     let mut manager = Manager::new();
//!     manager.add(controller);
//!     manager.start(token).await
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod manager;
pub mod queue;
pub mod reconciler;
pub mod types;
pub mod watch;

// Re-export main types
pub use config::{ControllerConfig, RateLimiterConfig};
pub use controller::{Controller, ControllerOptions};
pub use error::{Error, Result};
pub use handler::{EnqueueMode, EnqueueRequestHandler, OwnerSpec};
pub use manager::Manager;
pub use queue::{Queue, RateLimiter, RateLimitingQueue, default_controller_rate_limiter};
pub use reconciler::{Reconciler, ReconcilerFn};
pub use types::{Disposition, ReconcileResult, Request};
pub use watch::{
    GenerationChangedPredicate, LabelsChangedPredicate, Predicate, PredicateFn,
    ResourceVersionChangedPredicate, WatchOptions,
};
