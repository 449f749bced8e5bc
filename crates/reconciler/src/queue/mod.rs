//! Work queue between enqueue handlers and workers.
//!
//! The queue guarantees that an item is never processed by two workers at
//! once, collapses duplicate adds of a pending item, and supports delayed and
//! rate-limited re-adds for retries.

pub mod rate_limiter;
pub mod work_queue;

use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;

pub use rate_limiter::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};
pub use work_queue::RateLimitingQueue;

/// Bounds shared by everything that can sit in a queue.
pub trait QueueItem: Clone + Eq + Hash + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + 'static> QueueItem for T {}

/// A deduplicating, delayable, rate-limited work queue.
#[async_trait]
pub trait Queue<T: QueueItem>: Send + Sync {
    /// Mark `item` as needing processing.
    ///
    /// A no-op if `item` is already queued. If `item` is being processed it is
    /// queued again once [`Queue::done`] is called for it.
    fn add(&self, item: T);

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shut down and drained.
    async fn get(&self) -> Option<T>;

    /// Mark `item` as no longer being processed.
    fn done(&self, item: &T);

    /// Reset the rate limiter's memory of `item`.
    fn forget(&self, item: &T);

    /// Add `item` once the rate limiter says it may be retried.
    fn add_rate_limited(&self, item: T);

    /// Add `item` once `delay` has elapsed.
    fn add_after(&self, item: T, delay: Duration);

    /// How many times `item` has been rate-limited since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;

    /// Number of items ready to be handed out.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting items. Pending items can still be drained with `get`.
    fn shut_down(&self);

    fn is_shutting_down(&self) -> bool;
}
