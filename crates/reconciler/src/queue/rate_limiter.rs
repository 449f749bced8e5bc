//! Per-item retry delays.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use super::QueueItem;

/// Decides how long an item must wait before it is retried.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`. Counts as one retry.
    fn when(&self, item: &T) -> Duration;

    /// Stop tracking `item`, resetting its backoff.
    fn forget(&self, item: &T);

    /// Number of retries recorded for `item`.
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Calculate exponential backoff: `base * 2^attempt`, capped at `max`.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T: QueueItem> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: QueueItem> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        calculate_backoff(attempt, self.base, self.max)
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all items.
///
/// Holds up to `burst` tokens refilled at `qps` per second. Each retry takes
/// one token; when the bucket is empty the retry is delayed until its token
/// would have been refilled.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    fn reserve(&self) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = elapsed.mul_add(self.qps, bucket.tokens).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// The longest delay of several limiters.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        // Every limiter must observe the retry, so no short-circuiting.
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item exponential backoff from 5ms to 1000s, combined with an overall
/// 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<T: QueueItem>() -> MaxOfRateLimiter<T> {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_per_failure() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));

        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues(&"a"), 3);

        // Items are tracked independently.
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_millis(30));
        let delays: Vec<_> = (0..6).map(|_| limiter.when(&"a")).collect();
        assert_eq!(delays.last(), Some(&Duration::from_millis(30)));
    }

    #[test]
    fn test_forget_resets_backoff() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));

        // Forgetting twice is the same as forgetting once.
        limiter.forget(&"a");
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_allows_burst_then_spaces_retries() {
        let limiter = BucketRateLimiter::new(10.0, 2);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"b"), Duration::ZERO);

        let third = RateLimiter::<&str>::when(&limiter, &"c");
        assert!(third > Duration::ZERO);
        assert!(third <= Duration::from_millis(100));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"d"), Duration::ZERO);
    }

    #[test]
    fn test_max_of_takes_longest_delay() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(1),
                Duration::from_secs(1),
            )),
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(50),
                Duration::from_secs(1),
            )),
        ]);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(50));
        assert_eq!(limiter.num_requeues(&"a"), 1);
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_limiter_starts_at_five_millis() {
        let limiter = default_controller_rate_limiter::<String>();
        let item = "c1/default/pod-a".to_string();
        assert_eq!(limiter.when(&item), Duration::from_millis(5));
        assert_eq!(limiter.when(&item), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&item), 2);
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_bounded(
            base_ms in 1u64..1_000,
            max_ms in 1u64..100_000,
            failures in 1usize..64,
        ) {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(max_ms);
            let limiter = ItemExponentialFailureRateLimiter::new(base, max);

            let delays: Vec<_> = (0..failures).map(|_| limiter.when(&0u8)).collect();
            prop_assert!(delays.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(delays.iter().all(|d| *d <= max));
            prop_assert_eq!(delays[0], base.min(max));
        }
    }
}
