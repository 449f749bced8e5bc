//! File-based controller configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::ControllerOptions;
use crate::error::{Error, Result};
use crate::queue::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, QueueItem,
    RateLimitingQueue,
};
use crate::types::Request;

/// Configuration for one controller, loadable from TOML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,

    /// Pause after a reconcile error, in milliseconds.
    #[serde(with = "duration_millis", default = "default_jitter_period")]
    pub jitter_period: Duration,

    /// Extra random pause as a fraction of `jitter_period`.
    #[serde(default)]
    pub jitter_factor: f64,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: default_max_concurrent_reconciles(),
            jitter_period: default_jitter_period(),
            jitter_factor: 0.0,
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the document does not parse or
    /// fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::invalid_config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file. `.json` files are read as JSON,
    /// anything else as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the file cannot be read, does not
    /// parse or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("Failed to read {}: {e}", path.display()))
        })?;

        if path.extension().is_some_and(|e| e == "json") {
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| Error::invalid_config(format!("Failed to parse config: {e}")))?;
            config.validate()?;
            Ok(config)
        } else {
            Self::from_toml(&content)
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::invalid_config("max_concurrent_reconciles must be at least 1"));
        }
        if self.jitter_period.is_zero() {
            return Err(Error::invalid_config("jitter_period must be positive"));
        }
        if !self.jitter_factor.is_finite() || self.jitter_factor < 0.0 {
            return Err(Error::invalid_config("jitter_factor must be non-negative"));
        }
        self.rate_limiter.validate()
    }

    /// Controller options for a controller named `name`, with a queue built
    /// from the configured rate limiter.
    pub fn to_options(&self, name: &str) -> ControllerOptions {
        ControllerOptions {
            jitter_period: Some(self.jitter_period),
            jitter_factor: Some(self.jitter_factor),
            max_concurrent_reconciles: Some(self.max_concurrent_reconciles),
            queue: Some(Arc::new(RateLimitingQueue::<Request>::new(
                name,
                self.rate_limiter.build(),
            ))),
            span: None,
        }
    }
}

/// Retry delays: per-item exponential backoff combined with an overall token
/// bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterConfig {
    /// First retry delay, in milliseconds.
    #[serde(with = "duration_millis", default = "default_base_delay")]
    pub base_delay: Duration,

    /// Longest retry delay, in milliseconds.
    #[serde(with = "duration_millis", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Overall retries per second.
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Retries allowed in a burst above `qps`.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl RateLimiterConfig {
    fn validate(&self) -> Result<()> {
        if self.base_delay > self.max_delay {
            return Err(Error::invalid_config("base_delay must not exceed max_delay"));
        }
        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Err(Error::invalid_config("qps must be positive"));
        }
        if self.burst == 0 {
            return Err(Error::invalid_config("burst must be at least 1"));
        }
        Ok(())
    }

    pub fn build<T: QueueItem>(&self) -> MaxOfRateLimiter<T> {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                self.base_delay,
                self.max_delay,
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

const fn default_max_concurrent_reconciles() -> usize {
    1
}

const fn default_jitter_period() -> Duration {
    Duration::from_secs(1)
}

const fn default_base_delay() -> Duration {
    Duration::from_millis(5)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(1000)
}

const fn default_qps() -> f64 {
    10.0
}

const fn default_burst() -> u32 {
    100
}

/// Serialization helper for Duration as milliseconds.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
