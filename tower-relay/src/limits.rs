//! Rate limiting for tower-relay.
//!
//! Publishes are limited per connection with a keyed governor limiter. A
//! rejected publish carries how long the client should wait, which is sent
//! back as a `retry-after=<secs>` hint that well-behaved clients adopt as
//! their announcement interval.

use crate::config::LimitsConfig;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits publishes per connection id.
    publish_limiter: Arc<KeyedLimiter<u64>>,
    clock: DefaultClock,
    min_retry_after_secs: u64,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("publish_limiter", &"KeyedLimiter<u64>")
            .field("min_retry_after_secs", &self.min_retry_after_secs)
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// A zero quota is treated as one publish per minute.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_minute = NonZeroU32::new(config.publishes_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            publish_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            clock: DefaultClock::default(),
            min_retry_after_secs: config.retry_after_secs,
        }
    }

    /// Check if connection `client` may publish now.
    pub fn check_publish(&self, client: u64) -> Result<(), RateLimitError> {
        self.publish_limiter.check_key(&client).map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            RateLimitError::PublishLimitExceeded {
                retry_after_secs: secs.max(self.min_retry_after_secs).max(1),
            }
        })
    }

    /// Get the number of tracked connection keys.
    pub fn tracked_keys(&self) -> usize {
        self.publish_limiter.len()
    }

    /// Evict entries whose cells have fully recharged (idle or gone clients).
    pub fn shrink(&self) {
        self.publish_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many publishes from this connection.
    PublishLimitExceeded {
        /// Seconds until the next publish would be accepted.
        retry_after_secs: u64,
    },
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PublishLimitExceeded { retry_after_secs } => {
                write!(f, "publish rate limit exceeded, retry in {}s", retry_after_secs)
            }
        }
    }
}

impl std::error::Error for RateLimitError {}
