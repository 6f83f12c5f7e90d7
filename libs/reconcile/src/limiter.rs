//! Retry rate limiters.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

use crate::{QueueError, DEFAULT_BASE_DELAY, DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS};

/// Decides how long an item waits before it is retried.
pub trait RateLimiter<K>: Send {
    /// Delay before the next retry of `key`. Counts as one failure.
    fn when(&mut self, key: &K) -> Duration;

    /// Stop tracking `key` (called after a successful pass).
    fn forget(&mut self, key: &K);

    /// Number of failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

// ============================================================================
// Per-item exponential backoff
// ============================================================================

/// Exponential per-item backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ItemBackoff<K> {
    base: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ItemBackoff<K> {
    /// Create a backoff with the given floor and ceiling.
    pub fn new(base: Duration, max: Duration) -> Result<Self, QueueError> {
        if base.is_zero() {
            return Err(QueueError::ZeroBackoff);
        }
        if base > max {
            return Err(QueueError::BackoffOrder { base, max });
        }
        Ok(Self {
            base,
            max,
            failures: HashMap::new(),
        })
    }

    /// The backoff floor.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// The backoff ceiling.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay for a given failure count without recording anything.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = match 1u32.checked_shl(failures) {
            Some(factor) => factor,
            None => return self.max,
        };
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemBackoff<K> {
    fn when(&mut self, key: &K) -> Duration {
        let failures = self.failures.get(key).copied().unwrap_or(0);
        self.failures.insert(key.clone(), failures.saturating_add(1));
        self.delay_for(failures)
    }

    fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

// ============================================================================
// Token bucket
// ============================================================================

/// Overall insertion rate limit shared by every item.
///
/// Tokens refill at `qps` per second up to `burst`. Taking a token from an
/// empty bucket is allowed and returns how long the caller must wait for it.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    qps: f64,
    burst: u32,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(qps: f64, burst: u32) -> Result<Self, QueueError> {
        if !qps.is_finite() || qps <= 0.0 {
            return Err(QueueError::InvalidQps(qps));
        }
        if burst == 0 {
            return Err(QueueError::ZeroBurst);
        }
        Ok(Self {
            qps,
            burst,
            tokens: f64::from(burst),
            last: Instant::now(),
        })
    }

    /// Take one token, returning the wait until it is available.
    pub fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(f64::from(self.burst));
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

// ============================================================================
// Combined limiter
// ============================================================================

/// The controller's limiter: the larger of per-item backoff and the shared
/// token bucket, never more than the backoff ceiling.
#[derive(Debug, Clone)]
pub struct ControllerRateLimiter<K> {
    backoff: ItemBackoff<K>,
    bucket: TokenBucket,
}

impl<K: Eq + Hash + Clone> ControllerRateLimiter<K> {
    /// Build from explicit settings.
    pub fn new(base: Duration, max: Duration, qps: f64, burst: u32) -> Result<Self, QueueError> {
        Ok(Self {
            backoff: ItemBackoff::new(base, max)?,
            bucket: TokenBucket::new(qps, burst)?,
        })
    }

    /// Backoff ceiling.
    pub fn max_delay(&self) -> Duration {
        self.backoff.max()
    }
}

impl<K: Eq + Hash + Clone> Default for ControllerRateLimiter<K> {
    fn default() -> Self {
        Self {
            backoff: ItemBackoff {
                base: DEFAULT_BASE_DELAY,
                max: DEFAULT_MAX_DELAY,
                failures: HashMap::new(),
            },
            bucket: TokenBucket {
                qps: DEFAULT_QPS,
                burst: DEFAULT_BURST,
                tokens: f64::from(DEFAULT_BURST),
                last: Instant::now(),
            },
        }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ControllerRateLimiter<K> {
    fn when(&mut self, key: &K) -> Duration {
        let item = self.backoff.when(key);
        let shared = self.bucket.reserve();
        item.max(shared).min(self.backoff.max())
    }

    fn forget(&mut self, key: &K) {
        self.backoff.forget(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.backoff.num_requeues(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_millis(40)).unwrap();
        let key = "default/a";

        let delays: Vec<_> = (0..6).map(|_| backoff.when(&key)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(40),
                Duration::from_millis(40),
            ]
        );
        assert_eq!(backoff.num_requeues(&key), 6);
    }

    #[test]
    fn test_forget_resets_to_floor() {
        let mut backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1)).unwrap();
        backoff.when(&"a");
        backoff.when(&"a");
        backoff.forget(&"a");

        assert_eq!(backoff.num_requeues(&"a"), 0);
        assert_eq!(backoff.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_keys_are_independent() {
        let mut backoff = ItemBackoff::new(Duration::from_millis(1), Duration::from_secs(1)).unwrap();
        backoff.when(&"a");
        backoff.when(&"a");
        assert_eq!(backoff.when(&"b"), Duration::from_millis(1));
    }

    #[test]
    fn test_backoff_rejects_bad_config() {
        assert_eq!(
            ItemBackoff::<&str>::new(Duration::ZERO, Duration::from_secs(1)).unwrap_err(),
            QueueError::ZeroBackoff
        );
        assert!(matches!(
            ItemBackoff::<&str>::new(Duration::from_secs(2), Duration::from_secs(1)),
            Err(QueueError::BackoffOrder { .. })
        ));
    }

    #[test]
    fn test_huge_failure_count_saturates() {
        let backoff = ItemBackoff::<&str>::new(Duration::from_millis(5), Duration::from_secs(1000)).unwrap();
        assert_eq!(backoff.delay_for(40), Duration::from_secs(1000));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst_then_rate() {
        let mut bucket = TokenBucket::new(10.0, 2).unwrap();

        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);

        let wait = bucket.reserve();
        assert!(wait > Duration::from_millis(90) && wait <= Duration::from_millis(100));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.reserve(), Duration::ZERO);
    }

    #[test]
    fn test_token_bucket_rejects_bad_config() {
        assert!(matches!(TokenBucket::new(0.0, 1), Err(QueueError::InvalidQps(_))));
        assert!(matches!(TokenBucket::new(f64::NAN, 1), Err(QueueError::InvalidQps(_))));
        assert_eq!(TokenBucket::new(1.0, 0).unwrap_err(), QueueError::ZeroBurst);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_limiter_takes_larger_delay() {
        let mut limiter =
            ControllerRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1), 1.0, 1).unwrap();

        // First call: bucket has a token, backoff floor wins.
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        // Bucket is empty now and refills at one token per second.
        let delay = limiter.when(&"b");
        assert!(delay > Duration::from_millis(900));
        assert!(delay <= limiter.max_delay());
    }

    proptest! {
        #[test]
        fn prop_backoff_monotonic_and_bounded(
            base_ms in 1u64..100,
            extra_ms in 0u64..100_000,
            failures in 1usize..80,
        ) {
            let base = Duration::from_millis(base_ms);
            let max = base + Duration::from_millis(extra_ms);
            let mut backoff = ItemBackoff::new(base, max).unwrap();

            let mut previous = Duration::ZERO;
            for _ in 0..failures {
                let delay = backoff.when(&"key");
                prop_assert!(delay >= previous);
                prop_assert!(delay <= max);
                previous = delay;
            }

            backoff.forget(&"key");
            prop_assert_eq!(backoff.when(&"key"), base);
        }
    }
}
