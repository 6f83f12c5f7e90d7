//! Reconciliation scheduling primitives.
//!
//! This library provides the pieces a controller needs to decide *when* a
//! resource is reconciled again. Key concepts:
//!
//! - **Work queue**: a deduplicating queue of item keys. An item is never
//!   handed to two workers at once.
//! - **Rate limiter**: turns repeated failures of one item into growing
//!   delays, and caps the overall insertion rate.
//! - **Delayed insertion**: items can be scheduled for a future instant.
//!
//! # Invariants
//!
//! - An item appears at most once in the ready queue
//! - An item being processed is not handed out again until `done`
//! - Per-item backoff delay is non-decreasing across consecutive failures and
//!   never exceeds the configured ceiling

use std::time::Duration;

use thiserror::Error;

mod limiter;
mod queue;

pub use limiter::{ControllerRateLimiter, ItemBackoff, RateLimiter, TokenBucket};
pub use queue::WorkQueue;

/// Scheduling configuration errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueError {
    /// Base delay is larger than the ceiling.
    #[error("base backoff {base:?} exceeds max backoff {max:?}")]
    BackoffOrder { base: Duration, max: Duration },

    /// Base delay is zero.
    #[error("base backoff must be greater than zero")]
    ZeroBackoff,

    /// Token bucket rate is not a positive finite number.
    #[error("queue qps must be a positive number, got {0}")]
    InvalidQps(f64),

    /// Token bucket burst is zero.
    #[error("queue burst must be at least 1")]
    ZeroBurst,
}

/// Default per-item base backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default per-item backoff ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Default steady insertion rate (items per second).
pub const DEFAULT_QPS: f64 = 10.0;

/// Default burst size for the insertion rate.
pub const DEFAULT_BURST: u32 = 100;
