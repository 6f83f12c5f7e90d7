//! Client-side rate limit for API server requests.
//!
//! Every request the store, backend and event recorder make takes a token
//! first. Long-lived watches are not throttled.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use cachepilot_reconcile::{QueueError, TokenBucket};
use tracing::trace;

/// Default sustained API request rate.
pub const DEFAULT_KUBE_API_QPS: f64 = 20.0;

/// Default API request burst.
pub const DEFAULT_KUBE_API_BURST: u32 = 30;

/// Shared token bucket in front of the API server.
#[derive(Debug)]
pub struct ApiThrottle {
    bucket: Mutex<TokenBucket>,
}

impl ApiThrottle {
    pub fn new(qps: f64, burst: u32) -> Result<Self, QueueError> {
        Ok(Self {
            bucket: Mutex::new(TokenBucket::new(qps, burst)?),
        })
    }

    /// Wait until one request may be sent.
    pub async fn acquire(&self) {
        let wait = self
            .bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reserve();
        if wait > Duration::ZERO {
            trace!(wait_ms = wait.as_millis() as u64, "Throttling API request");
            tokio::time::sleep(wait).await;
        }
    }
}
