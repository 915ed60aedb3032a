// Sliding-window rate limiting keyed per sender

//! # Rate Limit Module
//!
//! Sliding-window admission control. Each key (the message sender by
//! default) gets an independent window of recent dispatch timestamps;
//! a dispatch that would exceed `max_requests` within `window` is refused
//! with a failure result and never reaches the stages downstream.
//!
//! The check-prune-record sequence runs under the per-key map entry guard,
//! so two concurrent dispatches for the same key cannot both slip under
//! the limit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::{system_clock, SharedClock};
use crate::engine::pipeline::{Handler, Middleware};
use crate::models::message::{DeliveryResult, Message};
use crate::Result;

type KeyFn = Arc<dyn Fn(&Message) -> String + Send + Sync>;

/// Per-key sliding-window rate limiter
///
/// ## Example:
/// ```
/// use agent_relay::RateLimitMiddleware;
/// use std::time::Duration;
///
/// // at most 5 dispatches per sender per second
/// let limiter = RateLimitMiddleware::new(5, Duration::from_secs(1));
/// ```
pub struct RateLimitMiddleware {
    max_requests: usize,
    window: Duration,
    key_fn: KeyFn,
    records: DashMap<String, VecDeque<Instant>>,
    clock: SharedClock,
}

impl RateLimitMiddleware {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            key_fn: Arc::new(|msg: &Message| msg.sender.clone()),
            records: DashMap::new(),
            clock: system_clock(),
        }
    }

    /// Replace the default per-sender keying
    pub fn with_key_fn<K>(mut self, key_fn: K) -> Self
    where
        K: Fn(&Message) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Timestamps still inside the window for a key
    pub fn current_count(&self, key: &str) -> usize {
        let now = self.clock.now();
        self.records
            .get(key)
            .map(|window| {
                window
                    .iter()
                    .filter(|&&t| now.duration_since(t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Check-prune-record under the entry guard; true means admitted
    fn try_admit(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut window = self.records.entry(key.to_string()).or_default();
        while let Some(&front) = window.front() {
            if now.duration_since(front) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.max_requests {
            return false;
        }
        window.push_back(now);
        true
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn handle(
        &self,
        message: Message,
        cancel: CancellationToken,
        next: Handler,
    ) -> Result<DeliveryResult> {
        let key = (self.key_fn)(&message);
        if !self.try_admit(&key) {
            debug!(%key, max = self.max_requests, "rate limit exceeded");
            return Ok(DeliveryResult::fail(format!(
                "rate limit exceeded for '{key}': {} requests per {:?}",
                self.max_requests, self.window
            )));
        }
        next(message, cancel).await
    }
}
