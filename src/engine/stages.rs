// Simple observability and validation stages

//! # Stages Module
//!
//! The stateless (or nearly stateless) pipeline stages: validation,
//! logging, timing, and metrics. The admission-control stages with real
//! state live in their own modules ([`rate_limit`](super::rate_limit),
//! [`cache`](super::cache), [`breaker`](super::breaker),
//! [`retry`](super::retry)).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{system_clock, SharedClock};
use crate::engine::pipeline::{Handler, Middleware};
use crate::models::message::{DeliveryResult, Message};
use crate::Result;

/// Rejects malformed messages before any side effect
///
/// A message with an empty sender or empty content is refused with a
/// failure result; nothing downstream of this stage observes it.
#[derive(Debug, Default)]
pub struct ValidationMiddleware;

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    async fn handle(
        &self,
        message: Message,
        cancel: CancellationToken,
        next: Handler,
    ) -> Result<DeliveryResult> {
        if message.sender.trim().is_empty() {
            return Ok(DeliveryResult::fail("validation failed: sender is empty"));
        }
        if message.content.trim().is_empty() {
            return Ok(DeliveryResult::fail("validation failed: content is empty"));
        }
        next(message, cancel).await
    }
}

/// Logs each dispatch and its outcome via `tracing`
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(
        &self,
        message: Message,
        cancel: CancellationToken,
        next: Handler,
    ) -> Result<DeliveryResult> {
        let message_id = message.id;
        let category = message.category.clone();
        debug!(%message_id, %category, sender = %message.sender, "dispatching message");

        let result = next(message, cancel).await;
        match &result {
            Ok(r) if r.success => debug!(%message_id, "delivery succeeded"),
            Ok(r) => debug!(%message_id, error = ?r.error, "delivery rejected"),
            Err(e) => warn!(%message_id, error = %e, "delivery errored"),
        }
        result
    }
}

/// Measures downstream processing time and attaches it to the result
///
/// Adds `processing_time_ms` to the result's `data` map without changing
/// the primary contract.
pub struct TimingMiddleware {
    clock: SharedClock,
}

impl TimingMiddleware {
    pub fn new() -> Self {
        Self {
            clock: system_clock(),
        }
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self { clock }
    }
}

impl Default for TimingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for TimingMiddleware {
    fn name(&self) -> &str {
        "timing"
    }

    async fn handle(
        &self,
        message: Message,
        cancel: CancellationToken,
        next: Handler,
    ) -> Result<DeliveryResult> {
        let started = self.clock.now();
        let mut result = next(message, cancel).await?;
        let elapsed = self.clock.now() - started;
        result.data.insert(
            "processing_time_ms".to_string(),
            serde_json::json!(elapsed.as_millis() as u64),
        );
        Ok(result)
    }
}

/// Point-in-time view of the dispatch counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Counts dispatches and outcomes
///
/// Keep a clone of the `Arc` handed to the pipeline to read
/// [`MetricsMiddleware::snapshot`] later. Errors count as failures before
/// they propagate.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl MetricsMiddleware {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn handle(
        &self,
        message: Message,
        cancel: CancellationToken,
        next: Handler,
    ) -> Result<DeliveryResult> {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let result = next(message, cancel).await;
        match &result {
            Ok(r) if r.success => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}
