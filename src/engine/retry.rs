// Retry with exponential backoff

//! # Retry Module
//!
//! Re-dispatches failed deliveries with exponentially growing delays.
//! Failure results and downstream errors are both retried; cancellation is
//! not - it propagates immediately, including mid-backoff. When all
//! attempts are exhausted the last failure is returned with the attempt
//! count attached as `retry_attempts`.
//!
//! Place this stage outside the circuit breaker so that each retry attempt
//! is admitted (and counted) individually.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::pipeline::{Handler, Middleware};
use crate::models::message::{DeliveryResult, Message};
use crate::{RelayError, Result};

/// Attempt count and backoff shape
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first (minimum 1)
    pub max_attempts: usize,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Backoff growth factor applied after each attempt
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }
}

/// Exponential-backoff retry stage
///
/// ## Example:
/// ```
/// use agent_relay::{RetryConfig, RetryMiddleware};
/// use std::time::Duration;
///
/// let retry = RetryMiddleware::new(
///     RetryConfig::default()
///         .with_max_attempts(5)
///         .with_initial_delay(Duration::from_millis(50)),
/// );
/// ```
pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn handle(
        &self,
        message: Message,
        cancel: CancellationToken,
        next: Handler,
    ) -> Result<DeliveryResult> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.initial_delay;
        let mut last_failure: Option<DeliveryResult> = None;

        for attempt in 1..=max_attempts {
            match next(message.clone(), cancel.clone()).await {
                Ok(result) if result.success => {
                    return Ok(if attempt > 1 {
                        result.with_data("retry_attempts", serde_json::json!(attempt))
                    } else {
                        result
                    });
                }
                Ok(result) => last_failure = Some(result),
                Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
                Err(e) => last_failure = Some(DeliveryResult::fail(e.to_string())),
            }

            if attempt < max_attempts {
                debug!(attempt, ?delay, message_id = %message.id, "delivery failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = delay.mul_f64(self.config.multiplier);
            }
        }

        let result = last_failure
            .unwrap_or_else(|| DeliveryResult::fail("delivery failed with no attempts recorded"));
        Ok(result.with_data("retry_attempts", serde_json::json!(max_attempts)))
    }
}
