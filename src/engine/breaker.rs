// Circuit breaker - per-key failure tracking with probe-based recovery

//! # Breaker Module
//!
//! A three-state circuit breaker guarding delivery per key (the message
//! category by default).
//!
//! ## Key Concepts
//!
//! - **Closed**: traffic flows; failures within a sliding window are
//!   counted, and reaching the threshold trips the breaker to Open
//! - **Open**: traffic is refused with a failure result until the reset
//!   timeout elapses
//! - **HalfOpen**: exactly one probe dispatch is admitted; success closes
//!   the breaker and clears the failure window, failure reopens it and
//!   restarts the timeout
//!
//! All state transitions happen under one mutex per breaker, so concurrent
//! dispatches observe a consistent state and at most one probe is ever in
//! flight. Cancelled dispatches release their probe without counting as
//! either outcome.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::engine::pipeline::{Handler, Middleware};
use crate::models::message::{DeliveryResult, Message};
use crate::{RelayError, Result};

/// Breaker thresholds and timing
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that trip the breaker
    pub failure_threshold: usize,

    /// Sliding window over which failures are counted
    pub failure_window: Duration,

    /// How long the breaker stays Open before admitting a probe
    pub reset_timeout: Duration,

    /// Name used in logs
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            name: "default".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// The three breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Admission decision for one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed; `probe` marks the single half-open trial dispatch
    Allowed { probe: bool },
    /// Refuse without invoking downstream
    Rejected,
}

struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// One breaker instance; the middleware keeps one per key
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Decide whether one dispatch may proceed
    pub fn try_acquire(&self) -> Admission {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Admission::Allowed { probe: false },
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.duration_since(t) >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.config.name, "breaker half-open, admitting probe");
                    Admission::Allowed { probe: true }
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Allowed { probe: true }
                }
            }
        }
    }

    /// Record a successful dispatch admitted by [`CircuitBreaker::try_acquire`]
    pub fn record_success(&self, probe: bool) {
        if !probe {
            // closed-state successes neither count nor clear the window
            return;
        }
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.probe_in_flight = false;
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        info!(breaker = %self.config.name, "probe succeeded, breaker closed");
    }

    /// Record a failed dispatch admitted by [`CircuitBreaker::try_acquire`]
    pub fn record_failure(&self, probe: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if probe {
            inner.probe_in_flight = false;
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            warn!(breaker = %self.config.name, "probe failed, breaker reopened");
            return;
        }
        while let Some(&front) = inner.failures.front() {
            if now.duration_since(front) >= self.config.failure_window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
        inner.failures.push_back(now);
        if inner.state == BreakerState::Closed
            && inner.failures.len() >= self.config.failure_threshold
        {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            warn!(
                breaker = %self.config.name,
                failures = inner.failures.len(),
                "failure threshold reached, breaker opened"
            );
        }
    }

    /// Release an admitted dispatch that was cancelled before completing
    ///
    /// Counts as neither success nor failure; a released probe lets the
    /// next dispatch take its place.
    pub fn record_cancelled(&self, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.probe_in_flight = false;
        debug!(breaker = %self.config.name, "probe cancelled, slot released");
    }

    /// Current state, reporting HalfOpen once the reset timeout has elapsed
    pub fn state(&self) -> BreakerState {
        let now = self.clock.now();
        let inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.duration_since(t) >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
            state => state,
        }
    }

    /// Failures currently inside the window
    pub fn failure_count(&self) -> usize {
        let now = self.clock.now();
        let inner = self.inner.lock().expect("breaker lock poisoned");
        inner
            .failures
            .iter()
            .filter(|&&t| now.duration_since(t) < self.config.failure_window)
            .count()
    }
}

type KeyFn = Arc<dyn Fn(&Message) -> String + Send + Sync>;

/// Pipeline stage keeping one breaker per key (message category by default)
///
/// A rejected dispatch returns a failure result without touching the stages
/// downstream. A downstream `Err` (other than cancellation) is absorbed
/// into a failure result after being counted, so one faulty destination
/// cannot crash the dispatch path.
pub struct CircuitBreakerMiddleware {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    key_fn: KeyFn,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerMiddleware {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
            key_fn: Arc::new(|msg: &Message| msg.category.clone()),
            breakers: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default per-category keying
    pub fn with_key_fn<K>(mut self, key_fn: K) -> Self
    where
        K: Fn(&Message) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    /// The breaker for a key, created on first use
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                let config = self.config.clone().with_name(key);
                Arc::new(CircuitBreaker::with_clock(config, Arc::clone(&self.clock)))
            })
            .clone()
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    async fn handle(
        &self,
        message: Message,
        cancel: CancellationToken,
        next: Handler,
    ) -> Result<DeliveryResult> {
        let key = (self.key_fn)(&message);
        let breaker = self.breaker(&key);

        let probe = match breaker.try_acquire() {
            Admission::Rejected => {
                return Ok(DeliveryResult::fail(format!("circuit open for '{key}'")));
            }
            Admission::Allowed { probe } => probe,
        };

        match next(message, cancel).await {
            Ok(result) => {
                if result.success {
                    breaker.record_success(probe);
                } else {
                    breaker.record_failure(probe);
                }
                Ok(result)
            }
            Err(RelayError::Cancelled) => {
                breaker.record_cancelled(probe);
                Err(RelayError::Cancelled)
            }
            Err(e) => {
                breaker.record_failure(probe);
                Ok(DeliveryResult::fail(e.to_string()))
            }
        }
    }
}
