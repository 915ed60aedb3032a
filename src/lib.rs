// Agent Relay - rule-driven message dispatch
// Routes messages to agents via a prioritized rule engine, protected by a
// composable admission-control middleware pipeline

//! # Agent Relay Library
//!
//! This is the main library crate for Agent Relay, an in-process message
//! dispatch layer. Messages are evaluated against a prioritized, concurrently
//! mutable rule set to choose a destination agent, then pushed through a
//! chain of admission-control middleware before reaching the agent's handler.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`Message`]: The unit of dispatch - sender, category, content, metadata
//! - [`DeliveryResult`]: The result shape returned at every boundary
//! - [`Rule`]: A named, prioritized predicate plus actions over a fact type
//! - [`AgentDefinition`]: A destination with capabilities and a capacity limit
//!
//! ### Rule Engine
//!
//! [`RuleEngine`] owns the rule collection for one fact type. It supports
//! safe concurrent registration, removal, and evaluation, caches the
//! sorted-by-priority view, and tracks per-rule performance metrics.
//!
//! - Matched rules execute in strictly descending priority order
//! - A rule whose predicate or action fails never aborts sibling rules
//! - `stop_on_first_match` and `max_rules_to_execute` bound execution
//! - `execute_async` supports cooperative cancellation and async rules
//!
//! ### Middleware Pipeline
//!
//! [`Pipeline`] folds an ordered stage list around a terminal handler,
//! chain-of-responsibility style. Stages may pass through, mutate the
//! message, or short-circuit with a failure result. The admission-control
//! stages carry real state:
//!
//! - [`RateLimitMiddleware`]: sliding-window request counting per key
//! - [`CacheMiddleware`]: TTL + LRU caching with request coalescing
//! - [`CircuitBreakerMiddleware`]: three-state breaker with a windowed
//!   failure count and single half-open probe
//! - [`RetryMiddleware`]: bounded retries with exponential backoff
//!
//! ### Router
//!
//! [`Router`] glues rule evaluation to pipeline dispatch: routing rules pick
//! a target agent, the composed pipeline wraps delivery, and destinations
//! perform atomic slot acquisition before accepting concurrent work.
//!
//! ## Usage Example
//!
//! ```rust
//! use agent_relay::{Router, RouterConfig, AgentDefinition, Message};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> agent_relay::Result<()> {
//! let router = Router::new(RouterConfig::default());
//!
//! router.register_agent(
//!     AgentDefinition::new("billing", "Billing Agent")
//!         .with_categories(["invoice"])
//!         .with_max_concurrent(4)
//!         .with_handler(|msg, _cancel| async move {
//!             Ok(agent_relay::DeliveryResult::ok(format!("billed: {}", msg.content)))
//!         }),
//! )?;
//!
//! router.add_routing_rule("to-billing", "Invoices go to billing", 10, "billing", |ctx| {
//!     ctx.category == "invoice"
//! })?;
//!
//! let result = router
//!     .dispatch(Message::new("customer-1", "invoice", "order #42"))
//!     .await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

// Core domain models (messages, agents, rules)
pub mod models;

// Engine implementations (rule engine, pipeline, middleware, router)
pub mod engine;

// Injectable time source used by every component that measures windows
pub mod clock;

// Re-export core domain types for easy access
// This creates a "flat" API - users can import directly from the crate root
pub use models::{
    AgentCapabilities, // Declared categories/skills of an agent
    AgentDefinition,   // A destination: identity, capacity, handler
    AgentId,           // Newtype identifier for agents
    DeliveryResult,    // The result shape returned at every boundary
    Message,           // The unit of dispatch
    RoutingContext,    // The fact type routing rules evaluate
    Rule,              // Named, prioritized predicate + actions
    RuleBuilder,       // Fluent rule construction
    RuleOutcome,       // Success / NotMatched / Error per rule
};

// Re-export engine types for convenience
pub use engine::{
    breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMiddleware},
    cache::{CacheConfig, CacheMiddleware},
    pipeline::{ConditionalMiddleware, Handler, Middleware, Pipeline},
    rate_limit::RateLimitMiddleware,
    retry::{RetryConfig, RetryMiddleware},
    router::{Router, RouterConfig},
    rules::{EngineOptions, EngineResult, RuleEngine, RuleEvaluation, RuleMatch, RuleMetrics},
    stages::{
        LoggingMiddleware, MetricsMiddleware, MetricsSnapshot, TimingMiddleware,
        ValidationMiddleware,
    },
};

pub use clock::{Clock, ManualClock, SystemClock};

// Core error types
use thiserror::Error;

/// Custom error types for Agent Relay operations
///
/// Admission-control rejections (rate limit exceeded, circuit open,
/// destination at capacity) are *not* errors: they are expected, frequent
/// outcomes on a hot path and surface as failure [`DeliveryResult`]s.
/// This enum covers the remaining taxonomy: malformed registrations,
/// missing targets, cooperative cancellation, and genuine internal faults.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed rule or agent registration, or a malformed inbound message
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A referenced agent or rule does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Cooperative cancellation was observed
    ///
    /// Distinct from a fault: never counted toward circuit-breaker failure
    /// accounting and never converted to a failure result by Retry.
    #[error("Operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wrapped errors from agent handlers and other collaborators
    #[error("Handler error: {0}")]
    Handler(#[from] anyhow::Error),

    /// Internal error - a modeled invariant was violated
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, RelayError>;
