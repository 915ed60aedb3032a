// Core domain models for Agent Relay

//! # Domain Models
//!
//! Language-agnostic domain types, kept free of engine concerns:
//!
//! - [`Message`] / [`DeliveryResult`]: the unit of dispatch and the result
//!   shape returned at every boundary
//! - [`RoutingContext`]: the read-only fact routing rules are evaluated against
//! - [`Rule`] / [`RuleBuilder`]: named, prioritized predicate + actions over a
//!   fact type, including composite AND/OR/NOT combinations
//! - [`AgentDefinition`]: a destination with declared capabilities, a
//!   concurrency limit, and an async handler

pub mod agent;
pub mod message;
pub mod rule;

pub use agent::{AgentCapabilities, AgentDefinition, AgentHandler, AgentId};
pub use message::{DeliveryResult, Message, RoutingContext};
pub use rule::{Rule, RuleBuilder, RuleOutcome};
