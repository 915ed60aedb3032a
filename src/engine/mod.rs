// Engine implementations - rule evaluation, pipeline composition, dispatch

//! # Engine Module
//!
//! The two subsystems that carry the hard engineering, plus the router that
//! glues them together:
//!
//! - [`rules`]: the concurrent rule-evaluation engine - a mutable,
//!   priority-ordered collection with sorted-order caching, sync and async
//!   evaluation, and per-rule performance accounting
//! - [`pipeline`]: chain-of-responsibility middleware composition
//! - [`stages`], [`rate_limit`], [`cache`], [`breaker`], [`retry`]: the
//!   admission-control stages wrapped around delivery
//! - [`router`]: destination registry, routing-rule evaluation, atomic slot
//!   acquisition, and broadcast

pub mod breaker;
pub mod cache;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod rules;
pub mod stages;
