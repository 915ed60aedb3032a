// Middleware pipeline - chain-of-responsibility composition

//! # Pipeline Module
//!
//! Builds a single composed handler from an ordered list of middleware
//! stages wrapping a terminal handler. Each stage wraps all stages added
//! after it: for stages A, B, C around handler H the execution trace is
//! `A-before, B-before, C-before, H, C-after, B-after, A-after`.
//!
//! A stage may pass the message through unchanged, mutate it before or
//! after forwarding, or **short-circuit** by returning a failure result
//! without invoking `next` - nothing downstream of it executes.
//!
//! The composed handler is built once at configuration time by folding the
//! stage list right-to-left around the terminal handler, and treated as an
//! immutable value afterwards - never rebuilt per call.
//!
//! ## Failure Semantics
//!
//! An `Err` from a stage or the terminal handler propagates to the caller
//! of the composed handler. Only the retry and circuit-breaker stages
//! convert errors into failure results; everything else passes them on.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::models::message::{DeliveryResult, Message};
use crate::Result;

/// A composed (or terminal) async handler
pub type Handler = Arc<
    dyn Fn(Message, CancellationToken) -> BoxFuture<'static, Result<DeliveryResult>>
        + Send
        + Sync,
>;

/// Wrap a plain async closure as a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Message, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<DeliveryResult>> + Send + 'static,
{
    Arc::new(move |msg, cancel| Box::pin(f(msg, cancel)))
}

/// One stage in the dispatch pipeline
///
/// Stages receive the message, the cancellation token, and the composed
/// remainder of the pipeline (`next`). Call `next` zero or one times.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stage name used in logs
    fn name(&self) -> &str {
        "middleware"
    }

    async fn handle(
        &self,
        message: Message,
        cancel: CancellationToken,
        next: Handler,
    ) -> Result<DeliveryResult>;
}

/// Ordered middleware list composed around a terminal handler
///
/// ## Example:
/// ```
/// use agent_relay::{Pipeline, DeliveryResult};
/// use agent_relay::engine::pipeline::handler_fn;
/// use agent_relay::{Message, ValidationMiddleware};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> agent_relay::Result<()> {
/// let pipeline = Pipeline::new().use_stage(Arc::new(ValidationMiddleware::new()));
/// let handler = pipeline.build(handler_fn(|_msg, _cancel| async {
///     Ok(DeliveryResult::ok("done"))
/// }));
///
/// let result = handler(Message::new("alice", "c", "payload"), Default::default()).await?;
/// assert!(result.success);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage; stages execute in the order they were added
    pub fn use_stage(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Append a stage gated by a message predicate
    ///
    /// When the predicate is false the stage is skipped entirely - neither
    /// its before nor after logic runs - and dispatch proceeds to the next
    /// stage.
    pub fn use_stage_when<P>(self, predicate: P, stage: Arc<dyn Middleware>) -> Self
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.use_stage(Arc::new(ConditionalMiddleware::new(predicate, stage)))
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Fold the stage list right-to-left around the terminal handler
    pub fn build(&self, terminal: Handler) -> Handler {
        let mut composed = terminal;
        for stage in self.stages.iter().rev() {
            let stage = Arc::clone(stage);
            let next = composed;
            composed = Arc::new(move |message, cancel| {
                let stage = Arc::clone(&stage);
                let next = Arc::clone(&next);
                Box::pin(async move { stage.handle(message, cancel, next).await })
            });
        }
        composed
    }
}

/// Predicate-gated wrapper around another stage
pub struct ConditionalMiddleware {
    predicate: Arc<dyn Fn(&Message) -> bool + Send + Sync>,
    inner: Arc<dyn Middleware>,
    name: String,
}

impl ConditionalMiddleware {
    pub fn new<P>(predicate: P, inner: Arc<dyn Middleware>) -> Self
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let name = format!("conditional({})", inner.name());
        Self {
            predicate: Arc::new(predicate),
            inner,
            name,
        }
    }
}

#[async_trait]
impl Middleware for ConditionalMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        message: Message,
        cancel: CancellationToken,
        next: Handler,
    ) -> Result<DeliveryResult> {
        if (self.predicate)(&message) {
            self.inner.handle(message, cancel, next).await
        } else {
            next(message, cancel).await
        }
    }
}
