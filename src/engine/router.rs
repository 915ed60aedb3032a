// Router - routing rules pick a destination, the pipeline wraps delivery

//! # Router Module
//!
//! The router owns the destination registry and a [`RuleEngine`] over
//! [`RoutingContext`] facts. A dispatched message is pushed through the
//! configured middleware pipeline; the terminal handler evaluates routing
//! rules in priority order, resolves the first match to its target agent,
//! and delivers after **atomic slot acquisition** against the agent's
//! concurrency ceiling.
//!
//! ## Key Concepts
//!
//! - **Routing rule**: a prioritized predicate over the message snapshot
//!   plus a target agent id; the highest-priority match wins
//! - **Capability fallback**: when no rule matches, the first registered
//!   agent whose capabilities cover the message category receives it
//!   (disable via [`RouterConfig::capability_fallback`])
//! - **Slot acquisition**: a compare-and-swap loop on the agent's in-flight
//!   counter; under concurrent dispatch the count never exceeds
//!   `max_concurrent`, and a full agent yields a failure result, not an error
//! - **Broadcast**: deliver one message to every agent matching a predicate
//!   over its definition, concurrently, each with its own slot acquisition

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::pipeline::{handler_fn, Handler, Middleware, Pipeline};
use crate::engine::rules::{EngineOptions, RuleEngine, RuleMetrics};
use crate::models::agent::{AgentDefinition, AgentId};
use crate::models::message::{DeliveryResult, Message, RoutingContext};
use crate::models::rule::RuleBuilder;
use crate::{RelayError, Result};

/// Router behavior toggles
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Route by declared agent categories when no rule matches
    pub capability_fallback: bool,

    /// Record per-rule evaluation statistics in the routing engine
    pub track_rule_performance: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            capability_fallback: true,
            track_rule_performance: false,
        }
    }
}

impl RouterConfig {
    pub fn with_capability_fallback(mut self, enabled: bool) -> Self {
        self.capability_fallback = enabled;
        self
    }

    pub fn with_rule_performance_tracking(mut self, enabled: bool) -> Self {
        self.track_rule_performance = enabled;
        self
    }
}

/// An agent plus its live in-flight counter
struct RegisteredAgent {
    definition: AgentDefinition,
    in_flight: AtomicUsize,
}

impl RegisteredAgent {
    /// Claim one delivery slot; false when the agent is at capacity
    ///
    /// Compare-and-swap loop so that two concurrent claims can never both
    /// succeed for the last slot.
    fn try_acquire(&self) -> bool {
        let max = self.definition.max_concurrent;
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= max {
                return false;
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// RAII slot handle; releases on drop, panic paths included
struct SlotGuard {
    agent: Arc<RegisteredAgent>,
}

impl SlotGuard {
    fn acquire(agent: Arc<RegisteredAgent>) -> Option<Self> {
        if agent.try_acquire() {
            Some(Self { agent })
        } else {
            None
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.agent.release();
    }
}

struct RouterCore {
    agents: DashMap<AgentId, Arc<RegisteredAgent>>,

    /// Registration order; drives capability-fallback preference
    agent_order: Mutex<Vec<AgentId>>,

    engine: RuleEngine<RoutingContext>,

    /// Routing-rule id to target agent id
    targets: DashMap<String, AgentId>,

    config: RouterConfig,
}

impl RouterCore {
    /// Resolve a destination and deliver, claiming a slot first
    async fn deliver(
        &self,
        message: Message,
        cancel: CancellationToken,
    ) -> Result<DeliveryResult> {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let ctx = RoutingContext::from_message(&message);
        for matched in self.engine.matching_rules(&ctx) {
            let Some(target) = self.targets.get(&matched.rule_id).map(|t| t.clone()) else {
                continue;
            };
            let Some(agent) = self.agents.get(&target).map(|a| Arc::clone(&a)) else {
                // target agent was removed after the rule was added
                continue;
            };
            debug!(
                rule_id = %matched.rule_id,
                agent = %target,
                message_id = %message.id,
                "routing rule matched"
            );
            return self.deliver_to(agent, message, cancel).await;
        }

        if self.config.capability_fallback {
            let order = self
                .agent_order
                .lock()
                .expect("agent order lock poisoned")
                .clone();
            for id in order {
                let Some(agent) = self.agents.get(&id).map(|a| Arc::clone(&a)) else {
                    continue;
                };
                if agent
                    .definition
                    .capabilities
                    .supports_category(&message.category)
                {
                    debug!(agent = %id, message_id = %message.id, "capability fallback");
                    return self.deliver_to(agent, message, cancel).await;
                }
            }
        }

        Ok(DeliveryResult::fail(format!(
            "no matching route for category '{}'",
            message.category
        )))
    }

    async fn deliver_to(
        &self,
        agent: Arc<RegisteredAgent>,
        message: Message,
        cancel: CancellationToken,
    ) -> Result<DeliveryResult> {
        let Some(_slot) = SlotGuard::acquire(Arc::clone(&agent)) else {
            return Ok(DeliveryResult::fail(format!(
                "destination '{}' unavailable: at capacity ({} in flight)",
                agent.definition.id, agent.definition.max_concurrent
            )));
        };
        let handler = agent.definition.handler();
        handler(message, cancel).await
    }
}

/// Rule-driven message router
///
/// ## Example:
/// ```
/// use agent_relay::{Router, RouterConfig, AgentDefinition, DeliveryResult, Message};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> agent_relay::Result<()> {
/// let router = Router::new(RouterConfig::default());
/// router.register_agent(
///     AgentDefinition::new("audit", "Audit Trail")
///         .with_categories(["audit"])
///         .with_handler(|msg, _cancel| async move {
///             Ok(DeliveryResult::ok(format!("logged {}", msg.id)))
///         }),
/// )?;
///
/// let result = router.dispatch(Message::new("system", "audit", "login")).await?;
/// assert!(result.success);
/// # Ok(())
/// # }
/// ```
pub struct Router {
    core: Arc<RouterCore>,
    pipeline: Mutex<Pipeline>,

    /// Composed handler, built once on first dispatch
    composed: Mutex<Option<Handler>>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let engine = RuleEngine::new(EngineOptions {
            track_performance: config.track_rule_performance,
            ..Default::default()
        });
        Self {
            core: Arc::new(RouterCore {
                agents: DashMap::new(),
                agent_order: Mutex::new(Vec::new()),
                engine,
                targets: DashMap::new(),
                config,
            }),
            pipeline: Mutex::new(Pipeline::new()),
            composed: Mutex::new(None),
        }
    }

    /// Register a destination agent
    ///
    /// Fails with [`RelayError::Validation`] on an empty id, a zero
    /// concurrency ceiling, or a duplicate id.
    pub fn register_agent(&self, definition: AgentDefinition) -> Result<()> {
        if definition.id.as_str().trim().is_empty() {
            return Err(RelayError::Validation("agent id must not be empty".into()));
        }
        if definition.max_concurrent == 0 {
            return Err(RelayError::Validation(format!(
                "agent '{}' must allow at least one concurrent delivery",
                definition.id
            )));
        }

        let id = definition.id.clone();
        match self.core.agents.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RelayError::Validation(format!(
                "agent '{id}' is already registered"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(agent = %id, max_concurrent = definition.max_concurrent, "agent registered");
                slot.insert(Arc::new(RegisteredAgent {
                    definition,
                    in_flight: AtomicUsize::new(0),
                }));
                self.core
                    .agent_order
                    .lock()
                    .expect("agent order lock poisoned")
                    .push(id);
                Ok(())
            }
        }
    }

    /// Remove an agent; in-flight deliveries complete, new routes skip it
    pub fn remove_agent(&self, id: impl Into<AgentId>) -> bool {
        let id = id.into();
        let removed = self.core.agents.remove(&id).is_some();
        if removed {
            self.core
                .agent_order
                .lock()
                .expect("agent order lock poisoned")
                .retain(|a| a != &id);
        }
        removed
    }

    /// Add a routing rule targeting a registered agent
    ///
    /// Higher priority wins; among equal priorities, the earlier-added rule
    /// wins. The target must already be registered.
    pub fn add_routing_rule<P>(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        target: impl Into<AgentId>,
        predicate: P,
    ) -> Result<()>
    where
        P: Fn(&RoutingContext) -> bool + Send + Sync + 'static,
    {
        let id = id.into();
        let target = target.into();
        if !self.core.agents.contains_key(&target) {
            return Err(RelayError::NotFound(format!(
                "routing rule '{id}' targets unregistered agent '{target}'"
            )));
        }

        self.core.engine.register(
            RuleBuilder::new(&id)
                .name(name)
                .priority(priority)
                .when(predicate)
                .build(),
        )?;
        self.core.targets.insert(id, target);
        Ok(())
    }

    /// Remove a routing rule by id
    pub fn remove_routing_rule(&self, id: &str) -> bool {
        let removed = self.core.engine.remove(id);
        self.core.targets.remove(id);
        removed
    }

    /// Append a middleware stage
    ///
    /// Stages must be configured before the first dispatch; the composed
    /// handler is built once and never rebuilt.
    pub fn use_stage(&self, stage: Arc<dyn Middleware>) -> Result<()> {
        if self
            .composed
            .lock()
            .expect("composed handler lock poisoned")
            .is_some()
        {
            return Err(RelayError::Validation(
                "pipeline is already composed; add stages before dispatching".into(),
            ));
        }
        let mut pipeline = self.pipeline.lock().expect("pipeline lock poisoned");
        let staged = std::mem::take(&mut *pipeline).use_stage(stage);
        *pipeline = staged;
        Ok(())
    }

    /// The composed pipeline handler, built on first use
    fn handler(&self) -> Handler {
        let mut composed = self
            .composed
            .lock()
            .expect("composed handler lock poisoned");
        if let Some(handler) = composed.as_ref() {
            return Arc::clone(handler);
        }

        let core = Arc::clone(&self.core);
        let terminal = handler_fn(move |message, cancel| {
            let core = Arc::clone(&core);
            async move { core.deliver(message, cancel).await }
        });
        let handler = self
            .pipeline
            .lock()
            .expect("pipeline lock poisoned")
            .build(terminal);
        *composed = Some(Arc::clone(&handler));
        handler
    }

    /// Dispatch one message through the pipeline to its routed destination
    pub async fn dispatch(&self, message: Message) -> Result<DeliveryResult> {
        self.dispatch_with_cancel(message, CancellationToken::new())
            .await
    }

    /// Dispatch with a caller-controlled cancellation token
    pub async fn dispatch_with_cancel(
        &self,
        message: Message,
        cancel: CancellationToken,
    ) -> Result<DeliveryResult> {
        let handler = self.handler();
        handler(message, cancel).await
    }

    /// Deliver a copy of the message to every agent matching the predicate
    ///
    /// Bypasses the routing rules and the middleware pipeline, but not slot
    /// acquisition; deliveries run concurrently and one agent's outcome
    /// never affects another's.
    pub async fn broadcast<P>(
        &self,
        message: Message,
        predicate: P,
    ) -> Vec<(AgentId, Result<DeliveryResult>)>
    where
        P: Fn(&AgentDefinition) -> bool,
    {
        let order = self
            .core
            .agent_order
            .lock()
            .expect("agent order lock poisoned")
            .clone();
        let recipients: Vec<(AgentId, Arc<RegisteredAgent>)> = order
            .into_iter()
            .filter_map(|id| {
                let agent = self.core.agents.get(&id).map(|a| Arc::clone(&a))?;
                predicate(&agent.definition).then_some((id, agent))
            })
            .collect();

        let deliveries = recipients.into_iter().map(|(id, agent)| {
            let core = Arc::clone(&self.core);
            let message = message.clone();
            async move {
                let result = core
                    .deliver_to(agent, message, CancellationToken::new())
                    .await;
                (id, result)
            }
        });
        join_all(deliveries).await
    }

    /// Registered agent ids in registration order
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.core
            .agent_order
            .lock()
            .expect("agent order lock poisoned")
            .clone()
    }

    pub fn agent_count(&self) -> usize {
        self.core.agents.len()
    }

    /// Live in-flight delivery count for an agent
    pub fn in_flight(&self, id: impl Into<AgentId>) -> Option<usize> {
        self.core
            .agents
            .get(&id.into())
            .map(|a| a.in_flight.load(Ordering::Acquire))
    }

    pub fn routing_rule_count(&self) -> usize {
        self.core.engine.rule_count()
    }

    /// Performance counters for one routing rule, when tracking is enabled
    pub fn rule_metrics(&self, rule_id: &str) -> Option<RuleMetrics> {
        self.core.engine.rule_metrics(rule_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stages::ValidationMiddleware;
    use std::time::Duration;

    fn echo_agent(id: &str, categories: &[&str]) -> AgentDefinition {
        let label = id.to_string();
        AgentDefinition::new(id, format!("{id} agent"))
            .with_categories(categories.iter().map(|c| c.to_string()))
            .with_handler(move |msg, _cancel| {
                let label = label.clone();
                async move { Ok(DeliveryResult::ok(format!("{label}: {}", msg.content))) }
            })
    }

    #[test]
    fn registration_is_validated() {
        let router = Router::new(RouterConfig::default());
        assert!(matches!(
            router.register_agent(AgentDefinition::new("", "Nameless")),
            Err(RelayError::Validation(_))
        ));
        assert!(matches!(
            router.register_agent(AgentDefinition::new("a", "A").with_max_concurrent(0)),
            Err(RelayError::Validation(_))
        ));

        router.register_agent(echo_agent("a", &[])).unwrap();
        assert!(matches!(
            router.register_agent(echo_agent("a", &[])),
            Err(RelayError::Validation(_))
        ));
        assert_eq!(router.agent_count(), 1);
    }

    #[test]
    fn routing_rules_require_a_registered_target() {
        let router = Router::new(RouterConfig::default());
        let err = router
            .add_routing_rule("r", "R", 1, "ghost", |_ctx| true)
            .unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn highest_priority_matching_rule_picks_the_target() {
        let router = Router::new(RouterConfig::default());
        router.register_agent(echo_agent("first", &[])).unwrap();
        router.register_agent(echo_agent("second", &[])).unwrap();

        router
            .add_routing_rule("low", "Low", 1, "first", |ctx| ctx.category == "work")
            .unwrap();
        router
            .add_routing_rule("high", "High", 100, "second", |ctx| ctx.category == "work")
            .unwrap();

        let result = router
            .dispatch(Message::new("s", "work", "job"))
            .await
            .unwrap();
        assert_eq!(result.response.as_deref(), Some("second: job"));
    }

    #[tokio::test]
    async fn falls_back_to_capabilities_in_registration_order() {
        let router = Router::new(RouterConfig::default());
        router.register_agent(echo_agent("a", &["billing"])).unwrap();
        router.register_agent(echo_agent("b", &["billing"])).unwrap();

        let result = router
            .dispatch(Message::new("s", "billing", "inv"))
            .await
            .unwrap();
        assert_eq!(result.response.as_deref(), Some("a: inv"));
    }

    #[tokio::test]
    async fn unroutable_messages_fail_cleanly() {
        let router = Router::new(RouterConfig::default());
        router.register_agent(echo_agent("a", &["billing"])).unwrap();

        let result = router
            .dispatch(Message::new("s", "unknown", "x"))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no matching route"));
    }

    #[tokio::test]
    async fn fallback_can_be_disabled() {
        let router = Router::new(RouterConfig::default().with_capability_fallback(false));
        router.register_agent(echo_agent("a", &["billing"])).unwrap();

        let result = router
            .dispatch(Message::new("s", "billing", "x"))
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn rules_beat_capability_fallback() {
        let router = Router::new(RouterConfig::default());
        router.register_agent(echo_agent("capable", &["work"])).unwrap();
        router.register_agent(echo_agent("ruled", &[])).unwrap();
        router
            .add_routing_rule("explicit", "Explicit", 5, "ruled", |ctx| {
                ctx.category == "work"
            })
            .unwrap();

        let result = router
            .dispatch(Message::new("s", "work", "x"))
            .await
            .unwrap();
        assert_eq!(result.response.as_deref(), Some("ruled: x"));
    }

    #[tokio::test]
    async fn removed_rule_and_agent_stop_receiving() {
        let router = Router::new(RouterConfig::default().with_capability_fallback(false));
        router.register_agent(echo_agent("a", &[])).unwrap();
        router
            .add_routing_rule("r", "R", 1, "a", |_ctx| true)
            .unwrap();

        assert!(router.dispatch(Message::new("s", "c", "x")).await.unwrap().success);

        assert!(router.remove_routing_rule("r"));
        assert!(!router.remove_routing_rule("r"));
        let result = router.dispatch(Message::new("s", "c", "x")).await.unwrap();
        assert!(!result.success);

        assert!(router.remove_agent("a"));
        assert_eq!(router.agent_count(), 0);
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded_under_concurrent_dispatch() {
        let router = Router::new(RouterConfig::default());
        let peak = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let agent = AgentDefinition::new("slow", "Slow")
            .with_categories(["work"])
            .with_max_concurrent(2)
            .with_handler({
                let peak = Arc::clone(&peak);
                let live = Arc::clone(&live);
                move |_msg, _cancel| {
                    let peak = Arc::clone(&peak);
                    let live = Arc::clone(&live);
                    async move {
                        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        live.fetch_sub(1, Ordering::SeqCst);
                        Ok(DeliveryResult::ok("done"))
                    }
                }
            });
        router.register_agent(agent).unwrap();

        let dispatches: Vec<_> = (0..5)
            .map(|i| router.dispatch(Message::new("s", "work", format!("job {i}"))))
            .collect();
        let results = join_all(dispatches).await;

        let successes = results
            .iter()
            .filter(|r| r.as_ref().unwrap().success)
            .count();
        let at_capacity = results
            .iter()
            .filter(|r| {
                r.as_ref()
                    .unwrap()
                    .error
                    .as_deref()
                    .is_some_and(|e| e.contains("at capacity"))
            })
            .count();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(successes, 2);
        assert_eq!(at_capacity, 3);
        // all slots released
        assert_eq!(router.in_flight("slow"), Some(0));
    }

    #[tokio::test]
    async fn stages_wrap_the_terminal_delivery() {
        let router = Router::new(RouterConfig::default());
        router.register_agent(echo_agent("a", &["c"])).unwrap();
        router.use_stage(Arc::new(ValidationMiddleware::new())).unwrap();

        let result = router.dispatch(Message::new("", "c", "x")).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("sender"));

        // composed now; further stages are refused
        let err = router
            .use_stage(Arc::new(ValidationMiddleware::new()))
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn broadcast_reaches_matching_agents_only() {
        let router = Router::new(RouterConfig::default());
        router
            .register_agent(echo_agent("alpha", &[]).with_skills(["audit"]))
            .unwrap();
        router
            .register_agent(echo_agent("beta", &[]).with_skills(["audit"]))
            .unwrap();
        router.register_agent(echo_agent("gamma", &[])).unwrap();

        let results = router
            .broadcast(Message::new("s", "notice", "heads up"), |def| {
                def.capabilities.has_skill("audit")
            })
            .await;

        assert_eq!(results.len(), 2);
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
        for (_, result) in &results {
            assert!(result.as_ref().unwrap().success);
        }
    }

    #[tokio::test]
    async fn cancelled_dispatch_errors_before_routing() {
        let router = Router::new(RouterConfig::default());
        router.register_agent(echo_agent("a", &["c"])).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = router
            .dispatch_with_cancel(Message::new("s", "c", "x"), cancel)
            .await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }

    #[tokio::test]
    async fn rule_performance_tracking_is_opt_in() {
        let router =
            Router::new(RouterConfig::default().with_rule_performance_tracking(true));
        router.register_agent(echo_agent("a", &[])).unwrap();
        router
            .add_routing_rule("r", "R", 1, "a", |_ctx| true)
            .unwrap();

        router.dispatch(Message::new("s", "c", "x")).await.unwrap();
        assert!(router.rule_metrics("r").is_some());
    }
}
