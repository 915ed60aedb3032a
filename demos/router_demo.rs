// End-to-end demo: agents, routing rules, and the full admission stack
//
// Run with: cargo run --example router_demo
// Verbose logs: RUST_LOG=debug cargo run --example router_demo

use std::sync::Arc;
use std::time::Duration;

use agent_relay::{
    AgentDefinition, CacheConfig, CacheMiddleware, CircuitBreakerConfig, CircuitBreakerMiddleware,
    DeliveryResult, LoggingMiddleware, Message, MetricsMiddleware, RateLimitMiddleware,
    RetryConfig, RetryMiddleware, Router, RouterConfig, TimingMiddleware, ValidationMiddleware,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> agent_relay::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let router = Router::new(RouterConfig::default());

    router.register_agent(
        AgentDefinition::new("billing", "Billing Desk")
            .with_categories(["invoice", "payment"])
            .with_skills(["ledger"])
            .with_max_concurrent(4)
            .with_handler(|msg, _cancel| async move {
                Ok(DeliveryResult::ok(format!("billed: {}", msg.content)))
            }),
    )?;

    router.register_agent(
        AgentDefinition::new("support", "Support Desk")
            .with_categories(["support"])
            .with_skills(["triage"])
            .with_max_concurrent(2)
            .with_handler(|msg, _cancel| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(DeliveryResult::ok(format!("ticket opened: {}", msg.content)))
            }),
    )?;

    // VIP invoices jump the queue; everything else falls back to categories
    router.add_routing_rule("vip-invoices", "VIP invoices to billing", 100, "billing", |ctx| {
        ctx.category == "invoice" && ctx.metadata_str("tier") == Some("vip")
    })?;
    router.add_routing_rule("complaints", "Complaints go to support", 10, "support", |ctx| {
        ctx.content.contains("complaint")
    })?;

    let metrics = MetricsMiddleware::new();
    router.use_stage(Arc::new(ValidationMiddleware::new()))?;
    router.use_stage(Arc::new(LoggingMiddleware::new()))?;
    router.use_stage(Arc::clone(&metrics) as Arc<dyn agent_relay::Middleware>)?;
    router.use_stage(Arc::new(TimingMiddleware::new()))?;
    router.use_stage(Arc::new(RateLimitMiddleware::new(
        20,
        Duration::from_secs(1),
    )))?;
    router.use_stage(Arc::new(CacheMiddleware::new(
        CacheConfig::default().with_ttl(Duration::from_secs(5)),
    )))?;
    router.use_stage(Arc::new(RetryMiddleware::new(
        RetryConfig::default().with_initial_delay(Duration::from_millis(25)),
    )))?;
    router.use_stage(Arc::new(CircuitBreakerMiddleware::new(
        CircuitBreakerConfig::default().with_failure_threshold(3),
    )))?;

    let vip = Message::new("acme-corp", "invoice", "order #42")
        .with_metadata("tier", serde_json::json!("vip"));
    let result = router.dispatch(vip).await?;
    println!("vip invoice   -> {:?}", result.response);

    let result = router
        .dispatch(Message::new("customer-7", "payment", "renewal"))
        .await?;
    println!("payment       -> {:?}", result.response);

    let result = router
        .dispatch(Message::new("customer-7", "chat", "this is a complaint"))
        .await?;
    println!("complaint     -> {:?}", result.response);

    // identical content: served from cache, handler not invoked again
    let result = router
        .dispatch(Message::new("customer-7", "payment", "renewal"))
        .await?;
    println!("repeat        -> {:?} (cached: {})",
        result.response,
        result.data.contains_key("cache_hit"));

    // no rule, no capable agent
    let result = router
        .dispatch(Message::new("customer-7", "unknown", "lost"))
        .await?;
    println!("unroutable    -> {:?}", result.error);

    let heads_up = Message::new("ops", "notice", "maintenance at midnight");
    for (id, result) in router.broadcast(heads_up, |def| def.capabilities.has_skill("triage")).await {
        println!("broadcast     -> {id}: {:?}", result?.response);
    }

    let snap = metrics.snapshot();
    println!(
        "totals        -> dispatched {}, succeeded {}, failed {}",
        snap.dispatched, snap.succeeded, snap.failed
    );
    Ok(())
}
