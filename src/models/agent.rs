// Agent definitions - destinations for dispatched messages

//! # Agent Module
//!
//! An agent is a destination: an identity, a set of declared capabilities
//! (categories and skills), a concurrency limit, and an async handler that
//! processes delivered messages.
//!
//! The handler is stored as a boxed-future closure so agents can be built
//! from plain async closures without implementing a trait. Slot accounting
//! (the atomic in-flight counter against `max_concurrent`) lives in the
//! router, not here - the definition itself is immutable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::models::message::{DeliveryResult, Message};
use crate::Result;

/// Newtype identifier for agents
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        AgentId(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        AgentId(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared capabilities of an agent
///
/// `categories` drive fallback routing (a message whose category appears
/// here may be routed to this agent when no routing rule matches);
/// `skills` are free-form tags for broadcast predicates and introspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub categories: Vec<String>,
    pub skills: Vec<String>,
}

impl AgentCapabilities {
    pub fn supports_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    pub fn has_skill(&self, skill: &str) -> bool {
        self.skills.iter().any(|s| s == skill)
    }
}

/// Async message handler installed on an agent
///
/// Receives the message and a cancellation token; returns a
/// [`DeliveryResult`] or an error. Errors are treated as handler faults by
/// the circuit-breaker and retry stages.
pub type AgentHandler =
    Arc<dyn Fn(Message, CancellationToken) -> BoxFuture<'static, Result<DeliveryResult>> + Send + Sync>;

/// A destination for dispatched messages
///
/// Built fluently and registered with the router exactly once:
///
/// ## Example:
/// ```
/// use agent_relay::{AgentDefinition, DeliveryResult};
///
/// let agent = AgentDefinition::new("support", "Support Desk")
///     .with_categories(["support", "complaint"])
///     .with_skills(["triage"])
///     .with_max_concurrent(4)
///     .with_handler(|msg, _cancel| async move {
///         Ok(DeliveryResult::ok(format!("handled: {}", msg.content)))
///     });
/// assert_eq!(agent.max_concurrent, 4);
/// ```
#[derive(Clone)]
pub struct AgentDefinition {
    pub id: AgentId,
    pub name: String,
    pub capabilities: AgentCapabilities,

    /// Ceiling on concurrently accepted messages; enforced atomically by
    /// the router's slot counter
    pub max_concurrent: usize,

    pub created_at: DateTime<Utc>,

    handler: AgentHandler,
}

impl AgentDefinition {
    /// Default concurrency ceiling when none is configured
    pub const DEFAULT_MAX_CONCURRENT: usize = 8;

    pub fn new(id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: AgentCapabilities::default(),
            max_concurrent: Self::DEFAULT_MAX_CONCURRENT,
            created_at: Utc::now(),
            // Placeholder until with_handler installs the real one
            handler: Arc::new(|msg, _cancel| {
                Box::pin(async move {
                    Ok(DeliveryResult::fail(format!(
                        "agent has no handler installed (message {})",
                        msg.id
                    )))
                })
            }),
        }
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Install the async handler invoked on delivery
    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Message, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<DeliveryResult>> + Send + 'static,
    {
        self.handler = Arc::new(move |msg, cancel| Box::pin(handler(msg, cancel)));
        self
    }

    /// Clone of the installed handler
    pub fn handler(&self) -> AgentHandler {
        Arc::clone(&self.handler)
    }

    /// Summary of the definition for logs and introspection
    pub fn summary(&self) -> HashMap<String, serde_json::Value> {
        let mut out = HashMap::new();
        out.insert("id".to_string(), serde_json::json!(self.id.as_str()));
        out.insert("name".to_string(), serde_json::json!(self.name));
        out.insert(
            "categories".to_string(),
            serde_json::json!(self.capabilities.categories),
        );
        out.insert(
            "max_concurrent".to_string(),
            serde_json::json!(self.max_concurrent),
        );
        out
    }
}

impl std::fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handler_is_invoked_with_the_message() {
        let agent = AgentDefinition::new("echo", "Echo").with_handler(|msg, _cancel| async move {
            Ok(DeliveryResult::ok(format!("echo: {}", msg.content)))
        });

        let handler = agent.handler();
        let result = handler(
            Message::new("s", "c", "hello"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some("echo: hello"));
    }

    #[tokio::test]
    async fn default_handler_reports_missing_installation() {
        let agent = AgentDefinition::new("bare", "Bare");
        let handler = agent.handler();
        let result = handler(Message::new("s", "c", "x"), CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no handler"));
    }

    #[test]
    fn capabilities_matching() {
        let agent = AgentDefinition::new("a", "A")
            .with_categories(["billing", "invoice"])
            .with_skills(["pdf"]);

        assert!(agent.capabilities.supports_category("billing"));
        assert!(!agent.capabilities.supports_category("support"));
        assert!(agent.capabilities.has_skill("pdf"));
        assert!(!agent.capabilities.has_skill("ocr"));
    }

    #[test]
    fn agent_id_conversions() {
        let id: AgentId = "worker-1".into();
        assert_eq!(id.as_str(), "worker-1");
        assert_eq!(id.to_string(), "worker-1");
        assert_eq!(AgentId::from("worker-1".to_string()), id);
    }
}
