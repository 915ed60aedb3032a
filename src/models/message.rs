// Message and delivery result types

//! # Message Module
//!
//! Defines the unit of dispatch ([`Message`]), the result shape returned at
//! every boundary ([`DeliveryResult`]), and the read-only routing fact
//! ([`RoutingContext`]) that routing rules evaluate.
//!
//! ## Key Concepts
//!
//! - **Message**: caller-supplied value with identity, sender, category,
//!   free-form content, and a JSON metadata map
//! - **DeliveryResult**: `{success, response, error, data}` - the `data` map
//!   is where stages attach side-channel information (timing, retry counts)
//!   without changing the primary contract
//! - **RoutingContext**: a snapshot of the message fields that routing
//!   predicates may read; rules never take ownership of the message itself

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The unit of dispatch
///
/// Messages carry a stable identity, the sender used for rate-limit keying,
/// a category used for routing and circuit-breaker keying, free-form content,
/// and arbitrary JSON metadata.
///
/// ## Example:
/// ```
/// use agent_relay::Message;
/// use serde_json::json;
///
/// let msg = Message::new("customer-7", "invoice", "order #42")
///     .with_metadata("region", json!("eu-west"));
/// assert_eq!(msg.category, "invoice");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, assigned at construction
    pub id: Uuid,

    /// Identity of the sender; the default rate-limiter key
    pub sender: String,

    /// Routing category; matched against agent capabilities
    pub category: String,

    /// Free-form payload
    pub content: String,

    /// Arbitrary key-value metadata readable by rules and stages
    pub metadata: HashMap<String, serde_json::Value>,

    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        category: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            category: category.into(),
            content: content.into(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach a metadata entry (builder style)
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Read a metadata entry as a string, if present and a string
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// The result returned at every dispatch boundary
///
/// Admission-control rejections (rate limit exceeded, circuit open,
/// destination at capacity) are failure results, never errors - they are
/// expected, frequent outcomes on a hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Whether delivery succeeded
    pub success: bool,

    /// Handler response on success
    pub response: Option<String>,

    /// Failure reason on rejection or fault
    pub error: Option<String>,

    /// Side-channel data attached by stages (e.g. `processing_time_ms`)
    pub data: HashMap<String, serde_json::Value>,
}

impl DeliveryResult {
    /// Successful delivery with a handler response
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            error: None,
            data: HashMap::new(),
        }
    }

    /// Clean failure (admission rejection or handler fault)
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error.into()),
            data: HashMap::new(),
        }
    }

    /// Attach a side-channel data entry (builder style)
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Read-only snapshot of a message, used as the fact for routing rules
///
/// Routing predicates receive `&RoutingContext`; they read fields, they do
/// not mutate the message in flight.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub message_id: Uuid,
    pub sender: String,
    pub category: String,
    pub content: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RoutingContext {
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id,
            sender: message.sender.clone(),
            category: message.category.clone(),
            content: message.content.clone(),
            metadata: message.metadata.clone(),
        }
    }

    /// Read a metadata entry as a string, if present and a string
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}
