//! # Event Model
//!
//! Classification of platform event types and the typed records parsed out of
//! webhook bodies. Parsing is lenient about optional fields the platform may
//! add or omit, but strict about the fields each event kind is defined by.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::EventId;

/// Name shown for a user the payload does not identify.
pub const UNKNOWN_USER: &str = "unknown";

// ============================================================================
// Event Classification
// ============================================================================

/// Kind of stream event carried by a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ChatMessage,
    Follow,
    Subscription,
    /// Any platform type this build does not recognize
    Unknown,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::ChatMessage,
        EventType::Follow,
        EventType::Subscription,
        EventType::Unknown,
    ];

    /// Classify a platform event type string such as `chat.message.sent`.
    pub fn from_platform_type(platform_type: &str) -> Self {
        match platform_type.trim() {
            "chat.message.sent" => EventType::ChatMessage,
            "channel.followed" => EventType::Follow,
            other if other.starts_with("channel.subscription.") => EventType::Subscription,
            _ => EventType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ChatMessage => "chat_message",
            EventType::Follow => "follow",
            EventType::Subscription => "subscription",
            EventType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variant of a subscription event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    New,
    Renewal,
    Gift,
    #[default]
    Other,
}

impl SubscriptionKind {
    /// Derive the kind from the last segment of `channel.subscription.<kind>`.
    pub fn from_platform_type(platform_type: &str) -> Self {
        match platform_type.trim().rsplit('.').next() {
            Some("new") | Some("created") => SubscriptionKind::New,
            Some("renewal") => SubscriptionKind::Renewal,
            Some("gifts") | Some("gifted") => SubscriptionKind::Gift,
            _ => SubscriptionKind::Other,
        }
    }
}

// ============================================================================
// Payload Records
// ============================================================================

/// A platform user as embedded in event payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KickUser {
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub channel_slug: Option<String>,
    #[serde(default)]
    pub is_verified: Option<bool>,
    #[serde(default)]
    pub is_anonymous: Option<bool>,
}

impl KickUser {
    /// The username, or `"unknown"` when the payload leaves it out.
    pub fn display_name(&self) -> &str {
        self.username
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_USER)
    }
}

fn display_name(user: Option<&KickUser>) -> &str {
    user.map(KickUser::display_name).unwrap_or(UNKNOWN_USER)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: String,
    pub sender: KickUser,
    pub content: String,
    #[serde(default)]
    pub broadcaster: Option<KickUser>,
    #[serde(default)]
    pub emotes: Vec<Value>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl ChatMessage {
    pub fn sender_name(&self) -> &str {
        self.sender.display_name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follow {
    pub follower: KickUser,
    #[serde(default)]
    pub broadcaster: Option<KickUser>,
}

impl Follow {
    pub fn follower_name(&self) -> &str {
        self.follower.display_name()
    }
}

/// New, renewed or gifted subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(skip_deserializing)]
    pub kind: SubscriptionKind,
    #[serde(default)]
    pub broadcaster: Option<KickUser>,
    #[serde(default)]
    pub subscriber: Option<KickUser>,
    #[serde(default)]
    pub gifter: Option<KickUser>,
    #[serde(default)]
    pub giftees: Vec<KickUser>,
    /// Months subscribed
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl Subscription {
    pub fn subscriber_name(&self) -> &str {
        display_name(self.subscriber.as_ref())
    }

    pub fn gifter_name(&self) -> &str {
        display_name(self.gifter.as_ref())
    }
}

/// Typed view of a delivery body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ParsedPayload {
    ChatMessage(ChatMessage),
    Follow(Follow),
    Subscription(Subscription),
    /// Body of an unrecognized event type, kept as JSON
    Unknown(Value),
}

impl ParsedPayload {
    /// Top-level keys of the body, for logging unfamiliar shapes.
    pub fn top_level_keys(&self) -> Vec<String> {
        match self {
            ParsedPayload::Unknown(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// Event Envelope
// ============================================================================

/// A verified, parsed delivery ready for dispatch.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Platform-assigned id; the dedup key
    pub event_id: EventId,
    pub event_type: EventType,
    /// Raw type header, kept for unknown kinds
    pub platform_event_type: Option<String>,
    pub event_version: Option<String>,
    pub subscription_id: Option<String>,
    /// Signed send time from the delivery headers
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub raw_payload: Bytes,
    pub parsed_payload: ParsedPayload,
}

impl EventEnvelope {
    pub fn as_chat_message(&self) -> Option<&ChatMessage> {
        match &self.parsed_payload {
            ParsedPayload::ChatMessage(message) => Some(message),
            _ => None,
        }
    }

    pub fn as_follow(&self) -> Option<&Follow> {
        match &self.parsed_payload {
            ParsedPayload::Follow(follow) => Some(follow),
            _ => None,
        }
    }

    pub fn as_subscription(&self) -> Option<&Subscription> {
        match &self.parsed_payload {
            ParsedPayload::Subscription(subscription) => Some(subscription),
            _ => None,
        }
    }

    /// Platform type string for logs, falling back to the classified kind.
    pub fn type_label(&self) -> &str {
        self.platform_event_type
            .as_deref()
            .unwrap_or_else(|| self.event_type.as_str())
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Classify and parse a delivery body.
///
/// With a type header, the header decides the kind. Without one, the body
/// shape decides: a chat message carries `message_id`, `sender` and `content`;
/// a follow carries `follower`. Errors are human-readable reasons.
pub(crate) fn parse_payload(
    platform_type: Option<&str>,
    body: &[u8],
) -> Result<(EventType, ParsedPayload), String> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| format!("body is not valid JSON: {}", e))?;
    let object = match value {
        Value::Object(object) => object,
        other => {
            return Err(format!(
                "body must be a JSON object, got {}",
                json_kind(&other)
            ))
        }
    };

    let event_type = match platform_type {
        Some(platform_type) => EventType::from_platform_type(platform_type),
        None => classify_by_shape(&object),
    };

    let parsed = match event_type {
        EventType::ChatMessage => ParsedPayload::ChatMessage(typed(object, "chat message")?),
        EventType::Follow => ParsedPayload::Follow(typed(object, "follow")?),
        EventType::Subscription => {
            let mut subscription: Subscription = typed(object, "subscription")?;
            subscription.kind = platform_type
                .map(SubscriptionKind::from_platform_type)
                .unwrap_or_default();
            ParsedPayload::Subscription(subscription)
        }
        EventType::Unknown => ParsedPayload::Unknown(Value::Object(object)),
    };

    Ok((event_type, parsed))
}

fn classify_by_shape(object: &Map<String, Value>) -> EventType {
    if ["message_id", "sender", "content"]
        .iter()
        .all(|key| object.contains_key(*key))
    {
        EventType::ChatMessage
    } else if object.contains_key("follower") {
        EventType::Follow
    } else {
        EventType::Unknown
    }
}

fn typed<T: serde::de::DeserializeOwned>(
    object: Map<String, Value>,
    kind: &str,
) -> Result<T, String> {
    serde_json::from_value(Value::Object(object))
        .map_err(|e| format!("{} payload does not match its schema: {}", kind, e))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
