//! Built-in handlers that write stream activity to the log.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{EventHandler, HandlerError, HandlerRegistryBuilder};
use crate::webhook::events::{EventEnvelope, EventType, SubscriptionKind};

/// Priority of the log handlers. Custom handlers registered below this run first.
pub const LOG_HANDLER_PRIORITY: i32 = 100;

/// Logs `[CHAT] user: content`.
pub struct ChatLogHandler;

#[async_trait]
impl EventHandler for ChatLogHandler {
    fn name(&self) -> &str {
        "chat-log"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let message = envelope
            .as_chat_message()
            .ok_or("chat event without chat payload")?;
        info!(
            event_id = %envelope.event_id,
            "[CHAT] {}: {}",
            message.sender_name(),
            message.content
        );
        Ok(())
    }
}

/// Logs `[FOLLOW] user`.
pub struct FollowLogHandler;

#[async_trait]
impl EventHandler for FollowLogHandler {
    fn name(&self) -> &str {
        "follow-log"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let follow = envelope
            .as_follow()
            .ok_or("follow event without follow payload")?;
        info!(event_id = %envelope.event_id, "[FOLLOW] {}", follow.follower_name());
        Ok(())
    }
}

pub struct SubscriptionLogHandler;

#[async_trait]
impl EventHandler for SubscriptionLogHandler {
    fn name(&self) -> &str {
        "subscription-log"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let subscription = envelope
            .as_subscription()
            .ok_or("subscription event without subscription payload")?;

        match subscription.kind {
            SubscriptionKind::Gift => info!(
                event_id = %envelope.event_id,
                "[GIFT] {} gifted {} sub(s)",
                subscription.gifter_name(),
                subscription.giftees.len().max(1)
            ),
            SubscriptionKind::Renewal => info!(
                event_id = %envelope.event_id,
                "[RESUB] {} ({} months)",
                subscription.subscriber_name(),
                subscription.duration.unwrap_or(1)
            ),
            SubscriptionKind::New | SubscriptionKind::Other => info!(
                event_id = %envelope.event_id,
                "[SUB] {}",
                subscription.subscriber_name()
            ),
        }
        Ok(())
    }
}

/// Logs the type and top-level keys of events this build does not model.
pub struct UnknownEventLogHandler;

#[async_trait]
impl EventHandler for UnknownEventLogHandler {
    fn name(&self) -> &str {
        "unknown-event-log"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        warn!(
            event_id = %envelope.event_id,
            platform_event_type = envelope.type_label(),
            keys = ?envelope.parsed_payload.top_level_keys(),
            "Unrecognized event type"
        );
        Ok(())
    }
}

/// Add the log handlers to a registry under construction.
pub fn register_builtin_handlers(builder: HandlerRegistryBuilder) -> HandlerRegistryBuilder {
    builder
        .on(
            EventType::ChatMessage,
            LOG_HANDLER_PRIORITY,
            Arc::new(ChatLogHandler),
        )
        .on(EventType::Follow, LOG_HANDLER_PRIORITY, Arc::new(FollowLogHandler))
        .on(
            EventType::Subscription,
            LOG_HANDLER_PRIORITY,
            Arc::new(SubscriptionLogHandler),
        )
        .on(
            EventType::Unknown,
            LOG_HANDLER_PRIORITY,
            Arc::new(UnknownEventLogHandler),
        )
}

#[cfg(test)]
#[path = "handlers_tests.rs"]
mod tests;
