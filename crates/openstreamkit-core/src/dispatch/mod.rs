//! # Event Dispatch Module
//!
//! Routes verified envelopes to the handlers registered for their type.
//!
//! The registry is assembled once with [`HandlerRegistryBuilder`] and frozen;
//! dispatch never mutates it. For each event, matching handlers run one after
//! another in ascending priority, ties broken by registration order. A handler
//! that returns an error or panics is recorded in the [`DispatchReport`] and
//! logged, and the remaining handlers still run.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::error::Error;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

use crate::webhook::events::{EventEnvelope, EventType};
use crate::EventId;

pub mod handlers;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Reaction logic for stream events.
///
/// Handlers receive the envelope by shared reference and must not assume
/// they are the only handler for the event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Identity used in failure reports and logs.
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Which events a registration receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Only(EventType),
    /// Every event, including unknown kinds
    Any,
}

impl EventFilter {
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            EventFilter::Only(expected) => *expected == event_type,
            EventFilter::Any => true,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone)]
struct Registration {
    filter: EventFilter,
    priority: i32,
    sequence: usize,
    handler: Arc<dyn EventHandler>,
}

/// Collects handler registrations at startup.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    registrations: Vec<Registration>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for one event type. Lower priority runs first.
    pub fn on(self, event_type: EventType, priority: i32, handler: Arc<dyn EventHandler>) -> Self {
        self.register(EventFilter::Only(event_type), priority, handler)
    }

    /// Register `handler` for every event.
    pub fn on_any(self, priority: i32, handler: Arc<dyn EventHandler>) -> Self {
        self.register(EventFilter::Any, priority, handler)
    }

    pub fn register(
        mut self,
        filter: EventFilter,
        priority: i32,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let sequence = self.registrations.len();
        self.registrations.push(Registration {
            filter,
            priority,
            sequence,
            handler,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Freeze the registrations into per-type ordered lists.
    pub fn build(mut self) -> HandlerRegistry {
        self.registrations
            .sort_by_key(|registration| (registration.priority, registration.sequence));

        let by_type = EventType::ALL
            .iter()
            .map(|event_type| {
                let matching: Vec<Registration> = self
                    .registrations
                    .iter()
                    .filter(|registration| registration.filter.matches(*event_type))
                    .cloned()
                    .collect();
                (*event_type, matching)
            })
            .collect();

        HandlerRegistry {
            by_type,
            total: self.registrations.len(),
        }
    }
}

/// Immutable mapping from event type to its ordered handlers.
pub struct HandlerRegistry {
    by_type: HashMap<EventType, Vec<Registration>>,
    total: usize,
}

impl HandlerRegistry {
    /// Handler names for `event_type`, in invocation order.
    pub fn handler_names(&self, event_type: EventType) -> Vec<&str> {
        self.registrations_for(event_type)
            .iter()
            .map(|registration| registration.handler.name())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn registrations_for(&self, event_type: EventType) -> &[Registration] {
        self.by_type
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// ============================================================================
// Dispatch Results
// ============================================================================

/// One handler's failure for one event.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: String,
    pub event_id: EventId,
    pub event_type: EventType,
    pub error: String,
    pub panicked: bool,
}

/// What happened when an envelope was dispatched.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event_id: EventId,
    pub event_type: EventType,
    pub invoked: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct EventDispatcher {
    registry: HandlerRegistry,
}

impl EventDispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run every matching handler in order, isolating failures.
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> DispatchReport {
        let registrations = self.registry.registrations_for(envelope.event_type);
        let mut failures = Vec::new();

        for registration in registrations {
            let handler = registration.handler.as_ref();
            let outcome = AssertUnwindSafe(handler.handle(envelope))
                .catch_unwind()
                .await;

            let (message, panicked) = match outcome {
                Ok(Ok(())) => {
                    debug!(
                        event_id = %envelope.event_id,
                        handler = handler.name(),
                        "Handler completed"
                    );
                    continue;
                }
                Ok(Err(error)) => (error.to_string(), false),
                Err(panic) => (panic_message(panic.as_ref()), true),
            };

            error!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                handler = handler.name(),
                panicked,
                error = %message,
                "Handler failed"
            );
            failures.push(HandlerFailure {
                handler: handler.name().to_string(),
                event_id: envelope.event_id.clone(),
                event_type: envelope.event_type,
                error: message,
                panicked,
            });
        }

        DispatchReport {
            event_id: envelope.event_id.clone(),
            event_type: envelope.event_type,
            invoked: registrations.len(),
            failures,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
