//! Common fixtures for OpenStreamKit integration tests
//!
//! This module provides:
//! - A recording event handler that can be told to fail or panic
//! - Builders for signed webhook deliveries
//! - A pipeline wired with HMAC verification

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use openstreamkit_core::dispatch::HandlerError;
use openstreamkit_core::webhook::signature::{signed_content, HmacSignatureValidator};
use openstreamkit_core::webhook::{VerifierConfig, WebhookHeaders, WebhookRequest};
use openstreamkit_core::{
    Credential, EventDispatcher, EventEnvelope, EventHandler, HandlerRegistryBuilder,
    IngressPipeline, SnapshotRecorder, WebhookVerifier,
};
use std::sync::{Arc, Mutex};

pub const SECRET: &str = "integration-secret";

// ============================================================================
// Recording Handler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Succeed,
    Fail,
    Panic,
}

/// Handler that writes `"{name}:{event_id}"` into a journal shared with its siblings.
pub struct RecordingHandler {
    name: String,
    behaviour: Behaviour,
    journal: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    pub fn new(name: &str, behaviour: Behaviour, journal: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behaviour,
            journal: journal.clone(),
        })
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, envelope.event_id));

        match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Fail => Err(format!("{} refused the event", self.name).into()),
            Behaviour::Panic => panic!("{} blew up", self.name),
        }
    }
}

pub fn journal() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    journal.lock().unwrap().clone()
}

// ============================================================================
// Deliveries
// ============================================================================

pub fn chat_body(content: &str) -> Bytes {
    Bytes::from(
        serde_json::json!({
            "message_id": "msg-1",
            "broadcaster": {"username": "streamer"},
            "sender": {"username": "viewer"},
            "content": content,
        })
        .to_string(),
    )
}

pub fn follow_body() -> Bytes {
    Bytes::from(
        serde_json::json!({
            "broadcaster": {"username": "streamer"},
            "follower": {"username": "new_fan"},
        })
        .to_string(),
    )
}

pub fn signed_request_at(
    id: &str,
    event_type: &str,
    body: Bytes,
    secret: &str,
    sent_at: DateTime<Utc>,
) -> WebhookRequest {
    let timestamp = sent_at.to_rfc3339();
    let signature =
        HmacSignatureValidator::new(secret).sign(&signed_content(id, &timestamp, &body));

    WebhookRequest::new(
        WebhookHeaders {
            message_id: Some(id.to_string()),
            subscription_id: Some("sub-1".to_string()),
            signature: Some(signature),
            timestamp: Some(timestamp),
            event_type: Some(event_type.to_string()),
            event_version: Some("1".to_string()),
        },
        body,
    )
}

pub fn signed_request(id: &str, event_type: &str, body: Bytes) -> WebhookRequest {
    signed_request_at(id, event_type, body, SECRET, Utc::now())
}

pub fn forged_request(id: &str, event_type: &str, body: Bytes) -> WebhookRequest {
    signed_request_at(id, event_type, body, "attacker-secret", Utc::now())
}

// ============================================================================
// Components
// ============================================================================

pub fn pipeline(handlers: HandlerRegistryBuilder, snapshots: SnapshotRecorder) -> IngressPipeline {
    IngressPipeline::new(
        snapshots,
        WebhookVerifier::new(
            Arc::new(HmacSignatureValidator::new(SECRET)),
            VerifierConfig::default(),
        ),
        EventDispatcher::new(handlers.build()),
    )
}

pub fn credential(access: &str, lifetime: ChronoDuration) -> Credential {
    let issued = Utc::now();
    Credential::new(
        access,
        format!("{}-refresh", access),
        ["events:subscribe".to_string()].into_iter().collect(),
        issued,
        issued + lifetime,
    )
    .unwrap()
}
