//! # OpenStreamKit Core
//!
//! Event ingestion and dispatch for a local-first stream automation engine.
//!
//! This crate holds the parts of the system that carry correctness guarantees:
//! - OAuth credential lifecycle (storage, exchange, single-flight refresh)
//! - Webhook authenticity verification, parsing and replay suppression
//! - Priority-ordered, failure-isolated event dispatch
//! - Optional raw payload snapshots for offline debugging
//!
//! ## Architecture
//!
//! Every collaborator with side effects sits behind a trait
//! ([`auth::TokenStore`], [`auth::TokenRefresher`], [`webhook::signature::SignatureValidator`],
//! [`dispatch::EventHandler`]) so the HTTP layer and tests can inject their own.
//!
//! ## Usage
//!
//! ```rust
//! use openstreamkit_core::{EventId, webhook::events::EventType};
//!
//! let event_id = EventId::new("evt-1").unwrap();
//! assert_eq!(event_id.as_str(), "evt-1");
//! assert_eq!(EventType::from_platform_type("chat.message.sent"), EventType::ChatMessage);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod auth;
pub mod dispatch;
pub mod pipeline;
pub mod retry;
pub mod snapshot;
pub mod subscription;
pub mod webhook;

pub use auth::{
    AuthState, BearerToken, Credential, CredentialError, CredentialManager, RefreshError,
    TokenStore, TokenStoreError,
};
pub use dispatch::{DispatchReport, EventDispatcher, EventHandler, HandlerRegistryBuilder};
pub use pipeline::{IngressOutcome, IngressPipeline};
pub use snapshot::SnapshotRecorder;
pub use webhook::{events::EventEnvelope, VerificationError, WebhookVerifier};

// ============================================================================
// Platform Constants
// ============================================================================

/// Base URL of the Kick OAuth service.
pub const KICK_OAUTH_BASE_URL: &str = "https://id.kick.com";

/// Base URL of the Kick public API.
pub const KICK_API_BASE_URL: &str = "https://api.kick.com";

/// Longest event identifier accepted from a delivery.
const MAX_EVENT_ID_LEN: usize = 256;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Platform-assigned identifier of a webhook delivery.
///
/// This is the deduplication key: two deliveries carrying the same id are the
/// same event, however many times the platform sends it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Create an event id, rejecting blank or oversized values.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        let trimmed = value.trim();

        if trimmed.is_empty() {
            return Err(ValidationError::Required {
                field: "event_id".to_string(),
            });
        }

        if trimmed.len() > MAX_EVENT_ID_LEN {
            return Err(ValidationError::InvalidFormat {
                field: "event_id".to_string(),
                message: format!("longer than {} characters", MAX_EVENT_ID_LEN),
            });
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EventId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Validation failures for domain values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
