//! # Webhook Verification Module
//!
//! Turns an untrusted HTTP delivery into an [`EventEnvelope`], or explains why
//! it was refused. Checks run in a fixed order and stop at the first failure:
//!
//! 1. Authenticity: the signature over `"{id}.{timestamp}.{body}"`.
//! 2. Parsing: classification and typed payload.
//! 3. Replay: the signed timestamp must be recent, and the event id unseen.
//!
//! Only a delivery that passes all three mutates the dedup cache.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::EventId;

pub mod dedup;
pub mod events;
pub mod signature;

use dedup::{DedupCache, DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_WINDOW};
use events::{parse_payload, EventEnvelope};
use signature::{signed_content, SignatureValidator};

// ============================================================================
// Delivery Headers
// ============================================================================

/// Delivery id. Part of the signed content and the dedup key.
pub const HEADER_MESSAGE_ID: &str = "kick-event-message-id";

/// Subscription that produced the delivery.
pub const HEADER_SUBSCRIPTION_ID: &str = "kick-event-subscription-id";

/// Base64 RSA signature, or hex HMAC for relays.
pub const HEADER_SIGNATURE: &str = "kick-event-signature";

/// RFC 3339 send time. Part of the signed content.
pub const HEADER_TIMESTAMP: &str = "kick-event-message-timestamp";

/// Platform event name, e.g. `chat.message.sent`.
pub const HEADER_EVENT_TYPE: &str = "kick-event-type";

pub const HEADER_EVENT_VERSION: &str = "kick-event-version";

/// Default allowance for clock difference between the platform and this host.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Platform delivery headers. Every field is optional here; the verifier
/// decides which absences are fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookHeaders {
    /// `Kick-Event-Message-Id`
    pub message_id: Option<String>,

    /// `Kick-Event-Subscription-Id`
    pub subscription_id: Option<String>,

    /// `Kick-Event-Signature`
    pub signature: Option<String>,

    /// `Kick-Event-Message-Timestamp`, as sent
    pub timestamp: Option<String>,

    /// `Kick-Event-Type`
    pub event_type: Option<String>,

    /// `Kick-Event-Version`
    pub event_version: Option<String>,
}

impl WebhookHeaders {
    /// Extract delivery headers from a name/value map. Lookup ignores case.
    pub fn from_http_headers(headers: &HashMap<String, String>) -> Self {
        let normalized: HashMap<String, &str> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .collect();
        let get = |name: &str| {
            normalized
                .get(name)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Self {
            message_id: get(HEADER_MESSAGE_ID),
            subscription_id: get(HEADER_SUBSCRIPTION_ID),
            signature: get(HEADER_SIGNATURE),
            timestamp: get(HEADER_TIMESTAMP),
            event_type: get(HEADER_EVENT_TYPE),
            event_version: get(HEADER_EVENT_VERSION),
        }
    }
}

/// Raw HTTP delivery as received, before any checks.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub headers: WebhookHeaders,

    /// Body exactly as received; the signature covers these bytes.
    pub body: Bytes,

    /// Local receive time, used for the freshness check.
    pub received_at: DateTime<Utc>,
}

impl WebhookRequest {
    /// Wrap a delivery received now.
    pub fn new(headers: WebhookHeaders, body: Bytes) -> Self {
        Self {
            headers,
            body,
            received_at: Utc::now(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why a delivery was not turned into an envelope.
///
/// None of these are retried by the sender; the ingress acknowledges them all.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum VerificationError {
    /// Authenticity could not be established. Nothing was parsed or recorded.
    #[error("invalid signature: {reason}")]
    InvalidSignature { reason: String },

    /// Authentic, but not a usable event. The id is not recorded.
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },

    /// The id was already accepted inside the retention window.
    #[error("duplicate event {event_id}")]
    DuplicateEvent { event_id: EventId },

    /// The signed timestamp is outside the replay window.
    #[error("stale delivery {event_id} sent at {sent_at}")]
    StaleDelivery {
        event_id: EventId,
        sent_at: DateTime<Utc>,
    },
}

impl VerificationError {
    /// Stable label for responses, logs and metrics.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            VerificationError::InvalidSignature { .. } => "invalid_signature",
            VerificationError::MalformedPayload { .. } => "malformed",
            VerificationError::DuplicateEvent { .. } => "duplicate",
            VerificationError::StaleDelivery { .. } => "stale",
        }
    }

    /// Replays are expected traffic, not faults.
    pub fn is_replay(&self) -> bool {
        matches!(
            self,
            VerificationError::DuplicateEvent { .. } | VerificationError::StaleDelivery { .. }
        )
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Replay protection bounds.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Oldest signed timestamp accepted, before the skew allowance.
    pub dedup_window: Duration,

    /// Maximum number of ids remembered at once.
    pub dedup_capacity: usize,

    /// Tolerated difference between the sender's clock and ours, either way.
    pub clock_skew: Duration,
}

impl VerifierConfig {
    /// How long an accepted id must be remembered.
    ///
    /// A delivery is fresh for `dedup_window + clock_skew` after its signed
    /// timestamp, and that timestamp may itself run `clock_skew` ahead of the
    /// first receipt. Every replay that still passes the freshness check
    /// therefore finds its id in the cache.
    pub fn retention(&self) -> Duration {
        self.dedup_window + self.clock_skew * 2
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }
}

/// Turns deliveries into envelopes.
///
/// One verifier is shared by every request; its dedup cache is the only
/// mutable state and is safe for concurrent use.
///
/// # Examples
///
/// ```
/// use openstreamkit_core::webhook::signature::HmacSignatureValidator;
/// use openstreamkit_core::webhook::{VerifierConfig, WebhookVerifier};
/// use std::sync::Arc;
///
/// let verifier = WebhookVerifier::new(
///     Arc::new(HmacSignatureValidator::new("relay-secret")),
///     VerifierConfig::default(),
/// );
/// assert_eq!(verifier.scheme(), "hmac-sha256");
/// ```
pub struct WebhookVerifier {
    validator: Arc<dyn SignatureValidator>,
    dedup: DedupCache,
    config: VerifierConfig,
}

impl WebhookVerifier {
    /// Create a verifier with an empty dedup cache sized from `config`.
    pub fn new(validator: Arc<dyn SignatureValidator>, config: VerifierConfig) -> Self {
        Self {
            validator,
            dedup: DedupCache::new(config.retention(), config.dedup_capacity),
            config,
        }
    }

    /// Ids accepted so far.
    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    /// Name of the signature scheme in use, for logs.
    pub fn scheme(&self) -> &'static str {
        self.validator.scheme()
    }

    /// Authenticate, parse and replay-check a delivery.
    ///
    /// # Errors
    ///
    /// The first failed check, in module order. Only `Ok` records the id.
    pub fn verify(&self, request: &WebhookRequest) -> Result<EventEnvelope, VerificationError> {
        let headers = &request.headers;

        let (message_id, timestamp, signature) = match (
            headers.message_id.as_deref(),
            headers.timestamp.as_deref(),
            headers.signature.as_deref(),
        ) {
            (Some(id), Some(ts), Some(sig)) => (id, ts, sig),
            _ => {
                return Err(VerificationError::InvalidSignature {
                    reason: format!("missing {} header", missing_header_name(headers)),
                })
            }
        };

        let content = signed_content(message_id, timestamp, &request.body);
        self.validator.verify(&content, signature).map_err(|e| {
            VerificationError::InvalidSignature {
                reason: e.to_string(),
            }
        })?;

        let event_id = EventId::new(message_id).map_err(|e| VerificationError::MalformedPayload {
            reason: e.to_string(),
        })?;
        let (event_type, parsed_payload) =
            parse_payload(headers.event_type.as_deref(), &request.body)
                .map_err(|reason| VerificationError::MalformedPayload { reason })?;

        let sent_at = DateTime::parse_from_rfc3339(timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc));
        match sent_at {
            Some(sent_at) => self.check_freshness(&event_id, sent_at, request.received_at)?,
            None => debug!(
                event_id = %event_id,
                "Delivery timestamp is not RFC 3339; relying on id dedup only"
            ),
        }

        if !self.dedup.check_and_insert(&event_id) {
            return Err(VerificationError::DuplicateEvent { event_id });
        }

        Ok(EventEnvelope {
            event_id,
            event_type,
            platform_event_type: headers.event_type.clone(),
            event_version: headers.event_version.clone(),
            subscription_id: headers.subscription_id.clone(),
            sent_at,
            received_at: request.received_at,
            raw_payload: request.body.clone(),
            parsed_payload,
        })
    }

    /// A delivery older than the dedup window can no longer be recognized as
    /// a duplicate, so it is refused outright.
    fn check_freshness(
        &self,
        event_id: &EventId,
        sent_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> Result<(), VerificationError> {
        let max_age = self.config.dedup_window + self.config.clock_skew;
        let age = received_at.signed_duration_since(sent_at);

        let too_old = age.to_std().map(|age| age > max_age).unwrap_or(false);
        let too_new = (-age)
            .to_std()
            .map(|ahead| ahead > self.config.clock_skew)
            .unwrap_or(false);

        if too_old || too_new {
            warn!(
                event_id = %event_id,
                sent_at = %sent_at,
                received_at = %received_at,
                "Delivery timestamp outside the replay window"
            );
            return Err(VerificationError::StaleDelivery {
                event_id: event_id.clone(),
                sent_at,
            });
        }
        Ok(())
    }
}

fn missing_header_name(headers: &WebhookHeaders) -> &'static str {
    if headers.signature.is_none() {
        HEADER_SIGNATURE
    } else if headers.message_id.is_none() {
        HEADER_MESSAGE_ID
    } else {
        HEADER_TIMESTAMP
    }
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("scheme", &self.validator.scheme())
            .field("dedup", &self.dedup)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
