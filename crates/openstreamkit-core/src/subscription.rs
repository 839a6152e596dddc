//! # Event Subscriptions
//!
//! Asks the platform to deliver event topics to this engine's webhook. Every
//! call goes through [`CredentialManager`] for its bearer token, so an expiring
//! credential is refreshed (once) before the request is made.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, instrument};

use crate::auth::{CredentialError, CredentialManager};
use crate::KICK_API_BASE_URL;

/// Topics subscribed to when none are configured.
pub const DEFAULT_TOPICS: [&str; 4] = [
    "chat.message.sent",
    "channel.followed",
    "channel.subscription.created",
    "channel.subscription.gifted",
];

/// A platform event topic at a specific schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTopic {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl EventTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
        }
    }

    pub fn defaults() -> Vec<EventTopic> {
        DEFAULT_TOPICS.iter().map(|name| EventTopic::new(*name)).collect()
    }
}

#[derive(Serialize)]
struct SubscribeRequest<'a> {
    events: &'a [EventTopic],
    method: &'static str,
}

/// Platform reply, passed through to the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionResponse {
    pub status_code: u16,
    /// JSON body when the platform sent JSON, otherwise the text as a string
    pub response: Value,
}

impl SubscriptionResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("subscription request failed: {message}")]
    Transport { message: String },
}

impl SubscriptionError {
    /// Whether a human has to log in before this can succeed.
    pub fn requires_authorization(&self) -> bool {
        match self {
            SubscriptionError::Credential(error) => error.requires_authorization(),
            SubscriptionError::Transport { .. } => false,
        }
    }
}

pub struct EventSubscriptionClient {
    http: reqwest::Client,
    credentials: CredentialManager,
    api_base_url: String,
    request_timeout: Duration,
}

impl EventSubscriptionClient {
    pub fn new(credentials: CredentialManager) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            api_base_url: KICK_API_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/public/v1/events/subscriptions", self.api_base_url)
    }

    /// Subscribe this app's webhook to `topics`.
    #[instrument(skip(self), fields(topics = topics.len()))]
    pub async fn subscribe(
        &self,
        topics: &[EventTopic],
    ) -> Result<SubscriptionResponse, SubscriptionError> {
        let token = self.credentials.bearer_token().await?;
        let request = self.http.post(self.endpoint()).json(&SubscribeRequest {
            events: topics,
            method: "webhook",
        });

        let response = self.send(token.apply(request)).await?;
        info!(status = response.status_code, "Subscription request answered");
        Ok(response)
    }

    /// Current subscriptions as reported by the platform.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<SubscriptionResponse, SubscriptionError> {
        let token = self.credentials.bearer_token().await?;
        self.send(token.apply(self.http.get(self.endpoint()))).await
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<SubscriptionResponse, SubscriptionError> {
        let response = request
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| SubscriptionError::Transport {
                message: e.to_string(),
            })?;

        let status_code = response.status().as_u16();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("application/json"))
            .unwrap_or(false);
        let text = response
            .text()
            .await
            .map_err(|e| SubscriptionError::Transport {
                message: e.to_string(),
            })?;

        let body = if is_json {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        Ok(SubscriptionResponse {
            status_code,
            response: body,
        })
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
