//! Response types for the HTTP API

use chrono::{DateTime, Utc};
use openstreamkit_core::pipeline::IngressStatsSnapshot;
use openstreamkit_core::AuthState;
use serde::{Deserialize, Serialize};

/// Acknowledgement for every webhook delivery, whatever its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub ok: bool,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub open_this_url_in_browser: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub ok: bool,
    pub next: String,
    pub expires_at: DateTime<Utc>,
    pub scope: Vec<String>,
}

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` while a new login is required
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub auth: AuthState,
    pub ingress: IngressStatsSnapshot,
    pub snapshots_enabled: bool,
}
