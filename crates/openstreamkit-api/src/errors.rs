//! Error types for the HTTP service

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use openstreamkit_core::auth::AuthExchangeError;
use openstreamkit_core::subscription::SubscriptionError;
use openstreamkit_core::CredentialError;
use tracing::{error, warn};

/// Operator endpoint errors with HTTP status code mapping
///
/// - `400 Bad Request`: the callback carried an unknown, expired or reused state,
///   or the platform reported an authorization error
/// - `401 Unauthorized`: no usable credential; a human has to visit `/login`
/// - `502 Bad Gateway`: the platform rejected or failed a request we made
/// - `503 Service Unavailable`: a credential refresh failed transiently; retry later
/// - `500 Internal Server Error`: local failure (token persistence, metrics encoding)
///
/// The webhook endpoint never produces these. Deliveries are always acknowledged.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    NotAuthorized { message: String },

    #[error("Unknown or expired login state; start again at /login")]
    InvalidLoginState,

    #[error("Authorization was not granted: {message}")]
    AuthorizationDenied { message: String },

    #[error("Code exchange failed: {0}")]
    ExchangeFailed(#[from] AuthExchangeError),

    #[error("Platform request failed: {message}")]
    Upstream { message: String },

    #[error("Temporarily unavailable: {message}")]
    Unavailable { message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotAuthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::InvalidLoginState | ApiError::AuthorizationDenied { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::ExchangeFailed(_) | ApiError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(error: CredentialError) -> Self {
        match error {
            e if e.requires_authorization() => ApiError::NotAuthorized {
                message: e.to_string(),
            },
            e if e.is_transient() => ApiError::Unavailable {
                message: e.to_string(),
            },
            e => ApiError::Internal {
                message: e.to_string(),
            },
        }
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(error: SubscriptionError) -> Self {
        match error {
            SubscriptionError::Credential(e) => e.into(),
            SubscriptionError::Transport { message } => ApiError::Upstream { message },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            warn!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("30"));
        }
        response
    }
}

/// Configuration loading and validation failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Service startup and runtime errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("Startup failed: {message}")]
    Startup { message: String },
}

impl ServiceError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceError::BindFailed { .. } => 1,
            ServiceError::ServerFailed { .. } => 2,
            ServiceError::Configuration(_) => 3,
            ServiceError::Startup { .. } => 4,
        }
    }
}
