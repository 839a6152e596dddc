//! # OAuth Client
//!
//! Authorization-code exchange and refresh against the platform token endpoint.
//!
//! Refresh failures are classified so the caller can decide between backing
//! off and asking a human to log in again:
//!
//! | Response                                              | Classification |
//! |-------------------------------------------------------|----------------|
//! | transport error, timeout                              | retryable      |
//! | 429, 5xx                                              | retryable      |
//! | 2xx with an unparseable body                          | retryable      |
//! | 401                                                   | terminal       |
//! | 400/403 with `invalid_grant`-class error code         | terminal       |
//! | any other 4xx                                         | retryable      |

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{AuthExchangeError, Credential, RefreshError};
use crate::KICK_OAUTH_BASE_URL;

/// Scope needed to subscribe to platform events.
pub const DEFAULT_SCOPE: &str = "events:subscribe";

/// OAuth error codes that mean the grant itself is no longer usable.
const TERMINAL_ERROR_CODES: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "unsupported_grant_type",
];

/// Something that can turn the current credential into a fresh one.
///
/// Implemented by [`OAuthClient`]; tests substitute their own.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, current: &Credential) -> Result<Credential, RefreshError>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Client registration and endpoint settings.
#[derive(Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub oauth_base_url: String,
    pub scopes: Vec<String>,

    /// Bound on a single token endpoint round-trip
    pub request_timeout: Duration,
}

impl OAuthConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            oauth_base_url: KICK_OAUTH_BASE_URL.to_string(),
            scopes: vec![DEFAULT_SCOPE.to_string()],
            request_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.oauth_base_url = base_url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<REDACTED>")
            .field("redirect_uri", &self.redirect_uri)
            .field("oauth_base_url", &self.oauth_base_url)
            .field("scopes", &self.scopes)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Successful token endpoint response.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

/// Error body returned by the token endpoint.
#[derive(Debug, Default, Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn parse_scope(scope: Option<&str>) -> Option<BTreeSet<String>> {
    scope
        .map(|s| s.split_whitespace().map(str::to_string).collect::<BTreeSet<_>>())
        .filter(|set| !set.is_empty())
}

// ============================================================================
// Client
// ============================================================================

/// Client for the platform's OAuth endpoints.
pub struct OAuthClient {
    config: OAuthConfig,
    http: reqwest::Client,
    authorize_url: Url,
    token_url: Url,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> Result<Self, url::ParseError> {
        Self::with_http_client(config, reqwest::Client::new())
    }

    pub fn with_http_client(
        config: OAuthConfig,
        http: reqwest::Client,
    ) -> Result<Self, url::ParseError> {
        let base = config.oauth_base_url.trim_end_matches('/');
        let authorize_url = Url::parse(&format!("{}/oauth/authorize", base))?;
        let token_url = Url::parse(&format!("{}/oauth/token", base))?;

        Ok(Self {
            config,
            http,
            authorize_url,
            token_url,
        })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Browser URL that starts the authorization-code flow with a PKCE S256 challenge.
    pub fn authorization_url(&self, state: &str, code_challenge: &str) -> Url {
        let scope = self.config.scopes.join(" ");
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &scope)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state);
        url
    }

    /// Exchange an authorization code for the first credential.
    #[instrument(skip_all)]
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<Credential, AuthExchangeError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code_verifier", code_verifier),
            ("code", code),
        ];

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&form)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| AuthExchangeError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthExchangeError::Transport {
                message: format!("failed to read response body: {}", e),
            })?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "Authorization code exchange rejected");
            return Err(AuthExchangeError::Rejected {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AuthExchangeError::MalformedResponse {
                message: e.to_string(),
            })?;

        let requested: BTreeSet<String> = self.config.scopes.iter().cloned().collect();
        let refresh_token = token
            .refresh_token
            .clone()
            .ok_or_else(|| AuthExchangeError::MalformedResponse {
                message: "response has no refresh_token".to_string(),
            })?;

        let credential = build_credential(&token, refresh_token, requested).map_err(|message| {
            AuthExchangeError::MalformedResponse { message }
        })?;

        info!(
            expires_at = %credential.expires_at(),
            scope = ?credential.scope(),
            "Authorization code exchanged for credential"
        );
        Ok(credential)
    }

    async fn request_refresh(&self, current: &Credential) -> Result<Credential, RefreshError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", current.refresh_token()),
        ];

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&form)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| RefreshError::Retryable {
                message: if e.is_timeout() {
                    "token endpoint timed out".to_string()
                } else {
                    format!("token endpoint unreachable: {}", e)
                },
                status: None,
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| RefreshError::Retryable {
            message: format!("failed to read response body: {}", e),
            status: Some(status.as_u16()),
        })?;

        if !status.is_success() {
            return Err(classify_refresh_failure(status, &body));
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| RefreshError::Retryable {
                message: format!("malformed refresh response: {}", e),
                status: Some(status.as_u16()),
            })?;

        let refresh_token = token
            .refresh_token
            .clone()
            .unwrap_or_else(|| current.refresh_token().to_string());

        build_credential(&token, refresh_token, current.scope().clone()).map_err(|message| {
            RefreshError::Retryable {
                message,
                status: Some(status.as_u16()),
            }
        })
    }
}

#[async_trait]
impl TokenRefresher for OAuthClient {
    #[instrument(skip_all)]
    async fn refresh(&self, current: &Credential) -> Result<Credential, RefreshError> {
        debug!(expires_at = %current.expires_at(), "Requesting credential refresh");
        self.request_refresh(current).await
    }
}

/// Build a credential from a token response, falling back to `default_scope`
/// when the response does not echo one.
fn build_credential(
    token: &TokenResponse,
    refresh_token: String,
    default_scope: BTreeSet<String>,
) -> Result<Credential, String> {
    if token.expires_in <= 0 {
        return Err(format!("non-positive expires_in: {}", token.expires_in));
    }

    let issued_at = Utc::now();
    let expires_at = issued_at + ChronoDuration::seconds(token.expires_in);
    let scope = parse_scope(token.scope.as_deref()).unwrap_or(default_scope);

    Credential::new(
        token.access_token.clone(),
        refresh_token,
        scope,
        issued_at,
        expires_at,
    )
    .map_err(|e| e.to_string())
}

/// Map a non-2xx refresh response to a retryable or terminal failure.
pub(crate) fn classify_refresh_failure(status: StatusCode, body: &str) -> RefreshError {
    let error_body: OAuthErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = error_body.error.as_deref().unwrap_or_default();
    let detail = error_body
        .error_description
        .or(error_body.message)
        .unwrap_or_else(|| truncate(body));
    let message = if code.is_empty() {
        format!("HTTP {}: {}", status.as_u16(), detail)
    } else {
        format!("HTTP {} {}: {}", status.as_u16(), code, detail)
    };
    let status_code = Some(status.as_u16());

    let terminal_code = TERMINAL_ERROR_CODES.contains(&code);

    if status == StatusCode::UNAUTHORIZED
        || (terminal_code && (status == StatusCode::BAD_REQUEST || status == StatusCode::FORBIDDEN))
    {
        return RefreshError::Terminal {
            message,
            status: status_code,
        };
    }

    RefreshError::Retryable {
        message,
        status: status_code,
    }
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
#[path = "oauth_tests.rs"]
mod tests;
