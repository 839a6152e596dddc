//! # Credential Lifecycle
//!
//! OAuth credential types and the components that own them:
//!
//! - [`store`]: durable single-writer storage of the current [`Credential`]
//! - [`oauth`]: authorization-code exchange and refresh against the token endpoint
//! - [`login`]: PKCE login sessions used to start the authorization flow
//! - [`manager`]: the single access point for outbound callers, with
//!   single-flight refresh and the background refresh loop
//!
//! The raw access token never leaves this module. Outbound callers receive a
//! [`BearerToken`] that can only be attached to a request.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ValidationError;

pub mod login;
pub mod manager;
pub mod oauth;
pub mod store;

pub use login::{LoginRequest, LoginSessions};
pub use manager::{run_refresh_loop, CredentialManager, CredentialManagerConfig};
pub use oauth::{OAuthClient, OAuthConfig, TokenRefresher};
pub use store::{FileTokenStore, InMemoryTokenStore, TokenStore};

// ============================================================================
// Credential
// ============================================================================

/// OAuth access/refresh token pair with its validity window.
///
/// Credentials are immutable: a refresh produces a new value that replaces
/// the old one in the [`TokenStore`]. Secret material is wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    access_token: String,
    refresh_token: String,
    #[zeroize(skip)]
    scope: BTreeSet<String>,
    #[zeroize(skip)]
    issued_at: DateTime<Utc>,
    #[zeroize(skip)]
    expires_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential, enforcing `expires_at > issued_at` and non-empty tokens.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        scope: BTreeSet<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let credential = Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            scope,
            issued_at,
            expires_at,
        };
        credential.validate()?;
        Ok(credential)
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if self.access_token.is_empty() {
            return Err(ValidationError::Required {
                field: "access_token".to_string(),
            });
        }

        if self.refresh_token.is_empty() {
            return Err(ValidationError::Required {
                field: "refresh_token".to_string(),
            });
        }

        if self.expires_at <= self.issued_at {
            return Err(ValidationError::InvalidFormat {
                field: "expires_at".to_string(),
                message: format!(
                    "must be later than issued_at ({} <= {})",
                    self.expires_at, self.issued_at
                ),
            });
        }

        Ok(())
    }

    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the credential expires within `margin` of `now`, or already has.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        match (self.expires_at - now).to_std() {
            Ok(remaining) => remaining <= margin,
            Err(_) => true,
        }
    }

    /// Bearer token for authenticated outbound calls.
    pub fn bearer(&self) -> BearerToken {
        BearerToken(self.access_token.clone())
    }

    pub(crate) fn access_token(&self) -> &str {
        &self.access_token
    }

    pub(crate) fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<REDACTED>")
            .field("refresh_token", &"<REDACTED>")
            .field("scope", &self.scope)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Access token that can be attached to an outbound request and nothing else.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BearerToken(String);

impl BearerToken {
    /// Attach the token as an `Authorization: Bearer` header.
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(&self.0)
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerToken(<REDACTED>)")
    }
}

// ============================================================================
// Authorization State
// ============================================================================

/// Process-wide authorization status, visible to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthState {
    /// No credential has ever been installed.
    NotAuthorized,

    /// A credential is installed and usable until `expires_at`.
    Authorized { expires_at: DateTime<Utc> },

    /// Refresh was rejected or exhausted its retries; a human must log in again.
    ReauthorizationRequired { reason: String },
}

impl AuthState {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::ReauthorizationRequired { .. })
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Failures of the credential store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenStoreError {
    #[error("No credential stored; authorization is required")]
    NoCredential,

    #[error("Token persistence failed: {message}")]
    PersistenceFailure { message: String },

    #[error("Stored credential is invalid: {0}")]
    InvalidCredential(#[from] ValidationError),

    #[error("Token store is closed")]
    Closed,
}

/// Failure of the one-time authorization-code exchange.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthExchangeError {
    #[error("Token endpoint rejected the authorization code (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Token endpoint returned a malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Token endpoint request failed: {message}")]
    Transport { message: String },
}

/// Failure of a single refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// Network failure, timeout, throttling or server error. Worth retrying.
    #[error("Credential refresh failed (retryable): {message}")]
    Retryable {
        message: String,
        status: Option<u16>,
    },

    /// The platform rejected the refresh grant. Only a new login can recover.
    #[error("Credential refresh rejected: {message}")]
    Terminal {
        message: String,
        status: Option<u16>,
    },
}

impl RefreshError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}

/// Errors seen by callers that need a usable credential.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    #[error("Not authorized yet; visit /login to authorize")]
    NotAuthorized,

    #[error("Reauthorization required ({reason}); visit /login to authorize again")]
    ReauthorizationRequired { reason: String },

    #[error(transparent)]
    RefreshFailed(RefreshError),

    #[error("Credential storage failed: {0}")]
    Storage(TokenStoreError),
}

impl CredentialError {
    /// Whether retrying the operation later may succeed without human action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RefreshFailed(error) => error.is_transient(),
            Self::Storage(TokenStoreError::PersistenceFailure { .. }) => true,
            _ => false,
        }
    }

    /// Whether a human must re-run the login flow.
    pub fn requires_authorization(&self) -> bool {
        matches!(
            self,
            Self::NotAuthorized | Self::ReauthorizationRequired { .. }
        )
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
