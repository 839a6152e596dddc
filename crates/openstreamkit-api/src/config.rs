//! Configuration types for the HTTP service
//!
//! Values are layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. `/etc/openstreamkit/service.{yaml,json,toml}` (optional)
//! 3. `config/service.{yaml,json,toml}` (optional)
//! 4. The file named by `--config` or `OSK_CONFIG_FILE` (required when given)
//! 5. Plain environment variables kept for compatibility (`KICK_CLIENT_ID`, `DEBUG_PAYLOADS`, ...)
//! 6. `OSK__SECTION__KEY` environment variables

use ::config::{Config, Environment, File};
use openstreamkit_core::auth::{CredentialManagerConfig, OAuthConfig};
use openstreamkit_core::retry::RetryPolicy;
use openstreamkit_core::snapshot::{SnapshotConfig, DEFAULT_SNAPSHOT_DIR};
use openstreamkit_core::subscription::{EventTopic, DEFAULT_TOPICS};
use openstreamkit_core::webhook::dedup::{DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_WINDOW};
use openstreamkit_core::webhook::{VerifierConfig, DEFAULT_CLOCK_SKEW};
use openstreamkit_core::{KICK_API_BASE_URL, KICK_OAUTH_BASE_URL};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::ConfigError;

/// Prefix of structured environment overrides (`OSK__SERVER__PORT=9000`).
pub const ENV_PREFIX: &str = "OSK";

/// Environment variable naming an explicit configuration file.
pub const CONFIG_FILE_ENV: &str = "OSK_CONFIG_FILE";

// ============================================================================
// Secrets
// ============================================================================

/// A configuration string that never appears in logs or printed config.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<REDACTED>")
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_empty() {
            serializer.serialize_str("")
        } else {
            serializer.serialize_str("<REDACTED>")
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Platform application registration and endpoints
    pub kick: KickConfig,

    /// Webhook intake and replay protection
    pub webhooks: WebhookConfig,

    /// Credential storage and refresh
    pub auth: AuthConfig,

    /// Raw payload capture
    pub snapshots: SnapshotSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// How long in-flight requests may run after shutdown is requested
    pub shutdown_timeout_seconds: u64,

    /// Maximum request size in bytes
    pub max_body_size: usize,

    /// Enable permissive CORS
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            shutdown_timeout_seconds: 10,
            max_body_size: 1024 * 1024, // 1MB
            enable_cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KickConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: String,

    /// Public URL the platform delivers webhooks to; informational only
    pub webhook_public_url: Option<String>,

    pub oauth_base_url: String,
    pub api_base_url: String,
    pub scopes: Vec<String>,

    /// Topics requested by `POST /subscribe`
    pub topics: Vec<String>,

    /// Bound on one outbound platform request
    pub request_timeout_seconds: u64,
}

impl Default for KickConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: SecretString::default(),
            redirect_uri: "http://localhost:8000/callback".to_string(),
            webhook_public_url: None,
            oauth_base_url: KICK_OAUTH_BASE_URL.to_string(),
            api_base_url: KICK_API_BASE_URL.to_string(),
            scopes: vec!["events:subscribe".to_string()],
            topics: DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            request_timeout_seconds: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    /// RSA PKCS#1 v1.5 over SHA-256 with the platform's public key
    Rsa,
    /// HMAC-SHA256 with a shared secret
    Hmac,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    pub scheme: SignatureScheme,

    /// Inline PEM public key (RSA)
    pub public_key_pem: Option<String>,

    /// PEM public key file (RSA)
    pub public_key_path: Option<PathBuf>,

    /// Download the public key from the platform when none is configured (RSA)
    pub fetch_public_key: bool,

    /// Shared secret (HMAC)
    pub shared_secret: Option<SecretString>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            scheme: SignatureScheme::Rsa,
            public_key_pem: None,
            public_key_path: None,
            fetch_public_key: true,
            shared_secret: None,
        }
    }
}

/// Webhook processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Webhook endpoint path
    pub path: String,

    pub signature: SignatureConfig,

    pub dedup_window_seconds: u64,
    pub dedup_capacity: usize,
    pub clock_skew_seconds: u64,

    /// Deliveries still processing after this are abandoned and acknowledged
    pub processing_timeout_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            path: "/kick/webhook".to_string(),
            signature: SignatureConfig::default(),
            dedup_window_seconds: DEFAULT_DEDUP_WINDOW.as_secs(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            clock_skew_seconds: DEFAULT_CLOCK_SKEW.as_secs(),
            processing_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_seconds: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_seconds: policy.max_delay.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Where the credential is persisted
    pub token_file: PathBuf,

    pub refresh_margin_seconds: u64,
    pub attempt_timeout_seconds: u64,
    pub retry: RetrySettings,

    /// How long a started login waits for its callback
    pub login_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_file: PathBuf::from("json/token.json"),
            refresh_margin_seconds: 60,
            attempt_timeout_seconds: 20,
            retry: RetrySettings::default(),
            login_ttl_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub write_timeout_ms: u64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            write_timeout_ms: 2000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, used when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

// ============================================================================
// Compatibility Variables
// ============================================================================

struct LegacyVariable {
    key: &'static str,
    names: &'static [&'static str],
    convert: fn(&str) -> String,
}

fn verbatim(value: &str) -> String {
    value.trim().to_string()
}

fn truthy(value: &str) -> String {
    let enabled = matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    );
    enabled.to_string()
}

fn lowercase(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

/// Bare file names land in the `json/` data directory.
fn token_file(value: &str) -> String {
    let path = Path::new(value.trim());
    if path.parent().map(|p| p.as_os_str().is_empty()).unwrap_or(true) {
        Path::new("json").join(path).to_string_lossy().into_owned()
    } else {
        path.to_string_lossy().into_owned()
    }
}

fn hmac_scheme(_value: &str) -> String {
    "hmac".to_string()
}

const LEGACY_VARIABLES: &[LegacyVariable] = &[
    LegacyVariable {
        key: "kick.client_id",
        names: &["KICK_CLIENT_ID", "CLIENT_ID"],
        convert: verbatim,
    },
    LegacyVariable {
        key: "kick.client_secret",
        names: &["KICK_CLIENT_SECRET", "CLIENT_SECRET"],
        convert: verbatim,
    },
    LegacyVariable {
        key: "kick.redirect_uri",
        names: &["KICK_REDIRECT_URI"],
        convert: verbatim,
    },
    LegacyVariable {
        key: "kick.webhook_public_url",
        names: &["KICK_WEBHOOK_PUBLIC_URL", "WEBHOOK_PUBLIC_URL"],
        convert: verbatim,
    },
    LegacyVariable {
        key: "snapshots.enabled",
        names: &["DEBUG_PAYLOADS"],
        convert: truthy,
    },
    LegacyVariable {
        key: "auth.token_file",
        names: &["TOKEN_FILE"],
        convert: token_file,
    },
    LegacyVariable {
        key: "logging.level",
        names: &["LOG_LEVEL"],
        convert: lowercase,
    },
    LegacyVariable {
        key: "webhooks.signature.shared_secret",
        names: &["KICK_WEBHOOK_SECRET"],
        convert: verbatim,
    },
    LegacyVariable {
        key: "webhooks.signature.scheme",
        names: &["KICK_WEBHOOK_SECRET"],
        convert: hmac_scheme,
    },
];

fn structured_name(key: &str) -> String {
    format!("{}__{}", ENV_PREFIX, key.replace('.', "__").to_ascii_uppercase())
}

/// Overrides derived from compatibility variables present in `env`.
///
/// The first non-blank name in each list wins. A key is skipped when its
/// `OSK__...` form is also set, so structured variables always take precedence.
pub fn legacy_overrides(env: &HashMap<String, String>) -> Vec<(&'static str, String)> {
    LEGACY_VARIABLES
        .iter()
        .filter(|legacy| !env.contains_key(&structured_name(legacy.key)))
        .filter_map(|legacy| {
            legacy
                .names
                .iter()
                .filter_map(|name| env.get(*name))
                .find(|value| !value.trim().is_empty())
                .map(|value| (legacy.key, (legacy.convert)(value)))
        })
        .collect()
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl ServiceConfig {
    /// Load configuration from files and the process environment.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::load_from(explicit_path, &env)
    }

    /// Load configuration against an explicit environment map.
    pub fn load_from(
        explicit_path: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/openstreamkit/service").required(false))
            .add_source(File::with_name("config/service").required(false));

        let explicit = explicit_path
            .map(Path::to_path_buf)
            .or_else(|| env.get(CONFIG_FILE_ENV).map(PathBuf::from));
        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .source(Some(env.clone().into_iter().collect())),
        );

        for (key, value) in legacy_overrides(env) {
            builder = builder.set_override(key, value)?;
        }

        let config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kick.client_id.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "kick.client_id".to_string(),
            });
        }
        if self.kick.client_secret.is_empty() {
            return Err(ConfigError::Missing {
                key: "kick.client_secret".to_string(),
            });
        }
        reqwest::Url::parse(&self.kick.redirect_uri).map_err(|e| ConfigError::Invalid {
            message: format!("kick.redirect_uri is not a URL: {}", e),
        })?;

        if !self.webhooks.path.starts_with('/') {
            return Err(ConfigError::Invalid {
                message: "webhooks.path must start with '/'".to_string(),
            });
        }
        if self.webhooks.dedup_capacity == 0 || self.webhooks.dedup_window_seconds == 0 {
            return Err(ConfigError::Invalid {
                message: "webhooks.dedup_window_seconds and webhooks.dedup_capacity must be positive"
                    .to_string(),
            });
        }
        if self.webhooks.processing_timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                message: "webhooks.processing_timeout_seconds must be positive".to_string(),
            });
        }

        let signature = &self.webhooks.signature;
        match signature.scheme {
            SignatureScheme::Hmac => {
                if signature.shared_secret.as_ref().map(SecretString::is_empty).unwrap_or(true) {
                    return Err(ConfigError::Missing {
                        key: "webhooks.signature.shared_secret".to_string(),
                    });
                }
            }
            SignatureScheme::Rsa => {
                if signature.public_key_pem.is_none()
                    && signature.public_key_path.is_none()
                    && !signature.fetch_public_key
                {
                    return Err(ConfigError::Invalid {
                        message: "RSA verification needs public_key_pem, public_key_path or fetch_public_key"
                            .to_string(),
                    });
                }
            }
        }

        if self.auth.attempt_timeout_seconds == 0
            || self.auth.attempt_timeout_seconds >= self.auth.refresh_margin_seconds
        {
            return Err(ConfigError::Invalid {
                message: "auth.attempt_timeout_seconds must be positive and below auth.refresh_margin_seconds"
                    .to_string(),
            });
        }
        let retry = &self.auth.retry;
        if Duration::from_millis(retry.initial_delay_ms) > Duration::from_secs(retry.max_delay_seconds) {
            return Err(ConfigError::Invalid {
                message: "auth.retry.initial_delay_ms exceeds auth.retry.max_delay_seconds".to_string(),
            });
        }

        if self.kick.topics.is_empty() {
            return Err(ConfigError::Invalid {
                message: "kick.topics must name at least one topic".to_string(),
            });
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_seconds)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.webhooks.processing_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.kick.request_timeout_seconds)
    }

    pub fn login_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.login_ttl_seconds)
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            dedup_window: Duration::from_secs(self.webhooks.dedup_window_seconds),
            dedup_capacity: self.webhooks.dedup_capacity,
            clock_skew: Duration::from_secs(self.webhooks.clock_skew_seconds),
        }
    }

    pub fn credential_manager_config(&self) -> CredentialManagerConfig {
        let retry = &self.auth.retry;
        CredentialManagerConfig {
            refresh_margin: Duration::from_secs(self.auth.refresh_margin_seconds),
            attempt_timeout: Duration::from_secs(self.auth.attempt_timeout_seconds),
            retry_policy: RetryPolicy::new(
                retry.max_attempts,
                Duration::from_millis(retry.initial_delay_ms),
                Duration::from_secs(retry.max_delay_seconds),
                2.0,
            ),
        }
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            enabled: self.snapshots.enabled,
            directory: self.snapshots.directory.clone(),
            write_timeout: Duration::from_millis(self.snapshots.write_timeout_ms),
        }
    }

    pub fn oauth_config(&self) -> OAuthConfig {
        let mut oauth = OAuthConfig::new(
            self.kick.client_id.clone(),
            self.kick.client_secret.expose(),
            self.kick.redirect_uri.clone(),
        )
        .with_base_url(self.kick.oauth_base_url.clone())
        .with_request_timeout(self.request_timeout());
        oauth.scopes = self.kick.scopes.clone();
        oauth
    }

    pub fn topics(&self) -> Vec<EventTopic> {
        self.kick.topics.iter().map(EventTopic::new).collect()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
