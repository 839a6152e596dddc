//! # OpenStreamKit HTTP Service
//!
//! HTTP surface of the engine. It provides:
//! - the platform webhook endpoint, which acknowledges every delivery with `200`
//! - the OAuth login flow (`/login`, `/callback`)
//! - event subscription management (`/subscribe`, `/subscriptions`)
//! - health and Prometheus endpoints
//!
//! All correctness guarantees live in `openstreamkit-core`; this crate wires
//! them to routes and maps their errors to responses.

pub mod config;
pub mod errors;
pub mod metrics;
pub mod responses;

pub use config::ServiceConfig;
pub use errors::{ApiError, ConfigError, ServiceError};
pub use metrics::ServiceMetrics;

use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use bytes::Bytes;
use openstreamkit_core::auth::{FileTokenStore, LoginSessions, OAuthClient};
use openstreamkit_core::subscription::{EventSubscriptionClient, SubscriptionResponse};
use openstreamkit_core::webhook::signature::{
    fetch_kick_public_key, HmacSignatureValidator, KickRsaSignatureValidator, SignatureValidator,
};
use openstreamkit_core::webhook::{WebhookHeaders, WebhookRequest};
use openstreamkit_core::{
    CredentialManager, EventDispatcher, HandlerRegistryBuilder, IngressOutcome, IngressPipeline,
    SnapshotRecorder, WebhookVerifier,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument, warn};

use crate::config::SignatureScheme;
use crate::responses::{CallbackResponse, HealthResponse, LoginResponse, WebhookResponse};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration for the service
    pub config: Arc<ServiceConfig>,

    /// Snapshot, verify and dispatch path for deliveries
    pub pipeline: Arc<IngressPipeline>,

    /// Credential lifecycle shared with the refresh loop
    pub credentials: CredentialManager,

    pub oauth: Arc<OAuthClient>,

    /// PKCE verifiers waiting for their callback
    pub logins: Arc<LoginSessions>,

    pub subscriptions: Arc<EventSubscriptionClient>,

    pub metrics: Arc<ServiceMetrics>,
}

impl AppState {
    pub fn new(
        config: ServiceConfig,
        pipeline: Arc<IngressPipeline>,
        credentials: CredentialManager,
        oauth: Arc<OAuthClient>,
        subscriptions: Arc<EventSubscriptionClient>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let logins = Arc::new(LoginSessions::new(config.login_ttl()));
        Self {
            config: Arc::new(config),
            pipeline,
            credentials,
            oauth,
            logins,
            subscriptions,
            metrics,
        }
    }

    /// Build every component from configuration.
    ///
    /// Opens the token file, resolves the webhook signing key (fetching it from
    /// the platform when configured to) and freezes `handlers` into the dispatcher.
    pub async fn from_config(
        config: ServiceConfig,
        handlers: HandlerRegistryBuilder,
    ) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ServiceError::Startup {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        let store = FileTokenStore::open(config.auth.token_file.clone())
            .await
            .map_err(|e| ServiceError::Startup {
                message: format!(
                    "Failed to open token file {}: {}",
                    config.auth.token_file.display(),
                    e
                ),
            })?;

        let oauth = Arc::new(
            OAuthClient::with_http_client(config.oauth_config(), http.clone()).map_err(|e| {
                ServiceError::Configuration(ConfigError::Invalid {
                    message: format!("kick.oauth_base_url is not a URL: {}", e),
                })
            })?,
        );
        let credentials = CredentialManager::new(
            Arc::new(store),
            oauth.clone(),
            config.credential_manager_config(),
        )
        .await;

        let validator = build_signature_validator(&config, &http).await?;
        info!(scheme = validator.scheme(), "Webhook signature verification ready");

        let pipeline = Arc::new(IngressPipeline::new(
            SnapshotRecorder::new(config.snapshot_config()),
            WebhookVerifier::new(validator, config.verifier_config()),
            EventDispatcher::new(handlers.build()),
        ));

        let subscriptions = Arc::new(
            EventSubscriptionClient::new(credentials.clone())
                .with_base_url(config.kick.api_base_url.clone())
                .with_http_client(http)
                .with_request_timeout(config.request_timeout()),
        );

        let metrics = ServiceMetrics::new().map_err(|e| ServiceError::Startup {
            message: format!("Failed to initialize metrics: {}", e),
        })?;

        if let Some(url) = &config.kick.webhook_public_url {
            info!(webhook_public_url = %url, path = %config.webhooks.path, "Expecting platform deliveries");
        }

        Ok(Self::new(
            config,
            pipeline,
            credentials,
            oauth,
            subscriptions,
            metrics,
        ))
    }
}

async fn build_signature_validator(
    config: &ServiceConfig,
    http: &reqwest::Client,
) -> Result<Arc<dyn SignatureValidator>, ServiceError> {
    let signature = &config.webhooks.signature;
    match signature.scheme {
        SignatureScheme::Hmac => {
            let secret = signature
                .shared_secret
                .as_ref()
                .filter(|secret| !secret.is_empty())
                .ok_or_else(|| {
                    ServiceError::Configuration(ConfigError::Missing {
                        key: "webhooks.signature.shared_secret".to_string(),
                    })
                })?;
            Ok(Arc::new(HmacSignatureValidator::new(secret.expose())))
        }
        SignatureScheme::Rsa => {
            let validator = if let Some(pem) = &signature.public_key_pem {
                KickRsaSignatureValidator::from_pem(pem)
            } else if let Some(path) = &signature.public_key_path {
                KickRsaSignatureValidator::from_pem_file(path).await
            } else {
                fetch_kick_public_key(http, &config.kick.api_base_url, config.request_timeout())
                    .await
            };

            let validator = validator.map_err(|e| ServiceError::Startup {
                message: format!("Webhook public key unavailable: {}", e),
            })?;
            Ok(Arc::new(validator))
        }
    }
}

/// `x-correlation-id` of the current request, taken from the caller or
/// generated by the logging middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Router and Server
// ============================================================================

/// Create the HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let webhook_routes = Router::new().route(&state.config.webhooks.path, post(handle_webhook));

    let auth_routes = Router::new()
        .route("/login", get(handle_login))
        .route("/callback", get(handle_callback))
        .route("/subscribe", post(handle_subscribe))
        .route("/subscriptions", get(list_subscriptions));

    let health_routes = Router::new().route("/health", get(handle_health_check));

    let observability_routes = Router::new().route("/metrics", get(metrics_endpoint));

    let router = Router::new()
        .merge(webhook_routes)
        .merge(auth_routes)
        .merge(health_routes)
        .merge(observability_routes)
        .layer(DefaultBodyLimit::max(state.config.server.max_body_size))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_logging_middleware))
                .into_inner(),
        );

    let router = if state.config.server.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    router.with_state(state)
}

/// Bind the configured address and serve until `shutdown` is cancelled.
pub async fn start_server(state: AppState, shutdown: CancellationToken) -> Result<(), ServiceError> {
    let address = state.config.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| ServiceError::BindFailed {
            address: address.clone(),
            message: e.to_string(),
        })?;

    serve(listener, state, shutdown).await
}

/// Serve on an already bound listener.
///
/// Once `shutdown` is cancelled no new connections are accepted and in-flight
/// requests get `server.shutdown_timeout_seconds` to finish before they are dropped.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServiceError> {
    let drain_timeout = state.config.shutdown_timeout();
    if let Ok(address) = listener.local_addr() {
        info!(address = %address, "Starting HTTP server");
    }

    let app = create_router(state);
    let signal = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .into_future();
    tokio::pin!(server);

    let drain_deadline = async {
        shutdown.cancelled().await;
        info!(
            timeout_seconds = drain_timeout.as_secs(),
            "Shutdown requested, draining in-flight requests"
        );
        tokio::time::sleep(drain_timeout).await;
    };

    tokio::select! {
        result = &mut server => {
            result.map_err(|e| ServiceError::ServerFailed {
                message: e.to_string(),
            })?;
            info!("HTTP server shutdown complete");
        }
        _ = drain_deadline => {
            warn!(
                timeout_seconds = drain_timeout.as_secs(),
                "Drain timeout elapsed, abandoning in-flight requests"
            );
        }
    }

    Ok(())
}

// ============================================================================
// Webhook Handler
// ============================================================================

/// Handle platform webhook deliveries
///
/// Every delivery is acknowledged with `200 {"ok": true, "outcome": ...}`:
/// rejections (forged, malformed, duplicate, stale) must not provoke platform
/// retries. Processing that outlives `webhooks.processing_timeout_seconds` is
/// abandoned and acknowledged with outcome `timeout`.
#[instrument(
    skip(state, correlation, headers, body),
    fields(correlation_id = %correlation.0, body_size = body.len())
)]
pub async fn handle_webhook(
    State(state): State<AppState>,
    correlation: Extension<CorrelationId>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<WebhookResponse> {
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();

    let request = WebhookRequest::new(WebhookHeaders::from_http_headers(&header_map), body);
    let message_id = request.headers.message_id.clone();
    let timeout = state.config.processing_timeout();

    let timer = state.metrics.webhook_processing_seconds.start_timer();
    let (outcome, failures) = match tokio::time::timeout(timeout, state.pipeline.process(request)).await {
        Ok(IngressOutcome::Dispatched(report)) => ("dispatched", report.failures.len()),
        Ok(rejected) => (rejected.label(), 0),
        Err(_) => {
            error!(
                message_id = ?message_id,
                timeout_seconds = timeout.as_secs(),
                "Delivery processing timed out and was abandoned"
            );
            ("timeout", 0)
        }
    };
    timer.observe_duration();
    state.metrics.record_delivery(outcome, failures);

    Json(WebhookResponse {
        ok: true,
        outcome: outcome.to_string(),
    })
}

// ============================================================================
// Authorization Handlers
// ============================================================================

#[instrument(skip(state))]
async fn handle_login(State(state): State<AppState>) -> Json<LoginResponse> {
    let login = state.logins.begin(&state.oauth).await;
    info!("Login started; waiting for the browser callback");
    Json(LoginResponse {
        open_this_url_in_browser: login.authorization_url,
    })
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[instrument(skip_all)]
async fn handle_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<CallbackResponse>, ApiError> {
    let result = complete_login(&state, params).await;
    let label = match &result {
        Ok(_) => "authorized",
        Err(ApiError::InvalidLoginState) => "invalid_state",
        Err(ApiError::AuthorizationDenied { .. }) => "denied",
        Err(_) => "failed",
    };
    state
        .metrics
        .login_callbacks_total
        .with_label_values(&[label])
        .inc();
    result.map(Json)
}

async fn complete_login(
    state: &AppState,
    params: CallbackParams,
) -> Result<CallbackResponse, ApiError> {
    if let Some(error) = params.error {
        let message = match params.error_description {
            Some(description) => format!("{}: {}", error, description),
            None => error,
        };
        return Err(ApiError::AuthorizationDenied { message });
    }

    let login_state = params.state.ok_or(ApiError::InvalidLoginState)?;
    let verifier = state
        .logins
        .take_verifier(&login_state)
        .await
        .ok_or(ApiError::InvalidLoginState)?;
    let code = params.code.ok_or_else(|| ApiError::AuthorizationDenied {
        message: "callback carried no authorization code".to_string(),
    })?;

    let credential = state.oauth.exchange_code(&code, &verifier).await?;
    let expires_at = credential.expires_at();
    let scope = credential.scope().iter().cloned().collect();
    state.credentials.install(credential).await?;

    info!(expires_at = %expires_at, "Authorization complete");
    Ok(CallbackResponse {
        ok: true,
        next: "Call POST /subscribe to start receiving events".to_string(),
        expires_at,
        scope,
    })
}

#[instrument(skip(state))]
async fn handle_subscribe(
    State(state): State<AppState>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let topics = state.config.topics();
    let response = state.subscriptions.subscribe(&topics).await?;
    if !response.is_success() {
        warn!(status = response.status_code, "Platform declined the subscription request");
    }
    Ok(Json(response))
}

#[instrument(skip(state))]
async fn list_subscriptions(
    State(state): State<AppState>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    Ok(Json(state.subscriptions.list().await?))
}

// ============================================================================
// Health and Metrics
// ============================================================================

async fn handle_health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let auth = state.credentials.status();
    state
        .metrics
        .auth_reauthorization_required
        .set(i64::from(auth.is_degraded()));

    Json(HealthResponse {
        status: if auth.is_degraded() {
            "degraded".to_string()
        } else {
            "healthy".to_string()
        },
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        auth,
        ingress: state.pipeline.stats(),
        snapshots_enabled: state.pipeline.snapshots().is_enabled(),
    })
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    state
        .metrics
        .auth_reauthorization_required
        .set(i64::from(state.credentials.status().is_degraded()));

    match state.metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => ApiError::Internal {
            message: format!("metrics encoding failed: {}", e),
        }
        .into_response(),
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Request logging middleware with correlation IDs
async fn request_logging_middleware(
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().path().to_string();
    let start = std::time::Instant::now();

    let correlation_id = request
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let mut response = next.run(request).await;
    let duration = start.elapsed();

    if let Ok(header_value) = correlation_id.parse() {
        response
            .headers_mut()
            .insert("x-correlation-id", header_value);
    }

    let status = response.status();
    if status.is_server_error() {
        error!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed with server error"
        );
    } else if status.is_client_error() {
        warn!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed with client error"
        );
    } else {
        info!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed successfully"
        );
    }

    response
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
