//! Tests for the HTTP routes.

use super::*;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{Duration as ChronoDuration, Utc};
use openstreamkit_core::auth::{
    Credential, CredentialManagerConfig, InMemoryTokenStore, OAuthConfig,
};
use openstreamkit_core::dispatch::handlers::register_builtin_handlers;
use openstreamkit_core::webhook::signature::signed_content;
use openstreamkit_core::webhook::VerifierConfig;
use openstreamkit_core::dispatch::HandlerError;
use openstreamkit_core::{AuthState, EventEnvelope, EventHandler};
use std::time::Duration;
use serde_json::Value;
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "router-secret";

// ============================================================================
// Test helpers
// ============================================================================

fn fresh_credential() -> Credential {
    let now = Utc::now();
    Credential::new(
        "access-1",
        "refresh-1",
        Default::default(),
        now,
        now + ChronoDuration::hours(1),
    )
    .unwrap()
}

/// Build an [`AppState`] over in-memory components, with platform endpoints
/// pointed at `platform` (a wiremock server URI).
async fn test_state_with(
    config: ServiceConfig,
    credential: Option<Credential>,
    platform: &str,
) -> AppState {
    test_state_with_handlers(
        config,
        credential,
        platform,
        register_builtin_handlers(HandlerRegistryBuilder::new()),
    )
    .await
}

async fn test_state_with_handlers(
    config: ServiceConfig,
    credential: Option<Credential>,
    platform: &str,
    handlers: HandlerRegistryBuilder,
) -> AppState {
    let store = match credential {
        Some(credential) => InMemoryTokenStore::with_credential(credential),
        None => InMemoryTokenStore::new(),
    };
    let oauth = Arc::new(
        OAuthClient::new(
            OAuthConfig::new("client", "secret", "http://localhost:8000/callback")
                .with_base_url(platform),
        )
        .unwrap(),
    );
    let credentials = CredentialManager::new(
        Arc::new(store),
        oauth.clone(),
        CredentialManagerConfig::default(),
    )
    .await;

    let pipeline = Arc::new(IngressPipeline::new(
        SnapshotRecorder::disabled(),
        WebhookVerifier::new(
            Arc::new(HmacSignatureValidator::new(SECRET)),
            VerifierConfig::default(),
        ),
        EventDispatcher::new(handlers.build()),
    ));
    let subscriptions = Arc::new(
        EventSubscriptionClient::new(credentials.clone()).with_base_url(platform),
    );

    AppState::new(
        config,
        pipeline,
        credentials,
        oauth,
        subscriptions,
        ServiceMetrics::new().unwrap(),
    )
}

async fn test_state(credential: Option<Credential>) -> AppState {
    test_state_with(ServiceConfig::default(), credential, "http://127.0.0.1:9").await
}

fn signed_delivery(id: &str, secret: &str) -> Request<Body> {
    let body = br#"{"message_id":"m-1","sender":{"username":"viewer"},"content":"hello"}"#;
    let timestamp = Utc::now().to_rfc3339();
    let signature = HmacSignatureValidator::new(secret).sign(&signed_content(id, &timestamp, body));

    Request::builder()
        .method("POST")
        .uri("/kick/webhook")
        .header("Kick-Event-Message-Id", id)
        .header("Kick-Event-Message-Timestamp", timestamp)
        .header("Kick-Event-Signature", signature)
        .header("Kick-Event-Type", "chat.message.sent")
        .header("Kick-Event-Version", "1")
        .header("content-type", "application/json")
        .body(Body::from(body.to_vec()))
        .unwrap()
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = create_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// ============================================================================
// Webhook endpoint
// ============================================================================

mod webhook {
    use super::*;

    #[tokio::test]
    async fn test_valid_delivery_is_dispatched() {
        let state = test_state(None).await;

        let (status, body) = send(&state, signed_delivery("evt-1", SECRET)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["outcome"], "dispatched");
        assert_eq!(state.pipeline.stats().dispatched, 1);
    }

    #[tokio::test]
    async fn test_redelivery_is_acknowledged_as_duplicate() {
        let state = test_state(None).await;

        send(&state, signed_delivery("evt-1", SECRET)).await;
        let (status, body) = send(&state, signed_delivery("evt-1", SECRET)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "duplicate");
        assert_eq!(state.pipeline.stats().dispatched, 1);
    }

    #[tokio::test]
    async fn test_forged_delivery_is_acknowledged_but_not_dispatched() {
        let state = test_state(None).await;

        let (status, body) = send(&state, signed_delivery("evt-1", "not-the-secret")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "invalid_signature");
        assert_eq!(state.pipeline.stats().dispatched, 0);
        assert!(state.pipeline.verifier().dedup().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_without_headers_is_rejected_with_200() {
        let state = test_state(None).await;
        let request = Request::builder()
            .method("POST")
            .uri("/kick/webhook")
            .body(Body::from("{}"))
            .unwrap();

        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "invalid_signature");
    }

    #[tokio::test]
    async fn test_oversized_body_is_refused_by_transport() {
        let mut config = ServiceConfig::default();
        config.server.max_body_size = 16;
        let state = test_state_with(config, None, "http://127.0.0.1:9").await;

        let response = create_router(state.clone())
            .oneshot(signed_delivery("evt-1", SECRET))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(state.pipeline.stats().received, 0);
    }

    #[tokio::test]
    async fn test_custom_webhook_path_is_routed() {
        let mut config = ServiceConfig::default();
        config.webhooks.path = "/hooks/kick".to_string();
        let state = test_state_with(config, None, "http://127.0.0.1:9").await;
        let mut request = signed_delivery("evt-1", SECRET);
        *request.uri_mut() = "/hooks/kick".parse().unwrap();

        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "dispatched");
    }

    #[tokio::test]
    async fn test_deliveries_are_counted_in_metrics() {
        let state = test_state(None).await;

        send(&state, signed_delivery("evt-1", SECRET)).await;
        send(&state, signed_delivery("evt-1", SECRET)).await;

        let text = state.metrics.encode().unwrap();
        assert!(text.contains(r#"osk_webhook_deliveries_total{outcome="dispatched"} 1"#));
        assert!(text.contains(r#"osk_webhook_deliveries_total{outcome="duplicate"} 1"#));
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl EventHandler for SlowHandler {
        fn name(&self) -> &str {
            "slow"
        }

        async fn handle(&self, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_processing_is_abandoned_and_acknowledged() {
        let mut config = ServiceConfig::default();
        config.webhooks.processing_timeout_seconds = 1;
        let state = test_state_with_handlers(
            config,
            None,
            "http://127.0.0.1:9",
            HandlerRegistryBuilder::new().on_any(0, Arc::new(SlowHandler)),
        )
        .await;

        let (status, body) = send(&state, signed_delivery("evt-1", SECRET)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["outcome"], "timeout");
        let text = state.metrics.encode().unwrap();
        assert!(text.contains(r#"osk_webhook_deliveries_total{outcome="timeout"} 1"#));

        // The id was consumed before the handler stalled, so a retry is a duplicate.
        let (_, retry) = send(&state, signed_delivery("evt-1", SECRET)).await;
        assert_eq!(retry["outcome"], "duplicate");
    }
}

// ============================================================================
// Login flow
// ============================================================================

mod login {
    use super::*;

    fn state_param(authorization_url: &str) -> String {
        let url = reqwest::Url::parse(authorization_url).unwrap();
        url.query_pairs()
            .find(|(key, _)| key == "state")
            .map(|(_, value)| value.into_owned())
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_returns_authorization_url() {
        let state = test_state(None).await;

        let (status, body) = send(&state, get_request("/login")).await;

        assert_eq!(status, StatusCode::OK);
        let url = body["open_this_url_in_browser"].as_str().unwrap();
        assert!(url.contains("/oauth/authorize"));
        assert!(url.contains("code_challenge_method=S256"));
        assert_eq!(state.logins.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_callback_with_unknown_state_is_bad_request() {
        let state = test_state(None).await;

        let (status, body) = send(&state, get_request("/callback?code=abc&state=forged")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("/login"));
    }

    #[tokio::test]
    async fn test_callback_reporting_denial_is_bad_request() {
        let state = test_state(None).await;

        let (status, body) = send(
            &state,
            get_request("/callback?error=access_denied&error_description=user%20said%20no"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("access_denied"));
    }

    #[tokio::test]
    async fn test_callback_exchanges_code_and_installs_credential() {
        let platform = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-new",
                "refresh_token": "refresh-new",
                "expires_in": 3600,
                "scope": "events:subscribe",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&platform)
            .await;
        let state = test_state_with(ServiceConfig::default(), None, &platform.uri()).await;

        let (_, login) = send(&state, get_request("/login")).await;
        let login_state = state_param(login["open_this_url_in_browser"].as_str().unwrap());
        let (status, body) = send(
            &state,
            get_request(&format!("/callback?code=the-code&state={}", login_state)),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["scope"], serde_json::json!(["events:subscribe"]));
        assert!(matches!(
            state.credentials.status(),
            AuthState::Authorized { .. }
        ));
    }

    #[tokio::test]
    async fn test_callback_state_is_single_use() {
        let platform = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-new",
                "refresh_token": "refresh-new",
                "expires_in": 3600
            })))
            .mount(&platform)
            .await;
        let state = test_state_with(ServiceConfig::default(), None, &platform.uri()).await;
        let (_, login) = send(&state, get_request("/login")).await;
        let login_state = state_param(login["open_this_url_in_browser"].as_str().unwrap());
        let uri = format!("/callback?code=the-code&state={}", login_state);

        let (first, _) = send(&state, get_request(&uri)).await;
        let (second, _) = send(&state, get_request(&uri)).await;

        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rejected_exchange_is_bad_gateway() {
        let platform = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad code"))
            .mount(&platform)
            .await;
        let state = test_state_with(ServiceConfig::default(), None, &platform.uri()).await;
        let (_, login) = send(&state, get_request("/login")).await;
        let login_state = state_param(login["open_this_url_in_browser"].as_str().unwrap());

        let (status, _) = send(
            &state,
            get_request(&format!("/callback?code=bad&state={}", login_state)),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(state.credentials.status(), AuthState::NotAuthorized);
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

mod subscribe {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_without_credential_asks_for_login() {
        let state = test_state(None).await;
        let request = Request::builder()
            .method("POST")
            .uri("/subscribe")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("/login"));
    }

    #[tokio::test]
    async fn test_subscribe_echoes_platform_reply() {
        let platform = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/public/v1/events/subscriptions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"message": "OK"})),
            )
            .expect(1)
            .mount(&platform)
            .await;
        let state =
            test_state_with(ServiceConfig::default(), Some(fresh_credential()), &platform.uri())
                .await;
        let request = Request::builder()
            .method("POST")
            .uri("/subscribe")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status_code"], 200);
        assert_eq!(body["response"]["message"], "OK");
    }
}

// ============================================================================
// Health, metrics and middleware
// ============================================================================

mod operations {
    use super::*;

    #[tokio::test]
    async fn test_health_reports_auth_and_counters() {
        let state = test_state(Some(fresh_credential())).await;
        send(&state, signed_delivery("evt-1", SECRET)).await;

        let (status, body) = send(&state, get_request("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["auth"]["state"], "authorized");
        assert_eq!(body["ingress"]["received"], 1);
        assert_eq!(body["ingress"]["dispatched"], 1);
    }

    #[tokio::test]
    async fn test_metrics_are_exposed_as_text() {
        let state = test_state(None).await;

        let response = create_router(state).oneshot(get_request("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("osk_auth_reauthorization_required 0"));
    }

    #[tokio::test]
    async fn test_correlation_id_is_echoed() {
        let state = test_state(None).await;
        let request = Request::builder()
            .uri("/health")
            .header("x-correlation-id", "corr-123")
            .body(Body::empty())
            .unwrap();

        let response = create_router(state).oneshot(request).await.unwrap();

        assert_eq!(response.headers()["x-correlation-id"], "corr-123");
    }

    #[tokio::test]
    async fn test_correlation_id_reaches_handlers() {
        let app = Router::new()
            .route(
                "/whoami",
                get(|Extension(id): Extension<CorrelationId>| async move { id.to_string() }),
            )
            .layer(middleware::from_fn(request_logging_middleware));
        let request = Request::builder()
            .uri("/whoami")
            .header("x-correlation-id", "corr-9")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"corr-9");
    }

    #[tokio::test]
    async fn test_webhook_accepts_caller_correlation_id() {
        let state = test_state(None).await;
        let mut request = signed_delivery("evt-1", SECRET);
        request
            .headers_mut()
            .insert("x-correlation-id", "corr-hook".parse().unwrap());

        let response = create_router(state).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-correlation-id"], "corr-hook");
    }

    #[tokio::test]
    async fn test_correlation_id_is_generated_when_absent() {
        let state = test_state(None).await;

        let response = create_router(state).oneshot(get_request("/health")).await.unwrap();

        assert!(response.headers().contains_key("x-correlation-id"));
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancellation() {
        let state = test_state(None).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();

        let server = tokio::spawn(serve(listener, state, shutdown.clone()));
        shutdown.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
