//! Integration tests for the credential lifecycle
//!
//! A file-backed token store and the real OAuth client talk to a mock platform.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{chat_body, credential, pipeline, signed_request};
use openstreamkit_core::auth::{
    run_refresh_loop, CredentialManagerConfig, FileTokenStore, OAuthClient, OAuthConfig,
    TokenStore,
};
use openstreamkit_core::subscription::{EventSubscriptionClient, EventTopic};
use openstreamkit_core::{
    AuthState, CredentialManager, HandlerRegistryBuilder, SnapshotRecorder, TokenStoreError,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn oauth_client(platform: &MockServer) -> OAuthClient {
    OAuthClient::new(
        OAuthConfig::new("client", "secret", "http://localhost:8000/callback")
            .with_base_url(platform.uri())
            .with_request_timeout(Duration::from_secs(5)),
    )
    .unwrap()
}

/// Manager over a token file that already holds `access`, expiring after `lifetime`.
async fn manager_with_file(
    token_path: &Path,
    platform: &MockServer,
    access: &str,
    lifetime: ChronoDuration,
) -> CredentialManager {
    let store = FileTokenStore::open(token_path).await.unwrap();
    store.put(credential(access, lifetime)).await.unwrap();

    CredentialManager::new(
        Arc::new(store),
        Arc::new(oauth_client(platform)),
        CredentialManagerConfig::default(),
    )
    .await
}

fn refreshed_token_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "access_token": "refreshed",
        "refresh_token": "refresh-2",
        "expires_in": 3600,
        "scope": "events:subscribe",
        "token_type": "Bearer"
    }))
}

#[tokio::test]
async fn test_five_concurrent_actions_share_one_refresh() {
    let platform = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(refreshed_token_response().set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&platform)
        .await;
    Mock::given(method("POST"))
        .and(path("/public/v1/events/subscriptions"))
        .and(header("authorization", "Bearer refreshed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(5)
        .mount(&platform)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("token.json");
    let manager =
        manager_with_file(&token_path, &platform, "expiring", ChronoDuration::seconds(30)).await;
    let client = Arc::new(EventSubscriptionClient::new(manager.clone()).with_base_url(platform.uri()));

    let actions = (0..5).map(|_| {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .subscribe(&[EventTopic::new("chat.message.sent")])
                .await
        })
    });
    let results = futures::future::join_all(actions).await;

    for result in results {
        let response = result.unwrap().unwrap();
        assert!(response.is_success());
    }

    // The refreshed credential is durable and survives a restart.
    let reopened = FileTokenStore::open(&token_path).await.unwrap();
    let stored = reopened.get().await.unwrap();
    assert!(stored.expires_at() > Utc::now() + ChronoDuration::minutes(30));
}

#[tokio::test]
async fn test_rejected_refresh_requires_reauthorization_but_ingestion_continues() {
    let platform = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "refresh token revoked"
        })))
        .expect(1)
        .mount(&platform)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("token.json");
    let manager =
        manager_with_file(&token_path, &platform, "expiring", ChronoDuration::seconds(30)).await;

    let error = manager.bearer_token().await.unwrap_err();

    assert!(error.requires_authorization());
    assert!(manager.status().is_degraded());
    let reopened = FileTokenStore::open(&token_path).await.unwrap();
    assert!(matches!(reopened.get().await, Err(TokenStoreError::NoCredential)));

    // A second caller fails fast without another token request.
    assert!(manager.bearer_token().await.unwrap_err().requires_authorization());

    let pipeline = pipeline(HandlerRegistryBuilder::new(), SnapshotRecorder::disabled());
    let outcome = pipeline
        .process(signed_request("evt-1", "chat.message.sent", chat_body("still here")))
        .await;
    assert_eq!(outcome.label(), "dispatched");
}

#[tokio::test]
async fn test_transient_refresh_failure_keeps_using_unexpired_token() {
    let platform = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&platform)
        .await;
    Mock::given(method("GET"))
        .and(path("/public/v1/events/subscriptions"))
        .and(header("authorization", "Bearer expiring"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(1)
        .mount(&platform)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with_file(
        &dir.path().join("token.json"),
        &platform,
        "expiring",
        ChronoDuration::seconds(30),
    )
    .await;
    let client = EventSubscriptionClient::new(manager.clone()).with_base_url(platform.uri());

    let response = client.list().await.unwrap();

    assert!(response.is_success());
    assert!(!manager.status().is_degraded());
}

#[tokio::test]
async fn test_refresh_loop_renews_expiring_credential_and_stops_on_cancel() {
    let platform = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(refreshed_token_response())
        .expect(1)
        .mount(&platform)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with_file(
        &dir.path().join("token.json"),
        &platform,
        "expiring",
        ChronoDuration::seconds(30),
    )
    .await;
    let mut status = manager.subscribe_status();
    let shutdown = CancellationToken::new();
    let refresh_loop = tokio::spawn(run_refresh_loop(manager.clone(), shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            status.changed().await.unwrap();
            if let AuthState::Authorized { expires_at } = *status.borrow() {
                if expires_at > Utc::now() + ChronoDuration::minutes(30) {
                    break;
                }
            }
        }
    })
    .await
    .expect("credential was not refreshed");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), refresh_loop)
        .await
        .expect("refresh loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_interrupted_write_leaves_previous_credential_after_restart() {
    let platform = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("token.json");
    {
        let store = FileTokenStore::open(&token_path).await.unwrap();
        store
            .put(credential("durable", ChronoDuration::hours(1)))
            .await
            .unwrap();
    }

    // A crash between writing the temp file and renaming it.
    std::fs::write(dir.path().join("token.json.tmp"), br#"{"access_token":"half"#).unwrap();

    let store = FileTokenStore::open(&token_path).await.unwrap();
    let recovered = store.get().await.unwrap();
    assert!(recovered.expires_at() > Utc::now() + ChronoDuration::minutes(30));

    let manager = CredentialManager::new(
        Arc::new(store),
        Arc::new(oauth_client(&platform)),
        CredentialManagerConfig::default(),
    )
    .await;
    assert!(matches!(manager.status(), AuthState::Authorized { .. }));
    let content = std::fs::read_to_string(&token_path).unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&content).is_ok());
}
