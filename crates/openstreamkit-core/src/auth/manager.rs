//! # Credential Manager
//!
//! Mediates every use of the current credential.
//!
//! - Outbound callers ask for a [`BearerToken`]; if the credential is inside the
//!   refresh margin the manager refreshes it first.
//! - Refresh is single-flight: concurrent callers share one in-flight attempt.
//!   The attempt runs on its own task, so a caller that gives up waiting never
//!   abandons a refresh halfway through committing it.
//! - A terminal refresh rejection, or a background loop that exhausts its retry
//!   policy, moves the process into [`AuthState::ReauthorizationRequired`].
//!   Webhook ingestion is unaffected; only authenticated actions fail.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    AuthState, BearerToken, Credential, CredentialError, RefreshError, TokenRefresher, TokenStore,
    TokenStoreError,
};
use crate::retry::RetryPolicy;

type RefreshFlight = Shared<BoxFuture<'static, Result<Credential, CredentialError>>>;

/// Minimum spacing between scheduled refreshes, so a credential whose lifetime
/// is shorter than the margin cannot spin the loop.
const MIN_REFRESH_SPACING: Duration = Duration::from_secs(5);

/// Tuning for refresh timing.
#[derive(Debug, Clone)]
pub struct CredentialManagerConfig {
    /// Refresh once the credential is this close to expiry
    pub refresh_margin: Duration,

    /// Bound on one refresh attempt, including persistence
    pub attempt_timeout: Duration,

    /// Backoff used by the background loop after retryable failures
    pub retry_policy: RetryPolicy,
}

impl Default for CredentialManagerConfig {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(20),
            retry_policy: RetryPolicy::default(),
        }
    }
}

struct Inner {
    store: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    config: CredentialManagerConfig,
    inflight: Mutex<Option<RefreshFlight>>,
    state: watch::Sender<AuthState>,
}

/// Shared handle to the credential lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl CredentialManager {
    /// Create a manager over an opened store, deriving the initial state from it.
    pub async fn new(
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        config: CredentialManagerConfig,
    ) -> Self {
        let initial = match store.get().await {
            Ok(credential) => AuthState::Authorized {
                expires_at: credential.expires_at(),
            },
            Err(_) => AuthState::NotAuthorized,
        };
        let (state, _) = watch::channel(initial);

        Self {
            inner: Arc::new(Inner {
                store,
                refresher,
                config,
                inflight: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn config(&self) -> &CredentialManagerConfig {
        &self.inner.config
    }

    pub fn status(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    /// Install a credential obtained from a fresh login.
    pub async fn install(&self, credential: Credential) -> Result<(), CredentialError> {
        let expires_at = credential.expires_at();
        self.inner
            .store
            .put(credential)
            .await
            .map_err(CredentialError::Storage)?;
        self.inner
            .state
            .send_replace(AuthState::Authorized { expires_at });
        info!(expires_at = %expires_at, "Credential installed");
        Ok(())
    }

    /// A bearer token that is valid now, refreshing first when inside the margin.
    ///
    /// If a retryable refresh fails while the current credential has not yet
    /// expired, the current token is still returned.
    pub async fn bearer_token(&self) -> Result<BearerToken, CredentialError> {
        let current = self.usable_credential().await?;
        if !current.expires_within(self.inner.config.refresh_margin, Utc::now()) {
            return Ok(current.bearer());
        }

        match self.join_or_start(false).await {
            Ok(fresh) => Ok(fresh.bearer()),
            Err(CredentialError::RefreshFailed(error))
                if error.is_transient() && !current.is_expired_at(Utc::now()) =>
            {
                warn!(
                    error = %error,
                    expires_at = %current.expires_at(),
                    "Refresh failed; using current credential until it expires"
                );
                Ok(current.bearer())
            }
            Err(error) => Err(error),
        }
    }

    /// Refresh now, joining an attempt that is already in flight.
    pub async fn refresh_now(&self) -> Result<Credential, CredentialError> {
        self.usable_credential().await?;
        self.join_or_start(true).await
    }

    /// Wait for an in-flight refresh to commit, then close the store.
    pub async fn close(&self) -> Result<(), TokenStoreError> {
        let flight = self.inner.inflight.lock().await.clone();
        if let Some(flight) = flight {
            debug!("Waiting for in-flight refresh before closing");
            let _ = flight.await;
        }
        self.inner.store.close().await
    }

    async fn usable_credential(&self) -> Result<Credential, CredentialError> {
        if let AuthState::ReauthorizationRequired { reason } = self.status() {
            return Err(CredentialError::ReauthorizationRequired { reason });
        }

        match self.inner.store.get().await {
            Ok(credential) => Ok(credential),
            Err(TokenStoreError::NoCredential) => Err(CredentialError::NotAuthorized),
            Err(other) => Err(CredentialError::Storage(other)),
        }
    }

    async fn join_or_start(&self, force: bool) -> Result<Credential, CredentialError> {
        let flight = {
            let mut slot = self.inner.inflight.lock().await;
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight credential refresh");
                    existing.clone()
                }
                None => {
                    if !force {
                        // Another caller may have refreshed between our expiry
                        // check and taking the slot.
                        if let Ok(current) = self.inner.store.get().await {
                            if !current.expires_within(self.inner.config.refresh_margin, Utc::now())
                            {
                                return Ok(current);
                            }
                        }
                    }

                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move { inner.run_refresh().await });
                    let flight: RefreshFlight = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(join_error) => Err(CredentialError::RefreshFailed(
                                RefreshError::Retryable {
                                    message: format!("refresh task failed: {}", join_error),
                                    status: None,
                                },
                            )),
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    /// Move to the degraded state without discarding the stored credential.
    async fn escalate(&self, reason: String) {
        error!(reason = %reason, "Credential refresh exhausted; reauthorization required");
        self.inner
            .state
            .send_replace(AuthState::ReauthorizationRequired { reason });
    }

    /// Refresh with exponential backoff until success, a non-retryable error,
    /// exhausted retries, or cancellation between attempts.
    async fn refresh_with_retries(&self, shutdown: &CancellationToken) {
        let policy = self.inner.config.retry_policy.clone();
        let mut attempt: u32 = 0;

        loop {
            match self.refresh_now().await {
                Ok(credential) => {
                    debug!(
                        attempt,
                        expires_at = %credential.expires_at(),
                        "Scheduled refresh succeeded"
                    );
                    return;
                }
                Err(error) if error.is_transient() => {
                    if !policy.should_retry(attempt) {
                        self.escalate(format!(
                            "refresh failed after {} attempts: {}",
                            attempt + 1,
                            error
                        ))
                        .await;
                        return;
                    }

                    let delay = policy.calculate_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Credential refresh failed; backing off"
                    );
                    attempt += 1;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
                Err(CredentialError::ReauthorizationRequired { .. }) => return,
                Err(CredentialError::NotAuthorized) => {
                    self.inner.state.send_replace(AuthState::NotAuthorized);
                    return;
                }
                Err(error) => {
                    self.escalate(format!("refresh cannot proceed: {}", error))
                        .await;
                    return;
                }
            }
        }
    }
}

impl Inner {
    async fn run_refresh(self: Arc<Self>) -> Result<Credential, CredentialError> {
        let result = self.refresh_once().await;
        self.inflight.lock().await.take();
        result
    }

    async fn refresh_once(&self) -> Result<Credential, CredentialError> {
        let current = match self.store.get().await {
            Ok(credential) => credential,
            Err(TokenStoreError::NoCredential) => return Err(CredentialError::NotAuthorized),
            Err(other) => return Err(CredentialError::Storage(other)),
        };

        let attempt =
            tokio::time::timeout(self.config.attempt_timeout, self.refresher.refresh(&current))
                .await
                .unwrap_or_else(|_| {
                    Err(RefreshError::Retryable {
                        message: format!(
                            "refresh attempt exceeded {}s",
                            self.config.attempt_timeout.as_secs()
                        ),
                        status: None,
                    })
                });

        match attempt {
            Ok(refreshed) => {
                self.store
                    .put(refreshed.clone())
                    .await
                    .map_err(CredentialError::Storage)?;
                self.state.send_replace(AuthState::Authorized {
                    expires_at: refreshed.expires_at(),
                });
                info!(expires_at = %refreshed.expires_at(), "Credential refreshed");
                Ok(refreshed)
            }
            Err(error) if error.is_terminal() => {
                let reason = error.to_string();
                if let Err(clear_error) = self.store.clear().await {
                    error!(error = %clear_error, "Failed to clear rejected credential");
                }
                self.state.send_replace(AuthState::ReauthorizationRequired {
                    reason: reason.clone(),
                });
                error!(reason = %reason, "Refresh rejected; reauthorization required");
                Err(CredentialError::ReauthorizationRequired { reason })
            }
            Err(error) => Err(CredentialError::RefreshFailed(error)),
        }
    }
}

// ============================================================================
// Background Refresh Loop
// ============================================================================

/// Keep the credential fresh until `shutdown` is cancelled.
///
/// Sleeps until the credential enters the refresh margin, refreshes with
/// backoff, and parks while there is no usable credential. Cancellation is
/// observed between attempts; an attempt already running completes and commits.
pub async fn run_refresh_loop(manager: CredentialManager, shutdown: CancellationToken) {
    let mut status = manager.subscribe_status();
    let margin = manager.config().refresh_margin;
    info!(margin_secs = margin.as_secs(), "Credential refresh loop started");
    let mut spacing = Duration::ZERO;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let state = status.borrow_and_update().clone();
        let expires_at = match state {
            AuthState::Authorized { expires_at } => expires_at,
            _ => {
                debug!(state = ?state, "No usable credential; waiting for authorization");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        let wake_in = (expires_at - Utc::now())
            .to_std()
            .ok()
            .and_then(|remaining| remaining.checked_sub(margin))
            .unwrap_or(Duration::ZERO)
            .max(spacing);

        if !wake_in.is_zero() {
            debug!(
                sleep_secs = wake_in.as_secs(),
                expires_at = %expires_at,
                "Sleeping until next refresh"
            );
            tokio::select! {
                _ = tokio::time::sleep(wake_in) => {}
                _ = shutdown.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        manager.refresh_with_retries(&shutdown).await;
        spacing = MIN_REFRESH_SPACING;
    }

    info!("Credential refresh loop stopped");
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
