//! # PKCE Login Sessions
//!
//! Tracks in-progress authorization-code logins. Each login gets a random
//! `state` and a PKCE verifier; the verifier is handed back exactly once when
//! the platform redirects to the callback with the same `state`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::OAuthClient;

/// Number of random bytes behind a PKCE verifier (86 URL-safe characters).
const VERIFIER_BYTES: usize = 64;

const STATE_BYTES: usize = 16;

/// Generate a high-entropy PKCE code verifier.
pub fn generate_code_verifier() -> String {
    random_token(VERIFIER_BYTES)
}

/// Derive the S256 challenge for a verifier: base64url(sha256(verifier)) without padding.
pub fn code_challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A login that is waiting for its callback.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub authorization_url: String,
    pub state: String,
}

struct PendingLogin {
    verifier: Zeroizing<String>,
    created_at: Instant,
}

/// In-memory registry of pending logins, keyed by `state`.
pub struct LoginSessions {
    pending: Mutex<HashMap<String, PendingLogin>>,
    ttl: Duration,
}

impl LoginSessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Start a login: remember a fresh verifier and return the browser URL.
    pub async fn begin(&self, client: &OAuthClient) -> LoginRequest {
        let verifier = generate_code_verifier();
        let challenge = code_challenge_s256(&verifier);
        let state = random_token(STATE_BYTES);

        let mut pending = self.pending.lock().await;
        self.prune(&mut pending, Instant::now());
        pending.insert(
            state.clone(),
            PendingLogin {
                verifier: Zeroizing::new(verifier),
                created_at: Instant::now(),
            },
        );
        debug!(pending = pending.len(), "Login started");

        LoginRequest {
            authorization_url: client.authorization_url(&state, &challenge).to_string(),
            state,
        }
    }

    /// Consume the verifier for `state`. Unknown, reused or expired states yield `None`.
    pub async fn take_verifier(&self, state: &str) -> Option<Zeroizing<String>> {
        let mut pending = self.pending.lock().await;
        let login = pending.remove(state)?;

        if login.created_at.elapsed() > self.ttl {
            warn!("Login state expired before the callback arrived");
            return None;
        }

        Some(login.verifier)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn prune(&self, pending: &mut HashMap<String, PendingLogin>, now: Instant) {
        pending.retain(|_, login| now.duration_since(login.created_at) <= self.ttl);
    }
}

#[cfg(test)]
#[path = "login_tests.rs"]
mod tests;
