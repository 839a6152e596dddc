//! # Delivery Signatures
//!
//! Authenticity checks for webhook deliveries. Every scheme signs the same
//! content, `"{message_id}.{timestamp}.{body}"`, so the id and send time are
//! bound to the body and cannot be swapped independently.
//!
//! | Validator | Signature header | Key material |
//! |-----------|------------------|--------------|
//! | [`KickRsaSignatureValidator`] | base64 RSASSA-PKCS1-v1_5 / SHA-256 | platform public key (PEM) |
//! | [`HmacSignatureValidator`] | hex HMAC-SHA256, optional `sha256=` prefix | shared secret |

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use serde::Deserialize;
use sha2::Sha256;
use std::path::Path;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{info, instrument};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Build the byte string a delivery signature covers.
pub fn signed_content(message_id: &str, timestamp: &str, body: &[u8]) -> Vec<u8> {
    let mut content = Vec::with_capacity(message_id.len() + timestamp.len() + body.len() + 2);
    content.extend_from_slice(message_id.as_bytes());
    content.push(b'.');
    content.extend_from_slice(timestamp.as_bytes());
    content.push(b'.');
    content.extend_from_slice(body);
    content
}

// ============================================================================
// Errors
// ============================================================================

/// Why a signature did not authenticate its content.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is not well formed: {message}")]
    Malformed { message: String },

    #[error("signature does not match the delivery")]
    Mismatch,
}

/// Failure to obtain usable key material.
#[derive(Debug, thiserror::Error)]
pub enum SignatureKeyError {
    #[error("public key is not a valid RSA key: {message}")]
    InvalidKey { message: String },

    #[error("could not read key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not fetch platform public key: {message}")]
    Fetch { message: String },
}

// ============================================================================
// Validator Trait
// ============================================================================

/// Checks a delivery signature over already-assembled signed content.
///
/// Verification is CPU-only, so the trait is synchronous and can be called
/// while holding no locks.
pub trait SignatureValidator: Send + Sync {
    /// Short scheme name for logs and metrics.
    fn scheme(&self) -> &'static str;

    fn verify(&self, signed_content: &[u8], signature: &str) -> Result<(), SignatureError>;
}

// ============================================================================
// RSA (platform key)
// ============================================================================

/// Verifies signatures made with the platform's RSA private key.
#[derive(Clone)]
pub struct KickRsaSignatureValidator {
    key: VerifyingKey<Sha256>,
}

impl KickRsaSignatureValidator {
    /// Parse a PEM public key. Both SPKI (`BEGIN PUBLIC KEY`) and PKCS#1
    /// (`BEGIN RSA PUBLIC KEY`) encodings are accepted.
    pub fn from_pem(pem: &str) -> Result<Self, SignatureKeyError> {
        let pem = pem.trim();
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|spki_error| {
                RsaPublicKey::from_pkcs1_pem(pem).map_err(|_| spki_error.to_string())
            })
            .map_err(|message| SignatureKeyError::InvalidKey { message })?;

        Ok(Self {
            key: VerifyingKey::<Sha256>::new(public_key),
        })
    }

    pub async fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, SignatureKeyError> {
        let path = path.as_ref();
        let pem = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SignatureKeyError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_pem(&pem)
    }
}

impl SignatureValidator for KickRsaSignatureValidator {
    fn scheme(&self) -> &'static str {
        "rsa-sha256"
    }

    fn verify(&self, signed_content: &[u8], signature: &str) -> Result<(), SignatureError> {
        let raw = STANDARD
            .decode(signature.trim())
            .map_err(|e| SignatureError::Malformed {
                message: format!("invalid base64: {}", e),
            })?;
        let signature = Signature::try_from(raw.as_slice()).map_err(|e| {
            SignatureError::Malformed {
                message: e.to_string(),
            }
        })?;

        self.key
            .verify(signed_content, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

impl std::fmt::Debug for KickRsaSignatureValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KickRsaSignatureValidator").finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct PublicKeyResponse {
    data: PublicKeyData,
}

#[derive(Deserialize)]
struct PublicKeyData {
    public_key: String,
}

/// Download the platform's webhook signing key from `{api_base}/public/v1/public-key`.
#[instrument(skip(http))]
pub async fn fetch_kick_public_key(
    http: &reqwest::Client,
    api_base: &str,
    timeout: Duration,
) -> Result<KickRsaSignatureValidator, SignatureKeyError> {
    let url = format!("{}/public/v1/public-key", api_base.trim_end_matches('/'));
    let response = http
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| SignatureKeyError::Fetch {
            message: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(SignatureKeyError::Fetch {
            message: format!("public key endpoint returned {}", status),
        });
    }

    let body: PublicKeyResponse = response.json().await.map_err(|e| SignatureKeyError::Fetch {
        message: format!("unexpected public key response: {}", e),
    })?;

    let validator = KickRsaSignatureValidator::from_pem(&body.data.public_key)?;
    info!(url = %url, "Fetched platform webhook public key");
    Ok(validator)
}

// ============================================================================
// HMAC (shared secret)
// ============================================================================

/// Verifies hex HMAC-SHA256 signatures keyed by a shared secret.
pub struct HmacSignatureValidator {
    secret: Zeroizing<Vec<u8>>,
}

impl HmacSignatureValidator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }

    /// Produce the hex signature for `signed_content`. Used by relays and tests.
    pub fn sign(&self, signed_content: &[u8]) -> String {
        hex::encode(self.digest(signed_content))
    }

    fn digest(&self, signed_content: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length, so construction cannot fail.
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(signed_content);
        mac.finalize().into_bytes().to_vec()
    }
}

impl SignatureValidator for HmacSignatureValidator {
    fn scheme(&self) -> &'static str {
        "hmac-sha256"
    }

    fn verify(&self, signed_content: &[u8], signature: &str) -> Result<(), SignatureError> {
        let signature = signature.trim();
        let hex_digest = signature.strip_prefix("sha256=").unwrap_or(signature);
        let provided = hex::decode(hex_digest).map_err(|e| SignatureError::Malformed {
            message: format!("invalid hex: {}", e),
        })?;

        let expected = self.digest(signed_content);
        if expected.is_empty() || provided.len() != expected.len() {
            return Err(SignatureError::Mismatch);
        }

        if bool::from(expected.ct_eq(&provided)) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

impl std::fmt::Debug for HmacSignatureValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSignatureValidator")
            .field("secret", &"<REDACTED>")
            .finish()
    }
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;
