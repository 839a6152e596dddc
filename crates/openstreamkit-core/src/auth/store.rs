//! # Token Store
//!
//! Durable, single-writer storage of the current [`Credential`].
//!
//! [`FileTokenStore`] persists the credential as JSON using write-temp, fsync,
//! rename. Readers are served from an in-memory snapshot that is swapped only
//! after the rename succeeds, so they observe either the old or the new
//! credential and never a partial write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{Credential, TokenStoreError};

/// Storage contract for the current credential.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Current credential, or [`TokenStoreError::NoCredential`] before the first login.
    async fn get(&self) -> Result<Credential, TokenStoreError>;

    /// Replace the current credential. Durable before returning.
    async fn put(&self, credential: Credential) -> Result<(), TokenStoreError>;

    /// Remove the current credential after revocation.
    async fn clear(&self) -> Result<(), TokenStoreError>;

    /// Finish pending writes and refuse further ones.
    async fn close(&self) -> Result<(), TokenStoreError>;

    /// Whether the current credential expires within `margin`.
    async fn is_expiring_soon(&self, margin: Duration) -> Result<bool, TokenStoreError> {
        Ok(self.get().await?.expires_within(margin, Utc::now()))
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// On-disk representation of a credential.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct PersistedCredential {
    access_token: String,
    refresh_token: String,
    #[zeroize(skip)]
    scope: BTreeSet<String>,
    #[zeroize(skip)]
    issued_at: DateTime<Utc>,
    #[zeroize(skip)]
    expires_at: DateTime<Utc>,
}

impl From<&Credential> for PersistedCredential {
    fn from(credential: &Credential) -> Self {
        Self {
            access_token: credential.access_token().to_string(),
            refresh_token: credential.refresh_token().to_string(),
            scope: credential.scope().clone(),
            issued_at: credential.issued_at(),
            expires_at: credential.expires_at(),
        }
    }
}

impl TryFrom<&PersistedCredential> for Credential {
    type Error = TokenStoreError;

    fn try_from(record: &PersistedCredential) -> Result<Self, Self::Error> {
        Ok(Credential::new(
            record.access_token.clone(),
            record.refresh_token.clone(),
            record.scope.clone(),
            record.issued_at,
            record.expires_at,
        )?)
    }
}

/// Token store persisted to a JSON file.
///
/// # Examples
///
/// ```no_run
/// use openstreamkit_core::auth::{FileTokenStore, TokenStore};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = FileTokenStore::open("json/token.json").await?;
/// if store.get().await.is_err() {
///     println!("not authorized yet");
/// }
/// # Ok(())
/// # }
/// ```
pub struct FileTokenStore {
    path: PathBuf,
    current: RwLock<Option<Credential>>,
    writer: Mutex<()>,
    closed: AtomicBool,
}

impl FileTokenStore {
    /// Open the store, loading the file if it exists.
    ///
    /// A missing file means "never authorized". An unreadable or corrupt file
    /// is a [`TokenStoreError::PersistenceFailure`]: the store refuses to
    /// start with a value it cannot trust.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, TokenStoreError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence_failure(parent, "create directory", e))?;
        }

        let current = match fs::read(&path).await {
            Ok(bytes) => {
                let record: PersistedCredential = serde_json::from_slice(&bytes).map_err(|e| {
                    TokenStoreError::PersistenceFailure {
                        message: format!("{} is not a valid credential: {}", path.display(), e),
                    }
                })?;
                let credential = Credential::try_from(&record)?;
                info!(
                    path = %path.display(),
                    expires_at = %credential.expires_at(),
                    "Loaded stored credential"
                );
                Some(credential)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No stored credential found");
                None
            }
            Err(e) => return Err(persistence_failure(&path, "read", e)),
        };

        Ok(Self {
            path,
            current: RwLock::new(current),
            writer: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "token.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn ensure_open(&self) -> Result<(), TokenStoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TokenStoreError::Closed);
        }
        Ok(())
    }

    async fn write_atomic(&self, bytes: &[u8]) -> Result<(), TokenStoreError> {
        let temp_path = self.temp_path();

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&temp_path)
            .await
            .map_err(|e| persistence_failure(&temp_path, "create temp file", e))?;

        file.write_all(bytes)
            .await
            .map_err(|e| persistence_failure(&temp_path, "write temp file", e))?;

        file.sync_all()
            .await
            .map_err(|e| persistence_failure(&temp_path, "sync temp file", e))?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(persistence_failure(&self.path, "rename temp file", e));
        }

        // The rename is already visible; a failed directory sync is only reported.
        if let Err(e) = self.sync_parent_dir().await {
            warn!(path = %self.path.display(), error = %e, "Token directory sync failed");
        }
        Ok(())
    }

    /// Flush the directory entry so the rename survives a power loss.
    #[cfg(unix)]
    async fn sync_parent_dir(&self) -> std::io::Result<()> {
        let parent = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        fs::File::open(&parent).await?.sync_all().await
    }

    #[cfg(not(unix))]
    async fn sync_parent_dir(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self) -> Result<Credential, TokenStoreError> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(TokenStoreError::NoCredential)
    }

    async fn put(&self, credential: Credential) -> Result<(), TokenStoreError> {
        let _guard = self.writer.lock().await;
        self.ensure_open()?;

        let record = PersistedCredential::from(&credential);
        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| {
            TokenStoreError::PersistenceFailure {
                message: format!("failed to serialize credential: {}", e),
            }
        })?;

        self.write_atomic(&bytes).await?;

        debug!(
            path = %self.path.display(),
            expires_at = %credential.expires_at(),
            "Persisted credential"
        );
        *self.current.write().await = Some(credential);
        Ok(())
    }

    async fn clear(&self) -> Result<(), TokenStoreError> {
        let _guard = self.writer.lock().await;
        self.ensure_open()?;

        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(persistence_failure(&self.path, "remove", e)),
        }

        *self.current.write().await = None;
        warn!(path = %self.path.display(), "Stored credential cleared");
        Ok(())
    }

    async fn close(&self) -> Result<(), TokenStoreError> {
        let _guard = self.writer.lock().await;
        self.closed.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "Token store closed");
        Ok(())
    }
}

fn persistence_failure(path: &Path, action: &str, error: std::io::Error) -> TokenStoreError {
    TokenStoreError::PersistenceFailure {
        message: format!("failed to {} {}: {}", action, path.display(), error),
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Non-durable token store for tests and ephemeral runs.
///
/// ```
/// use chrono::{Duration as ChronoDuration, Utc};
/// use openstreamkit_core::auth::{InMemoryTokenStore, TokenStore};
/// use openstreamkit_core::Credential;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryTokenStore::new();
/// let now = Utc::now();
/// let credential =
///     Credential::new("access", "refresh", Default::default(), now, now + ChronoDuration::hours(1))
///         .unwrap();
///
/// store.put(credential).await.unwrap();
/// assert!(!store.is_expiring_soon(Duration::from_secs(60)).await.unwrap());
/// # });
/// ```
#[derive(Default)]
pub struct InMemoryTokenStore {
    current: RwLock<Option<Credential>>,
    closed: AtomicBool,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            current: RwLock::new(Some(credential)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self) -> Result<Credential, TokenStoreError> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(TokenStoreError::NoCredential)
    }

    async fn put(&self, credential: Credential) -> Result<(), TokenStoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TokenStoreError::Closed);
        }
        *self.current.write().await = Some(credential);
        Ok(())
    }

    async fn clear(&self) -> Result<(), TokenStoreError> {
        *self.current.write().await = None;
        Ok(())
    }

    async fn close(&self) -> Result<(), TokenStoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
