//! # Payload Snapshots
//!
//! Debug aid that keeps the exact bytes of every delivery, verified or not,
//! in a local directory. Each capture is a `.payload` file plus a
//! `.meta.json` sidecar sharing the same time-ordered stem.
//!
//! Recording never fails the caller: errors and timeouts are logged and the
//! delivery carries on without a snapshot.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const SUFFIX_LEN: usize = 6;
const PAYLOAD_EXTENSION: &str = "payload";
const METADATA_EXTENSION: &str = "meta.json";

/// Default location of captured payloads.
pub const DEFAULT_SNAPSHOT_DIR: &str = "json/snapshots";

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    /// Bound on writing one snapshot
    pub write_timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// What is known about a delivery before it is verified.
#[derive(Debug, Clone, Default)]
pub struct SnapshotContext {
    /// Delivery id header, unverified
    pub event_id: Option<String>,
    pub platform_event_type: Option<String>,
}

/// Sidecar record written next to each payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub event_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub size_bytes: usize,
    pub platform_event_type: Option<String>,
}

/// A snapshot that has been fully written.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub event_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub storage_path: PathBuf,
    pub metadata_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot metadata could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("snapshot write exceeded {0:?}")]
    Timeout(Duration),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Writes raw deliveries to disk when enabled.
#[derive(Debug, Clone)]
pub struct SnapshotRecorder {
    config: SnapshotConfig,
}

impl SnapshotRecorder {
    pub fn new(config: SnapshotConfig) -> Self {
        Self { config }
    }

    pub fn disabled() -> Self {
        Self::new(SnapshotConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Capture `raw` if snapshots are enabled.
    ///
    /// Returns the written snapshot, or `None` when disabled or when the write
    /// failed (the failure is logged).
    pub async fn record(&self, raw: &Bytes, context: SnapshotContext) -> Option<Snapshot> {
        if !self.config.enabled {
            return None;
        }

        let captured_at = Utc::now();
        let stem = snapshot_stem(captured_at);
        let write = self.write(&stem, raw, context, captured_at);

        match tokio::time::timeout(self.config.write_timeout, write).await {
            Ok(Ok(snapshot)) => {
                debug!(
                    path = %snapshot.storage_path.display(),
                    event_id = ?snapshot.event_id,
                    "Payload snapshot written"
                );
                Some(snapshot)
            }
            Ok(Err(error)) => {
                warn!(stem = %stem, error = %error, "Payload snapshot failed");
                None
            }
            Err(_) => {
                let error = SnapshotError::Timeout(self.config.write_timeout);
                warn!(stem = %stem, error = %error, "Payload snapshot failed");
                None
            }
        }
    }

    async fn write(
        &self,
        stem: &str,
        raw: &Bytes,
        context: SnapshotContext,
        captured_at: DateTime<Utc>,
    ) -> Result<Snapshot, SnapshotError> {
        let directory = &self.config.directory;
        fs::create_dir_all(directory)
            .await
            .map_err(io_error(directory))?;

        let storage_path = directory.join(format!("{}.{}", stem, PAYLOAD_EXTENSION));
        let metadata_path = directory.join(format!("{}.{}", stem, METADATA_EXTENSION));

        let metadata = SnapshotMetadata {
            event_id: context.event_id,
            captured_at,
            size_bytes: raw.len(),
            platform_event_type: context.platform_event_type,
        };
        let metadata_json = serde_json::to_vec_pretty(&metadata)?;

        write_new_file(&storage_path, raw).await?;
        write_new_file(&metadata_path, &metadata_json).await?;

        Ok(Snapshot {
            event_id: metadata.event_id,
            captured_at,
            storage_path,
            metadata_path,
        })
    }
}

/// `20260101T120000.123456Z-a1B2c3`: sorts by capture time, suffix breaks ties.
fn snapshot_stem(captured_at: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}-{}", captured_at.format("%Y%m%dT%H%M%S%.6fZ"), suffix)
}

/// Write through a temporary name so the final file only ever appears complete.
async fn write_new_file(path: &Path, contents: &[u8]) -> Result<(), SnapshotError> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let result = async {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(io_error(&temp_path))?;
        file.write_all(contents)
            .await
            .map_err(io_error(&temp_path))?;
        file.flush().await.map_err(io_error(&temp_path))?;
        drop(file);
        fs::rename(&temp_path, path).await.map_err(io_error(path))
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
