//! Integration tests for raw payload snapshots

mod common;

use bytes::Bytes;
use common::{chat_body, forged_request, pipeline, signed_request};
use openstreamkit_core::snapshot::{SnapshotConfig, SnapshotMetadata};
use openstreamkit_core::{HandlerRegistryBuilder, SnapshotRecorder};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn recorder(directory: &Path) -> SnapshotRecorder {
    SnapshotRecorder::new(SnapshotConfig {
        enabled: true,
        directory: directory.to_path_buf(),
        write_timeout: Duration::from_secs(5),
    })
}

fn files_with_suffix(directory: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(directory)
        .map(|entries| {
            entries
                .map(|entry| entry.unwrap().path())
                .filter(|path| path.to_string_lossy().ends_with(suffix))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

#[tokio::test]
async fn test_every_outcome_is_captured_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(HandlerRegistryBuilder::new(), recorder(dir.path()));
    let valid_body = chat_body("exact bytes \u{1F600}");
    let forged_body = Bytes::from_static(b"{\"content\":\"forged\",  \"spacing\" : true }");

    pipeline
        .process(signed_request("evt-1", "chat.message.sent", valid_body.clone()))
        .await;
    pipeline
        .process(signed_request("evt-1", "chat.message.sent", valid_body.clone()))
        .await;
    pipeline
        .process(forged_request("evt-2", "chat.message.sent", forged_body.clone()))
        .await;

    let payloads = files_with_suffix(dir.path(), ".payload");
    assert_eq!(payloads.len(), 3);
    let mut contents: Vec<Vec<u8>> = payloads
        .iter()
        .map(|p| std::fs::read(p).unwrap())
        .collect();
    contents.sort();
    let mut expected = vec![valid_body.to_vec(), valid_body.to_vec(), forged_body.to_vec()];
    expected.sort();
    assert_eq!(contents, expected);
}

#[tokio::test]
async fn test_metadata_names_the_unverified_event_id() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(HandlerRegistryBuilder::new(), recorder(dir.path()));
    let body = chat_body("hi");

    pipeline
        .process(forged_request("evt-7", "chat.message.sent", body.clone()))
        .await;

    let metadata_files = files_with_suffix(dir.path(), ".meta.json");
    assert_eq!(metadata_files.len(), 1);
    let metadata: SnapshotMetadata =
        serde_json::from_slice(&std::fs::read(&metadata_files[0]).unwrap()).unwrap();
    assert_eq!(metadata.event_id.as_deref(), Some("evt-7"));
    assert_eq!(metadata.size_bytes, body.len());
    assert_eq!(metadata.platform_event_type.as_deref(), Some("chat.message.sent"));
}

#[tokio::test]
async fn test_disabled_recorder_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("snapshots");
    let pipeline = pipeline(
        HandlerRegistryBuilder::new(),
        SnapshotRecorder::new(SnapshotConfig {
            enabled: false,
            directory: target.clone(),
            write_timeout: Duration::from_secs(5),
        }),
    );

    pipeline
        .process(signed_request("evt-1", "chat.message.sent", chat_body("hi")))
        .await;

    assert!(!target.exists());
}

#[tokio::test]
async fn test_unwritable_directory_does_not_block_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-directory");
    std::fs::write(&blocker, b"file in the way").unwrap();
    let pipeline = pipeline(HandlerRegistryBuilder::new(), recorder(&blocker));

    let outcome = pipeline
        .process(signed_request("evt-1", "chat.message.sent", chat_body("hi")))
        .await;

    assert_eq!(outcome.label(), "dispatched");
}
