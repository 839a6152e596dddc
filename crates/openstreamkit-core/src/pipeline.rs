//! # Ingress Pipeline
//!
//! The path every delivery takes: snapshot, verify, dispatch. Rejections are
//! resolved here and never reach a handler. Counters are kept per outcome for
//! health reporting.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::dispatch::{DispatchReport, EventDispatcher};
use crate::snapshot::{SnapshotContext, SnapshotRecorder};
use crate::webhook::{VerificationError, WebhookRequest, WebhookVerifier};

/// Result of pushing one delivery through the pipeline.
#[derive(Debug, Clone)]
pub enum IngressOutcome {
    Dispatched(DispatchReport),
    Rejected(VerificationError),
}

impl IngressOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IngressOutcome::Dispatched(_) => "dispatched",
            IngressOutcome::Rejected(error) => error.outcome_label(),
        }
    }
}

/// Running totals since process start.
#[derive(Debug, Default)]
pub struct IngressStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    invalid_signature: AtomicU64,
    malformed: AtomicU64,
    duplicate: AtomicU64,
    stale: AtomicU64,
    handler_failures: AtomicU64,
}

/// Point-in-time copy of [`IngressStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngressStatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub invalid_signature: u64,
    pub malformed: u64,
    pub duplicate: u64,
    pub stale: u64,
    pub handler_failures: u64,
}

impl IngressStats {
    pub fn snapshot(&self) -> IngressStatsSnapshot {
        IngressStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            invalid_signature: self.invalid_signature.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn record_rejection(&self, error: &VerificationError) {
        let counter = match error {
            VerificationError::InvalidSignature { .. } => &self.invalid_signature,
            VerificationError::MalformedPayload { .. } => &self.malformed,
            VerificationError::DuplicateEvent { .. } => &self.duplicate,
            VerificationError::StaleDelivery { .. } => &self.stale,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct IngressPipeline {
    snapshots: SnapshotRecorder,
    verifier: WebhookVerifier,
    dispatcher: EventDispatcher,
    stats: IngressStats,
}

impl IngressPipeline {
    pub fn new(
        snapshots: SnapshotRecorder,
        verifier: WebhookVerifier,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            snapshots,
            verifier,
            dispatcher,
            stats: IngressStats::default(),
        }
    }

    pub fn stats(&self) -> IngressStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn snapshots(&self) -> &SnapshotRecorder {
        &self.snapshots
    }

    /// Snapshot, verify and dispatch one delivery.
    pub async fn process(&self, request: WebhookRequest) -> IngressOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        self.snapshots
            .record(
                &request.body,
                SnapshotContext {
                    event_id: request.headers.message_id.clone(),
                    platform_event_type: request.headers.event_type.clone(),
                },
            )
            .await;

        let envelope = match self.verifier.verify(&request) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.stats.record_rejection(&error);
                if error.is_replay() {
                    info!(
                        message_id = ?request.headers.message_id,
                        outcome = error.outcome_label(),
                        "Replayed delivery ignored"
                    );
                } else {
                    warn!(
                        message_id = ?request.headers.message_id,
                        outcome = error.outcome_label(),
                        error = %error,
                        "Delivery rejected"
                    );
                }
                return IngressOutcome::Rejected(error);
            }
        };

        let report = self.dispatcher.dispatch(&envelope).await;
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        self.stats
            .handler_failures
            .fetch_add(report.failures.len() as u64, Ordering::Relaxed);

        info!(
            event_id = %report.event_id,
            event_type = %report.event_type,
            handlers = report.invoked,
            failures = report.failures.len(),
            "Event dispatched"
        );
        IngressOutcome::Dispatched(report)
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
