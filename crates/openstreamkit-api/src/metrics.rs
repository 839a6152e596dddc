//! Prometheus metrics for the API service.
//!
//! Each [`ServiceMetrics`] owns its registry, so several instances (one per
//! test, for example) never collide on metric names.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Service metrics for observability
#[derive(Debug)]
pub struct ServiceMetrics {
    registry: Registry,

    /// Deliveries by outcome (`dispatched`, `duplicate`, `invalid_signature`, ...)
    pub webhook_deliveries_total: IntCounterVec,
    pub webhook_processing_seconds: Histogram,
    pub handler_failures_total: IntCounter,

    /// 1 while a human has to log in again, else 0
    pub auth_reauthorization_required: IntGauge,
    pub login_callbacks_total: IntCounterVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let webhook_deliveries_total = IntCounterVec::new(
            Opts::new(
                "osk_webhook_deliveries_total",
                "Webhook deliveries received, by outcome",
            ),
            &["outcome"],
        )?;
        let webhook_processing_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "osk_webhook_processing_seconds",
                "Time from delivery receipt to acknowledgement",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let handler_failures_total = IntCounter::new(
            "osk_handler_failures_total",
            "Event handler invocations that failed or panicked",
        )?;
        let auth_reauthorization_required = IntGauge::new(
            "osk_auth_reauthorization_required",
            "Whether the stored credential needs a new login",
        )?;
        let login_callbacks_total = IntCounterVec::new(
            Opts::new("osk_login_callbacks_total", "OAuth callbacks, by result"),
            &["result"],
        )?;

        registry.register(Box::new(webhook_deliveries_total.clone()))?;
        registry.register(Box::new(webhook_processing_seconds.clone()))?;
        registry.register(Box::new(handler_failures_total.clone()))?;
        registry.register(Box::new(auth_reauthorization_required.clone()))?;
        registry.register(Box::new(login_callbacks_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            webhook_deliveries_total,
            webhook_processing_seconds,
            handler_failures_total,
            auth_reauthorization_required,
            login_callbacks_total,
        }))
    }

    pub fn record_delivery(&self, outcome: &str, handler_failures: usize) {
        self.webhook_deliveries_total
            .with_label_values(&[outcome])
            .inc();
        self.handler_failures_total.inc_by(handler_failures as u64);
    }

    /// Text exposition format, as served on `/metrics`.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
