//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Prometheus metrics published by the resilience engine."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use bulwark_common::{ErrorCategory, Severity};
use bulwark_metrics::SharedRegistry;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};

use crate::circuit_breaker::CircuitState;

/// Metrics published by the resilience engine.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    errors_total: IntCounterVec,
    breaker_transitions_total: IntCounterVec,
    breaker_rejections_total: IntCounterVec,
    breaker_open: IntGaugeVec,
    retry_attempts_total: IntCounterVec,
    retry_backoff_seconds: HistogramVec,
    alerts_total: IntCounterVec,
    chaos_failures_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let errors_total = IntCounterVec::new(
            Opts::new(
                "bulwark_errors_total",
                "Classified errors ingested by the aggregator",
            ),
            &["category", "severity"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let breaker_transitions_total = IntCounterVec::new(
            Opts::new(
                "bulwark_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["resource", "from", "to"],
        )?;
        registry.register(Box::new(breaker_transitions_total.clone()))?;

        let breaker_rejections_total = IntCounterVec::new(
            Opts::new(
                "bulwark_breaker_rejections_total",
                "Calls rejected because the breaker was open",
            ),
            &["resource"],
        )?;
        registry.register(Box::new(breaker_rejections_total.clone()))?;

        let breaker_open = IntGaugeVec::new(
            Opts::new("bulwark_breaker_open", "1 while the breaker is open"),
            &["resource"],
        )?;
        registry.register(Box::new(breaker_open.clone()))?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new(
                "bulwark_retry_attempts_total",
                "Retry executor attempt outcomes",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "bulwark_retry_backoff_seconds",
            "Backoff slept before a retry, jitter included",
        )
        .buckets(prometheus::exponential_buckets(0.01, 2.0, 12)?);
        let retry_backoff_seconds = HistogramVec::new(histogram_opts, &["operation"])?;
        registry.register(Box::new(retry_backoff_seconds.clone()))?;

        let alerts_total = IntCounterVec::new(
            Opts::new("bulwark_alerts_total", "Alerts raised by the aggregator"),
            &["severity"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;

        let chaos_failures_total = IntCounterVec::new(
            Opts::new(
                "bulwark_chaos_failures_total",
                "Synthetic failures injected by chaos experiments",
            ),
            &["kind", "category"],
        )?;
        registry.register(Box::new(chaos_failures_total.clone()))?;

        Ok(Self {
            registry,
            errors_total,
            breaker_transitions_total,
            breaker_rejections_total,
            breaker_open,
            retry_attempts_total,
            retry_backoff_seconds,
            alerts_total,
            chaos_failures_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_error(&self, category: ErrorCategory, severity: Severity) {
        self.errors_total
            .with_label_values(&[category.as_ref(), severity.as_ref()])
            .inc();
    }

    pub fn record_transition(&self, resource: &str, from: CircuitState, to: CircuitState) {
        self.breaker_transitions_total
            .with_label_values(&[resource, from.as_str(), to.as_str()])
            .inc();
        self.breaker_open
            .with_label_values(&[resource])
            .set(i64::from(to == CircuitState::Open));
    }

    pub fn record_rejection(&self, resource: &str) {
        self.breaker_rejections_total
            .with_label_values(&[resource])
            .inc();
    }

    /// Clear the open gauge after a manual reset.
    pub fn record_reset(&self, resource: &str) {
        self.breaker_open.with_label_values(&[resource]).set(0);
    }

    pub fn record_retry(&self, operation: &str, outcome: &str) {
        self.retry_attempts_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn observe_backoff(&self, operation: &str, delay: Duration) {
        self.retry_backoff_seconds
            .with_label_values(&[operation])
            .observe(delay.as_secs_f64());
    }

    pub fn record_alert(&self, severity: Severity) {
        self.alerts_total.with_label_values(&[severity.as_ref()]).inc();
    }

    pub fn record_chaos_failure(&self, kind: &str, category: ErrorCategory) {
        self.chaos_failures_total
            .with_label_values(&[kind, category.as_ref()])
            .inc();
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
