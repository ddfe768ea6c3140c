//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Central error sink with bounded history, bucket counts, alerts and health."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bulwark_common::{AggregatorConfig, AlertPolicy, ErrorCategory, Severity, SharedClock};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::{error, info};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::Classifier;
use crate::metrics::ResilienceMetrics;
use crate::sink::{AlertPayload, AlertReason, AlertSink, LogSink};
use crate::taxonomy::{ClassifiedError, ErrorContext};

const TARGET: &str = "bulwark::resilience::aggregator";

/// Whether an ingested error still has to be reported to its circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerSignal {
    /// Forward qualifying failures to the breaker named by the `resource` context key.
    Forward,
    /// The failure was produced by a breaker-guarded call and has been counted already.
    AlreadyRecorded,
}

#[derive(Debug, Default, Clone)]
struct BucketState {
    count: u64,
    last_alert_at: Option<Instant>,
}

#[derive(Debug)]
struct AggregateState {
    history: VecDeque<ClassifiedError>,
    buckets: IndexMap<(ErrorCategory, Severity), BucketState>,
    total: u64,
    critical: u64,
    since: DateTime<Utc>,
}

impl AggregateState {
    fn new(capacity: usize, since: DateTime<Utc>) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            buckets: IndexMap::new(),
            total: 0,
            critical: 0,
            since,
        }
    }
}

/// Overall health derived from aggregate counts and breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub critical_count: u64,
    pub open_breaker_count: usize,
    pub half_open_breaker_count: usize,
    pub total_errors: u64,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthState::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketCount {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub count: u64,
}

/// Aggregate counters and recent history.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub critical_count: u64,
    pub by_category: BTreeMap<ErrorCategory, u64>,
    pub by_severity: IndexMap<Severity, u64>,
    pub buckets: Vec<BucketCount>,
    /// Most recent first.
    pub recent: Vec<ClassifiedError>,
    pub history_len: usize,
    pub history_capacity: usize,
    pub since: DateTime<Utc>,
}

/// Process-wide error sink.
///
/// Every ingested error is appended to a bounded history, counted in its
/// (category, severity) bucket, written to the log sink once, and may raise an alert.
/// Bookkeeping happens under one lock; sinks and breakers are called after it is released.
pub struct ErrorAggregator {
    config: AggregatorConfig,
    classifier: Classifier,
    breakers: Arc<CircuitBreakerRegistry>,
    alert_sink: Arc<dyn AlertSink>,
    log_sink: Arc<dyn LogSink>,
    clock: SharedClock,
    metrics: Option<ResilienceMetrics>,
    state: Mutex<AggregateState>,
}

impl ErrorAggregator {
    pub fn new(
        config: AggregatorConfig,
        classifier: Classifier,
        breakers: Arc<CircuitBreakerRegistry>,
        alert_sink: Arc<dyn AlertSink>,
        log_sink: Arc<dyn LogSink>,
        clock: SharedClock,
        metrics: Option<ResilienceMetrics>,
    ) -> Self {
        let state = AggregateState::new(config.history_capacity, clock.wall());
        Self {
            config,
            classifier,
            breakers,
            alert_sink,
            log_sink,
            clock,
            metrics,
            state: Mutex::new(state),
        }
    }

    /// Classify a raw failure and ingest it. Returns the classified record.
    pub fn handle(&self, failure: &anyhow::Error, context: ErrorContext) -> ClassifiedError {
        let classified = self.classifier.classify(failure, context);
        self.ingest(&classified, BreakerSignal::Forward);
        classified
    }

    /// Record an already classified error.
    pub fn ingest(&self, error: &ClassifiedError, signal: BreakerSignal) {
        let alert = self.record(error);

        self.log_sink.log_classified_error(error);
        if let Some(metrics) = &self.metrics {
            metrics.record_error(error.category(), error.severity());
        }

        if signal == BreakerSignal::Forward
            && error.category() == ErrorCategory::ExternalDependency
            && !error.is_circuit_open()
        {
            if let Some(resource) = error.resource() {
                self.breakers.record_failure(resource, error);
            }
        }

        if let Some(alert) = alert {
            if let Some(metrics) = &self.metrics {
                metrics.record_alert(alert.severity);
            }
            if let Err(err) = self.alert_sink.notify(&alert) {
                error!(
                    target: TARGET,
                    error = %err,
                    category = %alert.category,
                    severity = %alert.severity,
                    "alert delivery failed"
                );
            }
        }
    }

    fn record(&self, error: &ClassifiedError) -> Option<AlertPayload> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if self.config.history_capacity > 0 {
            while state.history.len() >= self.config.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(error.clone());
        }
        state.total += 1;
        if error.severity() == Severity::Critical {
            state.critical += 1;
        }

        let severity = error.severity();
        let threshold = self.config.alert_thresholds.for_severity(severity);
        let bucket = state
            .buckets
            .entry((error.category(), severity))
            .or_default();
        bucket.count += 1;

        let reason = alert_reason(self.config.alert_policy, threshold, bucket, severity, now)?;
        bucket.last_alert_at = Some(now);
        Some(AlertPayload {
            category: error.category(),
            severity,
            count: bucket.count,
            threshold,
            reason,
            raised_at: self.clock.wall(),
            error: error.clone(),
        })
    }

    /// Health derived from critical errors and breaker states.
    pub fn get_health_status(&self) -> HealthStatus {
        let (critical_count, total_errors) = {
            let state = self.state.lock();
            (state.critical, state.total)
        };
        let open_breaker_count = self.breakers.open_count();
        let half_open_breaker_count = self.breakers.half_open_count();
        let status = if critical_count > 0 || open_breaker_count > 0 {
            HealthState::Unhealthy
        } else if half_open_breaker_count > 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        HealthStatus {
            status,
            critical_count,
            open_breaker_count,
            half_open_breaker_count,
            total_errors,
            checked_at: self.clock.wall(),
        }
    }

    pub fn get_statistics(&self) -> ErrorStatistics {
        let state = self.state.lock();
        let mut by_category = BTreeMap::new();
        let mut by_severity: IndexMap<Severity, u64> =
            Severity::iter().map(|severity| (severity, 0)).collect();
        let mut buckets = Vec::with_capacity(state.buckets.len());
        for (&(category, severity), bucket) in &state.buckets {
            *by_category.entry(category).or_insert(0) += bucket.count;
            *by_severity.entry(severity).or_insert(0) += bucket.count;
            buckets.push(BucketCount {
                category,
                severity,
                count: bucket.count,
            });
        }
        ErrorStatistics {
            total_errors: state.total,
            critical_count: state.critical,
            by_category,
            by_severity,
            buckets,
            recent: state
                .history
                .iter()
                .rev()
                .take(self.config.recent_limit)
                .cloned()
                .collect(),
            history_len: state.history.len(),
            history_capacity: self.config.history_capacity,
            since: state.since,
        }
    }

    /// Count recorded for one bucket since the last reset.
    pub fn bucket_count(&self, category: ErrorCategory, severity: Severity) -> u64 {
        self.state
            .lock()
            .buckets
            .get(&(category, severity))
            .map_or(0, |bucket| bucket.count)
    }

    /// Retained history, oldest first.
    pub fn history(&self) -> Vec<ClassifiedError> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Clear history, counts and alert bookkeeping.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = AggregateState::new(self.config.history_capacity, self.clock.wall());
        info!(target: TARGET, "error statistics reset");
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }
}

impl fmt::Debug for ErrorAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorAggregator")
            .field("config", &self.config)
            .field("alert_sink", &self.alert_sink)
            .field("log_sink", &self.log_sink)
            .finish_non_exhaustive()
    }
}

fn alert_reason(
    policy: AlertPolicy,
    threshold: Option<u64>,
    bucket: &BucketState,
    severity: Severity,
    now: Instant,
) -> Option<AlertReason> {
    if severity == Severity::Critical && bucket.count == 1 {
        return Some(AlertReason::FirstCritical);
    }
    let threshold = threshold?;
    if bucket.count < threshold {
        return None;
    }
    if bucket.count == threshold {
        return Some(AlertReason::ThresholdReached);
    }
    match policy {
        AlertPolicy::OncePerCrossing => None,
        AlertPolicy::Cooldown { cooldown } => bucket
            .last_alert_at
            .map_or(true, |last| now.saturating_duration_since(last) >= cooldown)
            .then_some(AlertReason::Repeated),
        AlertPolicy::EveryError => Some(AlertReason::Repeated),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::classifier::Failure;
    use crate::sink::ChannelAlertSink;
    use crate::taxonomy::codes;
    use anyhow::anyhow;
    use bulwark_common::{AlertThresholds, BreakersConfig, ManualClock};
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Debug, Default)]
    struct RecordingLogSink {
        seen: Mutex<Vec<uuid::Uuid>>,
    }

    impl LogSink for RecordingLogSink {
        fn log_classified_error(&self, error: &ClassifiedError) {
            self.seen.lock().push(error.correlation_id());
        }
    }

    struct Fixture {
        clock: ManualClock,
        breakers: Arc<CircuitBreakerRegistry>,
        aggregator: ErrorAggregator,
        alerts: UnboundedReceiver<AlertPayload>,
        logs: Arc<RecordingLogSink>,
    }

    fn fixture(config: AggregatorConfig) -> Fixture {
        let clock = ManualClock::new();
        let classifier = Classifier::new(clock.shared());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            BreakersConfig::default(),
            classifier.clone(),
            clock.shared(),
            None,
        ));
        let (sink, alerts) = ChannelAlertSink::new();
        let logs = Arc::new(RecordingLogSink::default());
        let aggregator = ErrorAggregator::new(
            config,
            classifier,
            breakers.clone(),
            Arc::new(sink),
            logs.clone(),
            clock.shared(),
            None,
        );
        Fixture {
            clock,
            breakers,
            aggregator,
            alerts,
            logs,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<AlertPayload>) -> Vec<AlertPayload> {
        let mut out = Vec::new();
        while let Ok(alert) = rx.try_recv() {
            out.push(alert);
        }
        out
    }

    #[test]
    fn first_critical_error_alerts_immediately() {
        let mut fx = fixture(AggregatorConfig::default());
        fx.aggregator
            .handle(&anyhow!("CSRF token mismatch on /transfer"), ErrorContext::new());
        let alerts = drain(&mut fx.alerts);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].reason, AlertReason::FirstCritical);
        assert_eq!(alerts[0].severity, Severity::Critical);

        fx.aggregator
            .handle(&anyhow!("CSRF token mismatch on /transfer"), ErrorContext::new());
        assert!(drain(&mut fx.alerts).is_empty());
        assert!(fx.aggregator.get_health_status().is_unhealthy());
    }

    #[test]
    fn threshold_crossing_alerts_once() {
        let mut fx = fixture(AggregatorConfig::default());
        for _ in 0..9 {
            fx.aggregator
                .handle(&anyhow!("deadlock detected"), ErrorContext::new());
        }
        assert!(drain(&mut fx.alerts).is_empty());
        fx.aggregator
            .handle(&anyhow!("deadlock detected"), ErrorContext::new());
        let alerts = drain(&mut fx.alerts);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].reason, AlertReason::ThresholdReached);
        assert_eq!(alerts[0].count, 10);
        for _ in 0..20 {
            fx.aggregator
                .handle(&anyhow!("deadlock detected"), ErrorContext::new());
        }
        assert!(drain(&mut fx.alerts).is_empty());
        assert_eq!(
            fx.aggregator
                .bucket_count(ErrorCategory::Database, Severity::Error),
            30
        );
    }

    #[test]
    fn cooldown_policy_realerts_after_interval() {
        let config = AggregatorConfig {
            alert_policy: AlertPolicy::Cooldown {
                cooldown: Duration::from_secs(300),
            },
            ..AggregatorConfig::default()
        };
        let mut fx = fixture(config);
        for _ in 0..12 {
            fx.aggregator
                .handle(&anyhow!("deadlock detected"), ErrorContext::new());
        }
        assert_eq!(drain(&mut fx.alerts).len(), 1);
        fx.clock.advance(Duration::from_secs(301));
        fx.aggregator
            .handle(&anyhow!("deadlock detected"), ErrorContext::new());
        let alerts = drain(&mut fx.alerts);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].reason, AlertReason::Repeated);
    }

    #[test]
    fn history_is_bounded_and_recent_is_newest_first() {
        let config = AggregatorConfig {
            history_capacity: 5,
            recent_limit: 3,
            alert_thresholds: AlertThresholds {
                critical: None,
                error: None,
                warning: None,
                info: None,
                debug: None,
            },
            ..AggregatorConfig::default()
        };
        let fx = fixture(config);
        let mut last = None;
        for i in 0..8 {
            last = Some(
                fx.aggregator
                    .handle(&anyhow!("job {i} exploded"), ErrorContext::new()),
            );
        }
        let stats = fx.aggregator.get_statistics();
        assert_eq!(stats.history_len, 5);
        assert_eq!(stats.total_errors, 8);
        assert_eq!(stats.recent.len(), 3);
        assert_eq!(
            stats.recent[0].correlation_id(),
            last.unwrap().correlation_id()
        );
        assert_eq!(fx.aggregator.history()[0].message(), "job 3 exploded");
        assert_eq!(stats.by_category[&ErrorCategory::System], 8);
        assert_eq!(stats.by_severity[&Severity::Error], 8);
    }

    #[test]
    fn log_sink_sees_each_error_exactly_once() {
        let fx = fixture(AggregatorConfig::default());
        let a = fx
            .aggregator
            .handle(&Failure::status(404, "missing").into(), ErrorContext::new());
        let b = fx
            .aggregator
            .handle(&Failure::status(503, "down").into(), ErrorContext::new());
        assert_eq!(
            *fx.logs.seen.lock(),
            vec![a.correlation_id(), b.correlation_id()]
        );
    }

    #[test]
    fn external_dependency_errors_feed_breakers() {
        let fx = fixture(AggregatorConfig::default());
        let ctx = ErrorContext::new().with_resource("payments-api");
        for _ in 0..10 {
            fx.aggregator
                .handle(&Failure::status(503, "down").into(), ctx.clone());
        }
        assert_eq!(fx.breakers.open_count(), 1);
        let health = fx.aggregator.get_health_status();
        assert_eq!(health.status, HealthState::Unhealthy);
        assert_eq!(health.open_breaker_count, 1);
    }

    #[test]
    fn already_recorded_errors_are_not_forwarded() {
        let fx = fixture(AggregatorConfig::default());
        let classifier = Classifier::new(fx.clock.shared());
        for _ in 0..10 {
            let err = classifier.classify(
                &Failure::status(503, "down").into(),
                ErrorContext::new().with_resource("payments-api"),
            );
            fx.aggregator.ingest(&err, BreakerSignal::AlreadyRecorded);
        }
        assert_eq!(fx.breakers.open_count(), 0);
        assert!(fx.breakers.snapshot("payments-api").is_none());
    }

    #[test]
    fn half_open_breaker_degrades_health() {
        let fx = fixture(AggregatorConfig::default());
        for _ in 0..10 {
            fx.breakers
                .on_failure("search", ErrorCategory::ExternalDependency);
        }
        fx.clock.advance(Duration::from_secs(61));
        assert!(fx.breakers.can_execute("search"));
        assert_eq!(
            fx.aggregator.get_health_status().status,
            HealthState::Degraded
        );
    }

    #[test]
    fn reset_clears_counts_and_rearms_alerts() {
        let mut fx = fixture(AggregatorConfig::default());
        fx.aggregator
            .handle(&anyhow!("sql injection attempt blocked"), ErrorContext::new());
        assert_eq!(drain(&mut fx.alerts).len(), 1);
        fx.aggregator.reset();
        let stats = fx.aggregator.get_statistics();
        assert_eq!(stats.total_errors, 0);
        assert!(stats.recent.is_empty());
        assert_eq!(
            fx.aggregator.get_health_status().status,
            HealthState::Healthy
        );
        fx.aggregator
            .handle(&anyhow!("sql injection attempt blocked"), ErrorContext::new());
        assert_eq!(drain(&mut fx.alerts).len(), 1);
    }

    #[test]
    fn circuit_open_rejections_are_counted_but_not_forwarded() {
        let fx = fixture(AggregatorConfig::default());
        let rejection = Classifier::new(fx.clock.shared())
            .build(
                codes::CIRCUIT_OPEN,
                ErrorCategory::ExternalDependency,
                "open",
                ErrorContext::new().with_resource("ledger"),
            );
        for _ in 0..15 {
            fx.aggregator.ingest(&rejection, BreakerSignal::Forward);
        }
        assert_eq!(fx.aggregator.get_statistics().total_errors, 15);
        assert!(fx.breakers.snapshot("ledger").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ingestion_keeps_counts_exact() {
        let config = AggregatorConfig {
            history_capacity: 64,
            ..AggregatorConfig::default()
        };
        let fx = fixture(config);
        let mut alerts = fx.alerts;
        let logs = fx.logs;
        let aggregator = Arc::new(fx.aggregator);

        let workers = (0..8).map(|worker| {
            let aggregator = aggregator.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    aggregator.handle(
                        &anyhow!("deadlock detected in worker {worker} batch {i}"),
                        ErrorContext::new(),
                    );
                    tokio::task::yield_now().await;
                }
            })
        });
        for joined in futures::future::join_all(workers).await {
            joined.unwrap();
        }

        let stats = aggregator.get_statistics();
        assert_eq!(stats.total_errors, 200);
        assert_eq!(stats.buckets.len(), 1);
        assert_eq!(
            aggregator.bucket_count(ErrorCategory::Database, Severity::Error),
            200
        );
        assert_eq!(stats.by_category[&ErrorCategory::Database], 200);
        assert!(stats.history_len <= stats.history_capacity);
        assert_eq!(stats.history_len, 64);
        assert_eq!(logs.seen.lock().len(), 200);

        let alerts = drain(&mut alerts);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].reason, AlertReason::ThresholdReached);
        assert_eq!(alerts[0].count, 10);
    }
}
