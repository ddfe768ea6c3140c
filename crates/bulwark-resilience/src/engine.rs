//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Facade wiring classifier, breakers, aggregator, retries and chaos together."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use bulwark_common::{system_clock, AppConfig, SharedClock};
use tracing::info;

use crate::aggregator::{BreakerSignal, ErrorAggregator, ErrorStatistics, HealthStatus};
use crate::chaos::{ChaosExperimentConfig, ChaosHarness, ExperimentId, ExperimentSummary};
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use crate::classifier::Classifier;
use crate::metrics::ResilienceMetrics;
use crate::retry::{RetryExecutor, RetryOptions};
use crate::sink::{
    AlertSink, CompositeAlertSink, LogSink, TracingAlertSink, TracingLogSink, WebhookAlertSink,
};
use crate::taxonomy::{ClassifiedError, ErrorContext};

/// Builder for [`ResilienceEngine`].
#[derive(Debug)]
pub struct EngineBuilder {
    config: AppConfig,
    clock: SharedClock,
    alert_sink: Option<Arc<dyn AlertSink>>,
    log_sink: Arc<dyn LogSink>,
    metrics: Option<ResilienceMetrics>,
    retry_seed: Option<u64>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn metrics(mut self, metrics: ResilienceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Seed retry jitter for reproducible runs.
    pub fn retry_seed(mut self, seed: u64) -> Self {
        self.retry_seed = Some(seed);
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> Result<ResilienceEngine> {
        self.config.validate()?;
        let alert_sink = match self.alert_sink {
            Some(sink) => sink,
            None => default_alert_sink(&self.config)?,
        };

        let classifier = Classifier::new(self.clock.clone());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            self.config.breakers.clone(),
            classifier.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        ));
        let aggregator = Arc::new(ErrorAggregator::new(
            self.config.aggregator.clone(),
            classifier.clone(),
            breakers.clone(),
            alert_sink,
            self.log_sink,
            self.clock.clone(),
            self.metrics.clone(),
        ));
        let mut retry = RetryExecutor::new(
            self.config.retry.clone(),
            classifier.clone(),
            breakers.clone(),
            aggregator.clone(),
            self.metrics.clone(),
        );
        if let Some(seed) = self.retry_seed {
            retry = retry.with_seed(seed);
        }
        let chaos = ChaosHarness::new(
            aggregator.clone(),
            self.config.chaos.clone(),
            self.metrics.clone(),
        );

        info!(
            target: "bulwark::resilience",
            breaker_overrides = self.config.breakers.overrides.len(),
            retry_policies = self.config.retry.policies.len(),
            chaos_enabled = self.config.chaos.enabled,
            "resilience engine initialised"
        );

        Ok(ResilienceEngine {
            classifier,
            breakers,
            aggregator,
            retry,
            chaos,
        })
    }
}

fn default_alert_sink(config: &AppConfig) -> Result<Arc<dyn AlertSink>> {
    let Some(url) = &config.alerts.webhook_url else {
        return Ok(Arc::new(TracingAlertSink));
    };
    let webhook = WebhookAlertSink::new(url.clone(), config.alerts.webhook_timeout)?;
    Ok(Arc::new(CompositeAlertSink::new(vec![
        Arc::new(TracingAlertSink),
        Arc::new(webhook),
    ])))
}

/// One explicitly constructed engine instance, shared by callers as `Arc<ResilienceEngine>`.
#[derive(Debug)]
pub struct ResilienceEngine {
    classifier: Classifier,
    breakers: Arc<CircuitBreakerRegistry>,
    aggregator: Arc<ErrorAggregator>,
    retry: RetryExecutor,
    chaos: ChaosHarness,
}

impl ResilienceEngine {
    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: system_clock(),
            alert_sink: None,
            log_sink: Arc::new(TracingLogSink),
            metrics: None,
            retry_seed: None,
        }
    }

    /// Engine with tracing sinks, an optional webhook and the system clock.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::builder(config.clone()).build()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn aggregator(&self) -> &Arc<ErrorAggregator> {
        &self.aggregator
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn chaos(&self) -> &ChaosHarness {
        &self.chaos
    }

    pub fn classify(&self, failure: &anyhow::Error, context: ErrorContext) -> ClassifiedError {
        self.classifier.classify(failure, context)
    }

    /// Classify and record a failure raised outside the engine's executors.
    pub fn handle(&self, failure: &anyhow::Error, context: ErrorContext) -> ClassifiedError {
        self.aggregator.handle(failure, context)
    }

    /// Run `operation` behind the breaker for `key`; failures are also aggregated.
    pub async fn execute_with_circuit_breaker<T, F, Fut>(
        &self,
        key: &str,
        context: ErrorContext,
        operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let result = self.breakers.execute(key, context, operation).await;
        if let Err(error) = &result {
            self.aggregator.ingest(error, BreakerSignal::AlreadyRecorded);
        }
        result
    }

    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation: &str,
        context: ErrorContext,
        options: RetryOptions,
        attempt: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.retry
            .execute_with_retry(operation, context, options, attempt)
            .await
    }

    pub fn health(&self) -> HealthStatus {
        self.aggregator.get_health_status()
    }

    pub fn statistics(&self) -> ErrorStatistics {
        self.aggregator.get_statistics()
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    pub fn breaker_snapshot(&self, key: &str) -> Option<BreakerSnapshot> {
        self.breakers.snapshot(key)
    }

    pub fn reset_circuit_breaker(&self, key: &str) -> bool {
        self.breakers.reset(key)
    }

    pub fn reset_all_circuit_breakers(&self) -> usize {
        self.breakers.reset_all()
    }

    pub fn reset_statistics(&self) {
        self.aggregator.reset();
    }

    pub async fn start_experiment(&self, config: ChaosExperimentConfig) -> Result<ExperimentId> {
        self.chaos.start_experiment(config).await
    }

    pub async fn stop_experiment(&self, id: ExperimentId) -> Option<ExperimentSummary> {
        self.chaos.stop_experiment(id).await
    }

    /// Stop background work owned by the engine.
    pub async fn shutdown(&self) -> Vec<ExperimentSummary> {
        let stopped = self.chaos.shutdown().await;
        info!(
            target: "bulwark::resilience",
            experiments_stopped = stopped.len(),
            "resilience engine shut down"
        );
        stopped
    }
}
