//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Retry executor with exponential backoff, jitter and deadlines."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bulwark_common::{RetryConfig, RetryPolicy};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::aggregator::{BreakerSignal, ErrorAggregator};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::{Classifier, Failure};
use crate::metrics::ResilienceMetrics;
use crate::taxonomy::{keys, ClassifiedError, ErrorContext};

const TARGET: &str = "bulwark::resilience::retry";
const JITTER_RATIO: f64 = 0.1;

/// Per-call options for [`RetryExecutor::execute_with_retry`].
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Breaker guarding every attempt. Falls back to the `resource` context key.
    pub resource_key: Option<String>,
    /// Hard deadline for the whole call, backoff included.
    pub deadline: Option<Instant>,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, resource_key: impl Into<String>) -> Self {
        self.resource_key = Some(resource_key.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// Runs units of work under named retry policies.
pub struct RetryExecutor {
    policies: RetryConfig,
    classifier: Classifier,
    breakers: Arc<CircuitBreakerRegistry>,
    aggregator: Arc<ErrorAggregator>,
    rng: Mutex<StdRng>,
    metrics: Option<ResilienceMetrics>,
}

impl RetryExecutor {
    pub fn new(
        policies: RetryConfig,
        classifier: Classifier,
        breakers: Arc<CircuitBreakerRegistry>,
        aggregator: Arc<ErrorAggregator>,
        metrics: Option<ResilienceMetrics>,
    ) -> Self {
        Self {
            policies,
            classifier,
            breakers,
            aggregator,
            rng: Mutex::new(StdRng::from_entropy()),
            metrics,
        }
    }

    /// Seed the jitter RNG for deterministic testing.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Policy applied to `operation`; unknown names use the default policy.
    pub fn policy(&self, operation: &str) -> &RetryPolicy {
        self.policies.for_operation(operation)
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable category, or the
    /// policy's retries are exhausted. `attempt` receives the 1-based attempt number.
    ///
    /// When a resource key is known every attempt goes through that circuit breaker, so an
    /// open breaker ends the call with `CIRCUIT_OPEN` without running the work. Every failed
    /// attempt is reported to the aggregator once.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation: &str,
        context: ErrorContext,
        options: RetryOptions,
        mut attempt: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let policy = self.policy(operation);
        let resource = options
            .resource_key
            .clone()
            .or_else(|| context.resource().map(str::to_owned));
        let signal = if resource.is_some() {
            BreakerSignal::AlreadyRecorded
        } else {
            BreakerSignal::Forward
        };
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            let number = retries + 1;
            let attempt_context = context
                .clone()
                .with(keys::OPERATION, operation)
                .with(keys::ATTEMPT, number);
            let outcome = match resource.as_deref() {
                Some(key) => {
                    self.breakers
                        .execute(key, attempt_context.clone(), || {
                            bounded(options.deadline, attempt(number))
                        })
                        .await
                }
                None => bounded(options.deadline, attempt(number))
                    .await
                    .map_err(|err| self.classifier.classify(&err, attempt_context.clone())),
            };

            let error = match outcome {
                Ok(value) => {
                    self.record(operation, "success");
                    if retries > 0 {
                        info!(target: TARGET, operation, attempts = number, "operation recovered after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };
            self.aggregator.ingest(&error, signal);

            if error.is_circuit_open() {
                self.record(operation, "circuit_open");
                return Err(error);
            }
            if options.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                self.record(operation, "timeout");
                return Err(error);
            }
            if !policy.is_retryable(error.category()) {
                self.record(operation, "non_retryable");
                debug!(
                    target: TARGET,
                    operation,
                    code = error.code(),
                    category = %error.category(),
                    "failure is not retryable"
                );
                return Err(error);
            }

            let delay = self.backoff(policy, retries);
            if retries >= policy.max_retries {
                self.record(operation, "exhausted");
                warn!(
                    target: TARGET,
                    operation,
                    attempts = number,
                    code = error.code(),
                    correlation_id = %error.correlation_id(),
                    "retries exhausted"
                );
                return Err(error.with_retry_after(delay));
            }

            self.record(operation, "retry");
            if let Some(metrics) = &self.metrics {
                metrics.observe_backoff(operation, delay);
            }
            debug!(
                target: TARGET,
                operation,
                attempt = number,
                delay_ms = bulwark_common::time::duration_to_millis(delay),
                code = error.code(),
                "attempt failed; backing off"
            );

            match options.deadline {
                Some(deadline) => {
                    if timeout_at(deadline, sleep(delay)).await.is_err() {
                        let timeout = self.classifier.classify(
                            &Failure::timeout(started.elapsed()).into(),
                            attempt_context,
                        );
                        self.aggregator
                            .ingest(&timeout, BreakerSignal::AlreadyRecorded);
                        self.record(operation, "timeout");
                        warn!(target: TARGET, operation, attempts = number, "deadline elapsed during backoff");
                        return Err(timeout);
                    }
                }
                None => sleep(delay).await,
            }
            retries += 1;
        }
    }

    /// Backoff before retry `retries + 1`, with up to 10% jitter when enabled.
    fn backoff(&self, policy: &RetryPolicy, retries: u32) -> Duration {
        let base = policy.delay_for_attempt(retries);
        if !policy.jitter_enabled || base.is_zero() {
            return base;
        }
        let factor = self.rng.lock().gen_range(0.0..=JITTER_RATIO);
        base.saturating_add(base.mul_f64(factor))
    }

    fn record(&self, operation: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_retry(operation, outcome);
        }
    }
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

async fn bounded<T, Fut>(deadline: Option<Instant>, work: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    let Some(deadline) = deadline else {
        return work.await;
    };
    let started = Instant::now();
    match timeout_at(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(Failure::timeout(started.elapsed()).into()),
    }
}
