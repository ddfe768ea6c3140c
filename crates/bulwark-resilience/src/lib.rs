//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Failure classification, circuit breakers, retries, aggregation and chaos tooling."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
//! Resilience engine for Bulwark.
//!
//! Raw failures are mapped onto the error taxonomy by the [`Classifier`], calls to
//! unreliable dependencies are guarded by the [`CircuitBreakerRegistry`], transient
//! failures are retried by the [`RetryExecutor`], and every classified error flows into
//! the [`ErrorAggregator`] for health reporting and alerting. The [`ChaosHarness`]
//! injects synthetic failures to exercise all of the above. [`ResilienceEngine`] wires
//! one instance of each together.

pub mod aggregator;
pub mod chaos;
pub mod circuit_breaker;
pub mod classifier;
pub mod engine;
pub mod metrics;
pub mod retry;
pub mod sink;
pub mod taxonomy;

pub use aggregator::{
    BreakerSignal, BucketCount, ErrorAggregator, ErrorStatistics, HealthState, HealthStatus,
};
pub use chaos::{
    synthetic_failure, ChaosExperimentConfig, ChaosHarness, ExperimentId, ExperimentKind,
    ExperimentStatus, ExperimentSummary, StopReason,
};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
pub use classifier::{Classifier, Failure};
pub use engine::{EngineBuilder, ResilienceEngine};
pub use metrics::ResilienceMetrics;
pub use retry::{RetryExecutor, RetryOptions};
pub use sink::{
    AlertPayload, AlertReason, AlertSink, ChannelAlertSink, CompositeAlertSink, LogSink,
    TracingAlertSink, TracingLogSink, WebhookAlertSink,
};
pub use taxonomy::{codes, friendly_message, keys, ClassifiedError, ErrorContext, PublicError};
