//! ---
//! bw_section: "01-core-functionality"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Shared primitives and utilities for the resilience engine."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
//! Core shared primitives for the Bulwark workspace.
//! This crate exposes the error taxonomy, configuration loading, logging
//! initialisation and the clock abstraction consumed across the workspace.

pub mod config;
pub mod logging;
pub mod taxonomy;
pub mod time;

pub use config::{
    AggregatorConfig, AlertPolicy, AlertThresholds, AlertsConfig, ApiConfig, AppConfig,
    BreakerConfig, BreakersConfig, ChaosConfig, LoggingConfig, MetricsConfig, RetryConfig,
    RetryPolicy,
};
pub use logging::{init_tracing, LogFormat};
pub use taxonomy::{ErrorCategory, Severity};
pub use time::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
