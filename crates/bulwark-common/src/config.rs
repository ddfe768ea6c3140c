//! ---
//! bw_section: "01-core-functionality"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Shared primitives and utilities for the resilience engine."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::taxonomy::{ErrorCategory, Severity};

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_true() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9464))
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8088))
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_volume_threshold() -> u32 {
    10
}

fn default_open_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_monitoring_window() -> Duration {
    Duration::from_secs(60)
}

fn default_excluded_categories() -> Vec<ErrorCategory> {
    vec![
        ErrorCategory::Validation,
        ErrorCategory::Authentication,
        ErrorCategory::Authorization,
    ]
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_non_retryable() -> Vec<ErrorCategory> {
    vec![
        ErrorCategory::Validation,
        ErrorCategory::Authentication,
        ErrorCategory::Authorization,
        ErrorCategory::BusinessLogic,
        ErrorCategory::Security,
    ]
}

fn default_history_capacity() -> usize {
    1000
}

fn default_recent_limit() -> usize {
    20
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(1000)
}

/// Primary configuration object for a Bulwark deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub breakers: BreakersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub chaos: ChaosConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "BULWARK_CONFIG";

    /// Load configuration from disk, respecting the `BULWARK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.breakers
            .defaults
            .validate()
            .context("invalid [breakers.defaults]")?;
        for (key, breaker) in &self.breakers.overrides {
            breaker
                .validate()
                .with_context(|| format!("invalid breaker override '{key}'"))?;
        }
        self.retry
            .default
            .validate()
            .context("invalid [retry.default]")?;
        for (name, policy) in &self.retry.policies {
            policy
                .validate()
                .with_context(|| format!("invalid retry policy '{name}'"))?;
        }
        self.aggregator.validate()?;
        self.chaos.validate()?;
        Ok(())
    }

    /// Render the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialise configuration")
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_api_listen(),
        }
    }
}

/// Thresholds for a single circuit breaker. Immutable once the breaker exists.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the monitoring window required to open.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Calls within the monitoring window required before the breaker may open.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u32,
    /// Time spent open before the next call is let through as a probe.
    #[serde(rename = "open_timeout_ms", default = "default_open_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub open_timeout: Duration,
    /// Span over which failure and volume counts stay current.
    #[serde(rename = "monitoring_window_ms", default = "default_monitoring_window")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub monitoring_window: Duration,
    /// Categories whose failures never count against the breaker.
    #[serde(default = "default_excluded_categories")]
    pub excluded_categories: Vec<ErrorCategory>,
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(anyhow!("failure_threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(anyhow!("success_threshold must be at least 1"));
        }
        if self.volume_threshold == 0 {
            return Err(anyhow!("volume_threshold must be at least 1"));
        }
        if self.monitoring_window.is_zero() {
            return Err(anyhow!("monitoring_window_ms must be positive"));
        }
        Ok(())
    }

    pub fn counts(&self, category: ErrorCategory) -> bool {
        !self.excluded_categories.contains(&category)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            volume_threshold: default_volume_threshold(),
            open_timeout: default_open_timeout(),
            monitoring_window: default_monitoring_window(),
            excluded_categories: default_excluded_categories(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakersConfig {
    #[serde(default)]
    pub defaults: BreakerConfig,
    #[serde(default)]
    pub overrides: IndexMap<String, BreakerConfig>,
}

impl BreakersConfig {
    /// Effective configuration for a resource key.
    pub fn for_key(&self, key: &str) -> BreakerConfig {
        self.overrides
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

/// Named backoff policy applied by the retry executor.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(rename = "base_delay_ms", default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter_enabled: bool,
    /// Categories that are propagated on first failure.
    #[serde(default = "default_non_retryable")]
    pub non_retryable: Vec<ErrorCategory>,
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(anyhow!("backoff_multiplier must be a finite value >= 1.0"));
        }
        if self.max_delay < self.base_delay {
            return Err(anyhow!("max_delay_ms must not be smaller than base_delay_ms"));
        }
        Ok(())
    }

    /// Whether failures of the category may be retried under this policy.
    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        !self.non_retryable.contains(&category)
    }

    /// Backoff before retry number `attempt + 1` (0-indexed), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let nanos = self.base_delay.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        if nanos < u64::MAX as f64 {
            return Duration::from_nanos(nanos.round() as u64);
        }
        Duration::try_from_secs_f64(nanos / 1e9).unwrap_or(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_enabled: true,
            non_retryable: default_non_retryable(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub default: RetryPolicy,
    #[serde(default)]
    pub policies: IndexMap<String, RetryPolicy>,
}

impl RetryConfig {
    /// Policy registered for the operation, or the default policy.
    pub fn for_operation(&self, operation: &str) -> &RetryPolicy {
        self.policies.get(operation).unwrap_or(&self.default)
    }
}

/// Per-severity bucket counts at which an alert fires. `None` disables alerting for the severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(default)]
    pub critical: Option<u64>,
    #[serde(default)]
    pub error: Option<u64>,
    #[serde(default)]
    pub warning: Option<u64>,
    #[serde(default)]
    pub info: Option<u64>,
    #[serde(default)]
    pub debug: Option<u64>,
}

impl AlertThresholds {
    pub fn for_severity(&self, severity: Severity) -> Option<u64> {
        match severity {
            Severity::Critical => self.critical,
            Severity::Error => self.error,
            Severity::Warning => self.warning,
            Severity::Info => self.info,
            Severity::Debug => self.debug,
        }
    }

    pub fn set(&mut self, severity: Severity, threshold: Option<u64>) {
        let slot = match severity {
            Severity::Critical => &mut self.critical,
            Severity::Error => &mut self.error,
            Severity::Warning => &mut self.warning,
            Severity::Info => &mut self.info,
            Severity::Debug => &mut self.debug,
        };
        *slot = threshold;
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            critical: Some(1),
            error: Some(10),
            warning: Some(50),
            info: None,
            debug: None,
        }
    }
}

/// Deduplication rule applied once a bucket has reached its threshold.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AlertPolicy {
    /// Alert when the count reaches the threshold; re-arm only after a reset.
    #[default]
    OncePerCrossing,
    /// Alert at the threshold and again on later errors once the cooldown has elapsed.
    Cooldown {
        #[serde(rename = "cooldown_ms")]
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        cooldown: Duration,
    },
    /// Alert on every error at or beyond the threshold.
    EveryError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Maximum classified errors retained in history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Maximum entries returned by statistics snapshots.
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
    #[serde(default)]
    pub alert_policy: AlertPolicy,
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            return Err(anyhow!("aggregator history_capacity must be at least 1"));
        }
        for severity in [
            Severity::Critical,
            Severity::Error,
            Severity::Warning,
            Severity::Info,
            Severity::Debug,
        ] {
            if self.alert_thresholds.for_severity(severity) == Some(0) {
                return Err(anyhow!(
                    "alert threshold for {severity} must be at least 1"
                ));
            }
        }
        Ok(())
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            recent_limit: default_recent_limit(),
            alert_thresholds: AlertThresholds::default(),
            alert_policy: AlertPolicy::default(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Endpoint receiving alert payloads as JSON. Alerts are only logged when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(rename = "webhook_timeout_ms", default = "default_webhook_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub webhook_timeout: Duration,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout: default_webhook_timeout(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Exposes the chaos control surface. Keep disabled outside test environments.
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "default_tick_interval_ms", default = "default_tick_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_tick_interval: Duration,
    /// Seed used by experiments that do not carry their own.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ChaosConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_tick_interval.is_zero() {
            return Err(anyhow!("chaos default_tick_interval_ms must be positive"));
        }
        Ok(())
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_tick_interval: default_tick_interval(),
            seed: None,
        }
    }
}
