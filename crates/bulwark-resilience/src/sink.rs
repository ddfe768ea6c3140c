//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Alert and log sinks fed by the error aggregator."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bulwark_common::{ErrorCategory, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};

use crate::taxonomy::ClassifiedError;

const ALERT_TARGET: &str = "bulwark::resilience::alerts";
const LOG_TARGET: &str = "bulwark::resilience::aggregator";

/// Why an alert fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertReason {
    /// First critical error in its bucket.
    FirstCritical,
    ThresholdReached,
    /// Cooldown or every-error policy re-alerting past the threshold.
    Repeated,
}

/// Alert emitted when a (category, severity) bucket warrants attention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub count: u64,
    pub threshold: Option<u64>,
    pub reason: AlertReason,
    pub raised_at: DateTime<Utc>,
    /// The error that triggered the alert.
    pub error: ClassifiedError,
}

/// Receives alerts. Implementations must not block; delivery failures are logged by the caller.
pub trait AlertSink: Send + Sync + fmt::Debug {
    fn notify(&self, alert: &AlertPayload) -> Result<()>;
}

/// Receives every ingested classified error exactly once.
pub trait LogSink: Send + Sync + fmt::Debug {
    fn log_classified_error(&self, error: &ClassifiedError);
}

/// Writes every classified error to `tracing` at the level matching its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

macro_rules! log_error_at {
    ($level:expr, $err:expr) => {
        tracing::event!(
            target: LOG_TARGET,
            $level,
            code = %$err.code(),
            category = %$err.category(),
            severity = %$err.severity(),
            correlation_id = %$err.correlation_id(),
            resource = $err.resource().unwrap_or_default(),
            context = %$err.context().to_json(),
            "{}",
            $err.message()
        )
    };
}

impl LogSink for TracingLogSink {
    fn log_classified_error(&self, error: &ClassifiedError) {
        match error.severity() {
            Severity::Critical | Severity::Error => log_error_at!(Level::ERROR, error),
            Severity::Warning => log_error_at!(Level::WARN, error),
            Severity::Info => log_error_at!(Level::INFO, error),
            Severity::Debug => log_error_at!(Level::DEBUG, error),
        }
    }
}

/// Logs alerts through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: &AlertPayload) -> Result<()> {
        warn!(
            target: ALERT_TARGET,
            category = %alert.category,
            severity = %alert.severity,
            count = alert.count,
            threshold = ?alert.threshold,
            reason = ?alert.reason,
            correlation_id = %alert.error.correlation_id(),
            "error alert raised"
        );
        Ok(())
    }
}

/// Forwards alerts over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<AlertPayload>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn notify(&self, alert: &AlertPayload) -> Result<()> {
        self.tx
            .send(alert.clone())
            .map_err(|_| anyhow!("alert receiver dropped"))
    }
}

/// POSTs alerts as JSON to a webhook. Delivery runs on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl AlertSink for WebhookAlertSink {
    fn notify(&self, alert: &AlertPayload) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .context("webhook alerts require a running tokio runtime")?;
        let request = self.client.post(&self.url).json(alert);
        let url = self.url.clone();
        handle.spawn(async move {
            match request.send().await.and_then(|resp| resp.error_for_status()) {
                Ok(_) => debug!(target: ALERT_TARGET, %url, "alert delivered to webhook"),
                Err(err) => error!(target: ALERT_TARGET, %url, error = %err, "webhook alert delivery failed"),
            }
        });
        Ok(())
    }
}

/// Fans an alert out to several sinks. Every sink is tried; the first failure is returned.
#[derive(Debug, Clone, Default)]
pub struct CompositeAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl CompositeAlertSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

impl AlertSink for CompositeAlertSink {
    fn notify(&self, alert: &AlertPayload) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.notify(alert) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => {
                info!(target: ALERT_TARGET, sinks = self.sinks.len(), "alert dispatched");
                Ok(())
            }
        }
    }
}
