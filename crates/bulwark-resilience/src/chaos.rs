//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Chaos harness injecting synthetic failures through the aggregator."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bulwark_common::{ChaosConfig, ErrorCategory};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use strum::IntoEnumIterator;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::ErrorAggregator;
use crate::classifier::Failure;
use crate::metrics::ResilienceMetrics;
use crate::taxonomy::{keys, ClassifiedError, ErrorContext};

const TARGET: &str = "bulwark::resilience::chaos";
const DEFAULT_SEED: u64 = 0xC0FFEE;

pub type ExperimentId = Uuid;

/// Failure pattern generated on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentKind {
    /// One failure of a uniformly random target category.
    Random,
    /// One failure per tick, cycling through the target categories in order.
    Sequential,
    /// One to five failures of random target categories.
    Burst,
    /// A primary failure plus two to four correlated failures of the same category.
    Cascade,
}

impl ExperimentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentKind::Random => "random",
            ExperimentKind::Sequential => "sequential",
            ExperimentKind::Burst => "burst",
            ExperimentKind::Cascade => "cascade",
        }
    }
}

fn default_targets() -> Vec<ErrorCategory> {
    ErrorCategory::iter().collect()
}

fn default_probability() -> f64 {
    1.0
}

fn default_max_errors() -> u64 {
    100
}

fn default_duration() -> Duration {
    Duration::from_secs(60)
}

/// Declarative experiment definition, usually loaded from TOML.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosExperimentConfig {
    #[serde(rename = "type")]
    pub kind: ExperimentKind,
    #[serde(default = "default_targets")]
    pub target_categories: Vec<ErrorCategory>,
    #[serde(default = "default_probability")]
    pub probability_per_tick: f64,
    #[serde(default = "default_max_errors")]
    pub max_errors: u64,
    #[serde(rename = "duration_ms", default = "default_duration")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    /// Falls back to the harness default tick interval.
    #[serde(rename = "tick_interval_ms", default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub tick_interval: Option<Duration>,
    /// Optional seed to guarantee deterministic replay.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Breaker key attached to every synthetic failure.
    #[serde(default)]
    pub resource_key: Option<String>,
}

impl ChaosExperimentConfig {
    pub fn new(kind: ExperimentKind) -> Self {
        Self {
            kind,
            target_categories: default_targets(),
            probability_per_tick: default_probability(),
            max_errors: default_max_errors(),
            duration: default_duration(),
            tick_interval: None,
            seed: None,
            resource_key: None,
        }
    }

    /// Load an experiment from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).with_context(|| {
            format!(
                "unable to read chaos experiment {}",
                path.as_ref().display()
            )
        })?;
        contents.parse::<Self>()
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_categories.is_empty() {
            bail!("target_categories must not be empty");
        }
        if !(0.0..=1.0).contains(&self.probability_per_tick) {
            bail!("probability_per_tick must be within [0, 1]");
        }
        if self.max_errors == 0 {
            bail!("max_errors must be at least 1");
        }
        if self.duration.is_zero() {
            bail!("duration_ms must be greater than zero");
        }
        if self.tick_interval.is_some_and(|tick| tick.is_zero()) {
            bail!("tick_interval_ms must be greater than zero");
        }
        Ok(())
    }
}

impl std::str::FromStr for ChaosExperimentConfig {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let config = toml::from_str::<Self>(input).map_err(anyhow::Error::new)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxErrorsReached,
    DurationElapsed,
    Stopped,
    /// The experiment task did not finish cleanly.
    Aborted,
}

/// Final report of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub id: ExperimentId,
    pub kind: ExperimentKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub ticks: u64,
    pub generated: u64,
    pub by_category: BTreeMap<ErrorCategory, u64>,
    pub stop_reason: StopReason,
}

impl ExperimentSummary {
    fn aborted(id: ExperimentId, kind: ExperimentKind, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            started_at,
            ended_at: Utc::now(),
            ticks: 0,
            generated: 0,
            by_category: BTreeMap::new(),
            stop_reason: StopReason::Aborted,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentStatus {
    pub id: ExperimentId,
    pub kind: ExperimentKind,
    pub started_at: DateTime<Utc>,
    pub running: bool,
    pub summary: Option<ExperimentSummary>,
}

struct ExperimentEntry {
    kind: ExperimentKind,
    started_at: DateTime<Utc>,
    shutdown: Option<oneshot::Sender<()>>,
    summary: watch::Receiver<Option<ExperimentSummary>>,
    abort: AbortHandle,
}

impl ExperimentEntry {
    fn status(&self, id: ExperimentId) -> ExperimentStatus {
        let summary = self.summary.borrow().clone();
        ExperimentStatus {
            id,
            kind: self.kind,
            started_at: self.started_at,
            running: summary.is_none(),
            summary,
        }
    }
}

/// Drives chaos experiments as independent tokio tasks.
///
/// Entries are kept for the lifetime of the harness. The map lock is never
/// held across an await; callers wait on a per-experiment summary channel.
pub struct ChaosHarness {
    aggregator: Arc<ErrorAggregator>,
    settings: ChaosConfig,
    metrics: Option<ResilienceMetrics>,
    experiments: Mutex<HashMap<ExperimentId, ExperimentEntry>>,
}

impl ChaosHarness {
    pub fn new(
        aggregator: Arc<ErrorAggregator>,
        settings: ChaosConfig,
        metrics: Option<ResilienceMetrics>,
    ) -> Self {
        Self {
            aggregator,
            settings,
            metrics,
            experiments: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Validate `config` and spawn its tick loop.
    pub async fn start_experiment(&self, config: ChaosExperimentConfig) -> Result<ExperimentId> {
        config.validate()?;
        let id = Uuid::new_v4();
        let seed = config.seed.or(self.settings.seed).unwrap_or(DEFAULT_SEED);
        let tick = config
            .tick_interval
            .unwrap_or(self.settings.default_tick_interval);
        let started_at = Utc::now();
        let kind = config.kind;

        info!(
            target: TARGET,
            experiment = %id,
            kind = kind.as_str(),
            max_errors = config.max_errors,
            duration_ms = bulwark_common::time::duration_to_millis(config.duration),
            tick_ms = bulwark_common::time::duration_to_millis(tick),
            seed,
            "chaos experiment started"
        );

        let runner = ExperimentRunner {
            id,
            config,
            tick,
            started_at,
            aggregator: self.aggregator.clone(),
            metrics: self.metrics.clone(),
            rng: StdRng::seed_from_u64(seed),
            ticks: 0,
            generated: 0,
            sequence: 0,
            by_category: BTreeMap::new(),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (summary_tx, summary_rx) = watch::channel(None);
        let task = tokio::spawn(runner.run(shutdown_rx));
        let abort = task.abort_handle();
        tokio::spawn(async move {
            let summary = join_summary(id, kind, started_at, task).await;
            let _ = summary_tx.send(Some(summary));
        });

        self.experiments.lock().insert(
            id,
            ExperimentEntry {
                kind,
                started_at,
                shutdown: Some(shutdown_tx),
                summary: summary_rx,
                abort,
            },
        );
        Ok(id)
    }

    /// Stop an experiment and return its summary. Safe to call repeatedly; unknown ids yield `None`.
    pub async fn stop_experiment(&self, id: ExperimentId) -> Option<ExperimentSummary> {
        let summary = {
            let mut experiments = self.experiments.lock();
            let entry = experiments.get_mut(&id)?;
            if let Some(tx) = entry.shutdown.take() {
                let _ = tx.send(());
            }
            entry.summary.clone()
        };
        await_summary(summary).await
    }

    /// Wait for an experiment to terminate on its own.
    ///
    /// Cancelling the returned future leaves the experiment running and stoppable.
    pub async fn wait_for(&self, id: ExperimentId) -> Option<ExperimentSummary> {
        let summary = self.experiments.lock().get(&id)?.summary.clone();
        await_summary(summary).await
    }

    /// Status of every known experiment, newest first.
    pub async fn list_experiments(&self) -> Vec<ExperimentStatus> {
        let mut statuses: Vec<ExperimentStatus> = self
            .experiments
            .lock()
            .iter()
            .map(|(id, entry)| entry.status(*id))
            .collect();
        statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        statuses
    }

    /// Stop every running experiment.
    pub async fn shutdown(&self) -> Vec<ExperimentSummary> {
        let pending: Vec<_> = {
            let mut experiments = self.experiments.lock();
            experiments
                .values_mut()
                .filter(|entry| entry.summary.borrow().is_none())
                .map(|entry| {
                    if let Some(tx) = entry.shutdown.take() {
                        let _ = tx.send(());
                    }
                    entry.summary.clone()
                })
                .collect()
        };
        let mut summaries = Vec::with_capacity(pending.len());
        for summary in pending {
            if let Some(summary) = await_summary(summary).await {
                summaries.push(summary);
            }
        }
        summaries
    }
}

impl Drop for ChaosHarness {
    fn drop(&mut self) {
        for entry in self.experiments.get_mut().values() {
            entry.abort.abort();
        }
    }
}

impl std::fmt::Debug for ChaosHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosHarness")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

async fn await_summary(
    mut summary: watch::Receiver<Option<ExperimentSummary>>,
) -> Option<ExperimentSummary> {
    let ready = summary.wait_for(Option::is_some).await.ok()?;
    (*ready).clone()
}

async fn join_summary(
    id: ExperimentId,
    kind: ExperimentKind,
    started_at: DateTime<Utc>,
    task: JoinHandle<ExperimentSummary>,
) -> ExperimentSummary {
    match task.await {
        Ok(summary) => summary,
        Err(err) => {
            warn!(target: TARGET, experiment = %id, error = %err, "chaos experiment task failed");
            ExperimentSummary::aborted(id, kind, started_at)
        }
    }
}

struct ExperimentRunner {
    id: ExperimentId,
    config: ChaosExperimentConfig,
    tick: Duration,
    started_at: DateTime<Utc>,
    aggregator: Arc<ErrorAggregator>,
    metrics: Option<ResilienceMetrics>,
    rng: StdRng,
    ticks: u64,
    generated: u64,
    sequence: usize,
    by_category: BTreeMap<ErrorCategory, u64>,
}

impl ExperimentRunner {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> ExperimentSummary {
        let start = Instant::now();
        let deadline = sleep_until(start + self.config.duration);
        tokio::pin!(deadline);
        let mut ticker = interval_at(start + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stop_reason = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break StopReason::Stopped,
                _ = &mut deadline => break StopReason::DurationElapsed,
                _ = ticker.tick() => {
                    self.on_tick();
                    if self.generated >= self.config.max_errors {
                        break StopReason::MaxErrorsReached;
                    }
                }
            }
        };

        info!(
            target: TARGET,
            experiment = %self.id,
            ticks = self.ticks,
            generated = self.generated,
            reason = ?stop_reason,
            "chaos experiment finished"
        );
        ExperimentSummary {
            id: self.id,
            kind: self.config.kind,
            started_at: self.started_at,
            ended_at: Utc::now(),
            ticks: self.ticks,
            generated: self.generated,
            by_category: self.by_category,
            stop_reason,
        }
    }

    fn on_tick(&mut self) {
        self.ticks += 1;
        if !self.rng.gen_bool(self.config.probability_per_tick) {
            return;
        }
        match self.config.kind {
            ExperimentKind::Random => {
                let category = self.random_target();
                self.emit(category, None);
            }
            ExperimentKind::Sequential => {
                let targets = &self.config.target_categories;
                let category = targets[self.sequence % targets.len()];
                self.sequence += 1;
                self.emit(category, None);
            }
            ExperimentKind::Burst => {
                let count = self.rng.gen_range(1..=5);
                for _ in 0..count {
                    let category = self.random_target();
                    self.emit(category, None);
                }
            }
            ExperimentKind::Cascade => {
                let category = self.random_target();
                let Some(primary) = self.emit(category, None) else {
                    return;
                };
                let followers = self.rng.gen_range(2..=4);
                for _ in 0..followers {
                    self.emit(category, Some(&primary));
                }
            }
        }
    }

    fn random_target(&mut self) -> ErrorCategory {
        let index = self.rng.gen_range(0..self.config.target_categories.len());
        self.config.target_categories[index]
    }

    fn emit(
        &mut self,
        category: ErrorCategory,
        parent: Option<&ClassifiedError>,
    ) -> Option<ClassifiedError> {
        if self.generated >= self.config.max_errors {
            return None;
        }
        let mut context = ErrorContext::new()
            .with("chaos_experiment", self.id.to_string())
            .with("synthetic", true)
            .with("expected_category", category.as_ref());
        if let Some(resource) = &self.config.resource_key {
            context.insert(keys::RESOURCE, resource.clone());
        }
        if let Some(parent) = parent {
            context.insert("cascade_parent", parent.correlation_id().to_string());
        }

        let classified = self.aggregator.handle(&synthetic_failure(category), context);
        self.generated += 1;
        *self.by_category.entry(classified.category()).or_insert(0) += 1;
        if let Some(metrics) = &self.metrics {
            metrics.record_chaos_failure(self.config.kind.as_str(), classified.category());
        }
        Some(classified)
    }
}

/// A raw failure that the classifier maps back onto `category`.
pub fn synthetic_failure(category: ErrorCategory) -> anyhow::Error {
    match category {
        ErrorCategory::Validation => {
            Failure::status(400, "chaos: request payload rejected").into()
        }
        ErrorCategory::Authentication => Failure::status(401, "chaos: credentials expired").into(),
        ErrorCategory::Authorization => Failure::status(403, "chaos: role lacks access").into(),
        ErrorCategory::BusinessLogic => {
            Failure::status(409, "chaos: concurrent modification").into()
        }
        ErrorCategory::ExternalDependency => {
            Failure::status(503, "chaos: dependency unavailable").into()
        }
        ErrorCategory::Network => anyhow::Error::new(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "chaos: upstream refused connection",
        )),
        ErrorCategory::Database => anyhow!("chaos: database deadlock detected"),
        ErrorCategory::Performance => Failure::timeout(Duration::from_secs(30)).into(),
        ErrorCategory::Security => anyhow!("chaos: csrf token mismatch"),
        ErrorCategory::System => anyhow!("chaos: worker process crashed"),
    }
}
