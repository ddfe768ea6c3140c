//! ---
//! bw_section: "07-resilience-fault-tolerance"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Keyed circuit breakers guarding external dependencies."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bulwark_common::{BreakerConfig, BreakersConfig, ErrorCategory, SharedClock};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::metrics::ResilienceMetrics;
use crate::taxonomy::{codes, ClassifiedError, ErrorContext};

const TARGET: &str = "bulwark::resilience::breaker";

/// Breaker state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Lower-case label used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

enum Admission {
    Allowed(Option<Transition>),
    Rejected { retry_after: Duration },
}

/// Per-key breaker state. Only touched while its mutex is held.
#[derive(Debug)]
struct BreakerState {
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    request_count: u32,
    window_start: Instant,
    next_attempt: Option<Instant>,
    rejected_total: u64,
}

impl BreakerState {
    fn new(config: BreakerConfig, now: Instant) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            request_count: 0,
            window_start: now,
            next_attempt: None,
            rejected_total: 0,
        }
    }

    fn roll_window(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= self.config.monitoring_window {
            self.failure_count = 0;
            self.request_count = 0;
            self.window_start = now;
        }
    }

    fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Admission::Allowed(None),
            CircuitState::Open => match self.next_attempt {
                Some(next) if now < next => {
                    self.rejected_total += 1;
                    Admission::Rejected {
                        retry_after: next - now,
                    }
                }
                _ => Admission::Allowed(Some(self.half_open())),
            },
        }
    }

    fn record_success(&mut self, now: Instant) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.roll_window(now);
                self.request_count = self.request_count.saturating_add(1);
                self.failure_count = self.failure_count.saturating_sub(1);
                self.should_trip().then(|| self.open(now))
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                (self.success_count >= self.config.success_threshold).then(|| self.close(now))
            }
            // Late completion of a call admitted before the breaker opened.
            CircuitState::Open => None,
        }
    }

    fn record_failure(&mut self, now: Instant) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.roll_window(now);
                self.request_count = self.request_count.saturating_add(1);
                self.failure_count = self.failure_count.saturating_add(1);
                self.should_trip().then(|| self.open(now))
            }
            CircuitState::HalfOpen => Some(self.open(now)),
            CircuitState::Open => None,
        }
    }

    /// Evaluated after every counted request, success or failure.
    fn should_trip(&self) -> bool {
        self.request_count >= self.config.volume_threshold
            && self.failure_count >= self.config.failure_threshold
    }

    fn open(&mut self, now: Instant) -> Transition {
        let from = self.state;
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.next_attempt = Some(now + self.config.open_timeout);
        Transition {
            from,
            to: CircuitState::Open,
        }
    }

    fn half_open(&mut self) -> Transition {
        let from = self.state;
        self.state = CircuitState::HalfOpen;
        self.success_count = 0;
        Transition {
            from,
            to: CircuitState::HalfOpen,
        }
    }

    fn close(&mut self, now: Instant) -> Transition {
        let from = self.state;
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.request_count = 0;
        self.window_start = now;
        self.next_attempt = None;
        Transition {
            from,
            to: CircuitState::Closed,
        }
    }

    fn reset(&mut self, now: Instant) -> Option<Transition> {
        let from = self.state;
        self.close(now);
        (from != CircuitState::Closed).then_some(Transition {
            from,
            to: CircuitState::Closed,
        })
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub request_count: u32,
    pub window_started_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub rejected_total: u64,
    pub config: BreakerConfig,
}

/// Registry of circuit breakers keyed by resource.
///
/// Breakers are created lazily on first use and live for the lifetime of the registry.
/// Every read-modify-write of a breaker happens under its own mutex, and no lock is held
/// while a guarded operation runs.
pub struct CircuitBreakerRegistry {
    config: BreakersConfig,
    breakers: RwLock<HashMap<String, Arc<Mutex<BreakerState>>>>,
    classifier: Classifier,
    clock: SharedClock,
    metrics: Option<ResilienceMetrics>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        config: BreakersConfig,
        classifier: Classifier,
        clock: SharedClock,
        metrics: Option<ResilienceMetrics>,
    ) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            classifier,
            clock,
            metrics,
        }
    }

    fn entry(&self, key: &str, config: Option<BreakerConfig>) -> Arc<Mutex<BreakerState>> {
        if let Some(existing) = self.breakers.read().get(key) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(key.to_owned())
            .or_insert_with(|| {
                let config = config.unwrap_or_else(|| self.config.for_key(key));
                debug!(target: TARGET, resource = key, "circuit breaker created");
                Arc::new(Mutex::new(BreakerState::new(config, self.clock.now())))
            })
            .clone()
    }

    /// Return the breaker for `key`, creating it with `config` (or the configured
    /// override/defaults) if it does not exist. An existing breaker keeps its config.
    pub fn get_or_create(&self, key: &str, config: Option<BreakerConfig>) -> BreakerSnapshot {
        let entry = self.entry(key, config);
        let state = entry.lock();
        self.snapshot_of(key, &state)
    }

    /// Whether a call may proceed. Moves an expired OPEN breaker to HALF_OPEN.
    pub fn can_execute(&self, key: &str) -> bool {
        self.acquire(key, ErrorContext::new()).is_ok()
    }

    /// Admit a call or build the `CIRCUIT_OPEN` rejection for it.
    pub fn acquire(&self, key: &str, context: ErrorContext) -> Result<(), ClassifiedError> {
        let entry = self.entry(key, None);
        let admission = entry.lock().admit(self.clock.now());
        match admission {
            Admission::Allowed(transition) => {
                self.publish(key, transition);
                Ok(())
            }
            Admission::Rejected { retry_after } => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_rejection(key);
                }
                debug!(
                    target: TARGET,
                    resource = key,
                    retry_after_ms = bulwark_common::time::duration_to_millis(retry_after),
                    "call rejected by open circuit"
                );
                Err(self.rejection(key, context, retry_after))
            }
        }
    }

    fn rejection(&self, key: &str, context: ErrorContext, retry_after: Duration) -> ClassifiedError {
        self.classifier
            .build(
                codes::CIRCUIT_OPEN,
                ErrorCategory::ExternalDependency,
                format!("circuit breaker for '{key}' is open"),
                context.with_resource(key),
            )
            .with_retry_after(retry_after)
    }

    /// Record a successful call.
    pub fn on_success(&self, key: &str) {
        let entry = self.entry(key, None);
        let transition = entry.lock().record_success(self.clock.now());
        self.publish(key, transition);
    }

    /// Record a failed call. Returns `false` when the category is excluded for this breaker.
    pub fn on_failure(&self, key: &str, category: ErrorCategory) -> bool {
        let entry = self.entry(key, None);
        let (counted, transition) = {
            let mut state = entry.lock();
            if state.config.counts(category) {
                (true, state.record_failure(self.clock.now()))
            } else {
                (false, None)
            }
        };
        self.publish(key, transition);
        counted
    }

    /// Record a classified failure. Rejections raised by a breaker never count.
    pub fn record_failure(&self, key: &str, error: &ClassifiedError) -> bool {
        if error.is_circuit_open() {
            return false;
        }
        self.on_failure(key, error.category())
    }

    /// Run `operation` behind the breaker for `key`.
    ///
    /// Rejected calls never invoke `operation`. Failures are classified with `context`
    /// (plus the resource key) and counted against the breaker.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        context: ErrorContext,
        operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.acquire(key, context.clone())?;
        match operation().await {
            Ok(value) => {
                self.on_success(key);
                Ok(value)
            }
            Err(err) => {
                let classified = self.classifier.classify(&err, context.with_resource(key));
                self.record_failure(key, &classified);
                Err(classified)
            }
        }
    }

    /// Force the breaker back to CLOSED with cleared counters.
    pub fn reset(&self, key: &str) -> bool {
        let Some(entry) = self.breakers.read().get(key).cloned() else {
            return false;
        };
        let transition = entry.lock().reset(self.clock.now());
        if let Some(metrics) = &self.metrics {
            metrics.record_reset(key);
        }
        info!(target: TARGET, resource = key, "circuit breaker reset");
        self.publish(key, transition);
        true
    }

    pub fn reset_all(&self) -> usize {
        let keys: Vec<String> = self.breakers.read().keys().cloned().collect();
        keys.iter().filter(|key| self.reset(key)).count()
    }

    pub fn snapshot(&self, key: &str) -> Option<BreakerSnapshot> {
        let entry = self.breakers.read().get(key).cloned()?;
        let state = entry.lock();
        Some(self.snapshot_of(key, &state))
    }

    /// Snapshots of every breaker, sorted by key.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let entries: Vec<(String, Arc<Mutex<BreakerState>>)> = self
            .breakers
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        let mut snapshots: Vec<BreakerSnapshot> = entries
            .iter()
            .map(|(key, entry)| self.snapshot_of(key, &entry.lock()))
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub fn state(&self, key: &str) -> Option<CircuitState> {
        let entry = self.breakers.read().get(key).cloned()?;
        let state = entry.lock().state;
        Some(state)
    }

    fn count_in(&self, wanted: CircuitState) -> usize {
        let entries: Vec<Arc<Mutex<BreakerState>>> =
            self.breakers.read().values().cloned().collect();
        entries
            .iter()
            .filter(|entry| entry.lock().state == wanted)
            .count()
    }

    pub fn open_count(&self) -> usize {
        self.count_in(CircuitState::Open)
    }

    pub fn half_open_count(&self) -> usize {
        self.count_in(CircuitState::HalfOpen)
    }

    fn snapshot_of(&self, key: &str, state: &BreakerState) -> BreakerSnapshot {
        BreakerSnapshot {
            key: key.to_owned(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            request_count: state.request_count,
            window_started_at: self.clock.wall_at(state.window_start),
            next_attempt_at: state.next_attempt.map(|next| self.clock.wall_at(next)),
            rejected_total: state.rejected_total,
            config: state.config.clone(),
        }
    }

    fn publish(&self, key: &str, transition: Option<Transition>) {
        let Some(Transition { from, to }) = transition else {
            return;
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(key, from, to);
        }
        match to {
            CircuitState::Open => warn!(
                target: TARGET,
                resource = key,
                from = %from,
                to = %to,
                "circuit breaker opened"
            ),
            _ => info!(
                target: TARGET,
                resource = key,
                from = %from,
                to = %to,
                "circuit breaker state changed"
            ),
        }
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use bulwark_common::{Clock, ManualClock};

    use crate::classifier::Failure;

    fn registry(clock: &ManualClock) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(
            BreakersConfig::default(),
            Classifier::new(clock.shared()),
            clock.shared(),
            None,
        )
    }

    fn unavailable() -> anyhow::Error {
        Failure::status(503, "upstream unavailable").into()
    }

    #[test]
    fn opens_only_after_volume_threshold() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..9 {
            breakers.on_failure("payments-api", ErrorCategory::ExternalDependency);
        }
        assert_eq!(breakers.state("payments-api"), Some(CircuitState::Closed));
        breakers.on_failure("payments-api", ErrorCategory::ExternalDependency);
        assert_eq!(breakers.state("payments-api"), Some(CircuitState::Open));
    }

    #[test]
    fn successes_decay_the_failure_count() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        breakers.on_failure("inventory", ErrorCategory::Network);
        breakers.on_failure("inventory", ErrorCategory::Network);
        breakers.on_success("inventory");
        let snapshot = breakers.snapshot("inventory").unwrap();
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.request_count, 3);
        breakers.on_success("inventory");
        breakers.on_success("inventory");
        assert_eq!(breakers.snapshot("inventory").unwrap().failure_count, 0);
    }

    #[test]
    fn success_that_reaches_volume_threshold_still_trips() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..3 {
            breakers.on_success("orders");
        }
        for _ in 0..6 {
            breakers.on_failure("orders", ErrorCategory::ExternalDependency);
        }
        assert_eq!(breakers.state("orders"), Some(CircuitState::Closed));

        breakers.on_success("orders");
        let snapshot = breakers.snapshot("orders").unwrap();
        assert_eq!(snapshot.request_count, 10);
        assert_eq!(snapshot.failure_count, 5);
        assert_eq!(snapshot.state, CircuitState::Open);
        assert!(!breakers.can_execute("orders"));
    }

    #[test]
    fn stale_window_resets_counters() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..8 {
            breakers.on_failure("search", ErrorCategory::ExternalDependency);
        }
        clock.advance(Duration::from_secs(61));
        breakers.on_failure("search", ErrorCategory::ExternalDependency);
        let snapshot = breakers.snapshot("search").unwrap();
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[test]
    fn excluded_categories_do_not_count() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..20 {
            assert!(!breakers.on_failure("profile", ErrorCategory::Validation));
        }
        let snapshot = breakers.snapshot("profile").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.request_count, 0);
    }

    #[test]
    fn open_breaker_moves_to_half_open_after_timeout() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..10 {
            breakers.on_failure("billing", ErrorCategory::ExternalDependency);
        }
        assert!(!breakers.can_execute("billing"));
        clock.advance(Duration::from_secs(59));
        assert!(!breakers.can_execute("billing"));
        clock.advance(Duration::from_secs(1));
        assert!(breakers.can_execute("billing"));
        assert_eq!(breakers.state("billing"), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_timeout() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..10 {
            breakers.on_failure("billing", ErrorCategory::ExternalDependency);
        }
        clock.advance(Duration::from_secs(61));
        assert!(breakers.can_execute("billing"));
        breakers.on_failure("billing", ErrorCategory::ExternalDependency);
        let snapshot = breakers.snapshot("billing").unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        let next = snapshot.next_attempt_at.unwrap();
        assert_eq!((next - clock.wall()).num_seconds(), 60);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..10 {
            breakers.on_failure("billing", ErrorCategory::ExternalDependency);
        }
        clock.advance(Duration::from_secs(61));
        assert!(breakers.can_execute("billing"));
        breakers.on_success("billing");
        breakers.on_success("billing");
        assert_eq!(breakers.state("billing"), Some(CircuitState::HalfOpen));
        breakers.on_success("billing");
        let snapshot = breakers.snapshot("billing").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.request_count, 0);
        assert!(snapshot.next_attempt_at.is_none());
    }

    #[tokio::test]
    async fn rejected_calls_do_not_run_the_operation() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..10 {
            let result: Result<(), _> = breakers
                .execute("ledger", ErrorContext::new(), || async { Err(unavailable()) })
                .await;
            assert_eq!(result.unwrap_err().code(), codes::SERVICE_UNAVAILABLE);
        }

        let mut invoked = false;
        let err = breakers
            .execute("ledger", ErrorContext::new(), || {
                invoked = true;
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(!invoked);
        assert_eq!(err.code(), codes::CIRCUIT_OPEN);
        assert_eq!(err.category(), ErrorCategory::ExternalDependency);
        assert_eq!(err.resource(), Some("ledger"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(breakers.snapshot("ledger").unwrap().rejected_total, 1);
    }

    #[test]
    fn circuit_open_errors_never_count() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        let rejection = breakers.rejection("search", ErrorContext::new(), Duration::from_secs(1));
        for _ in 0..20 {
            assert!(!breakers.record_failure("search", &rejection));
        }
        assert_eq!(breakers.state("search"), Some(CircuitState::Closed));
    }

    #[test]
    fn explicit_config_applies_only_on_creation() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        let custom = BreakerConfig {
            failure_threshold: 1,
            volume_threshold: 1,
            ..BreakerConfig::default()
        };
        let created = breakers.get_or_create("fx-rates", Some(custom.clone()));
        assert_eq!(created.config.failure_threshold, 1);
        let again = breakers.get_or_create("fx-rates", None);
        assert_eq!(again.config.failure_threshold, 1);
        breakers.on_failure("fx-rates", ErrorCategory::Network);
        assert_eq!(breakers.open_count(), 1);
    }

    #[test]
    fn reset_restores_closed_state() {
        let clock = ManualClock::new();
        let breakers = registry(&clock);
        for _ in 0..10 {
            breakers.on_failure("a", ErrorCategory::ExternalDependency);
            breakers.on_failure("b", ErrorCategory::ExternalDependency);
        }
        assert_eq!(breakers.open_count(), 2);
        assert!(breakers.reset("a"));
        assert!(!breakers.reset("unknown"));
        assert_eq!(breakers.open_count(), 1);
        assert_eq!(breakers.reset_all(), 2);
        assert_eq!(breakers.open_count(), 0);
        let keys: Vec<_> = breakers.snapshots().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_failures_are_linearised() {
        let clock = ManualClock::new();
        let breakers = Arc::new(registry(&clock));
        let calls = (0..50).map(|_| {
            let breakers = breakers.clone();
            tokio::spawn(async move {
                let _ = breakers
                    .execute("shared", ErrorContext::new(), || async {
                        Err::<(), _>(anyhow!("connection refused by shared upstream"))
                    })
                    .await;
            })
        });
        for joined in futures::future::join_all(calls).await {
            joined.unwrap();
        }
        let snapshot = breakers.snapshot("shared").unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.request_count + snapshot.rejected_total as u32, 50);
    }
}
