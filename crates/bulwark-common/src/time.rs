//! ---
//! bw_section: "01-core-functionality"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Shared primitives and utilities for the resilience engine."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of monotonic and wall-clock time for state machines that compare timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic instant used for window and timeout comparisons.
    fn now(&self) -> Instant;

    /// Wall-clock timestamp used for records and reports.
    fn wall(&self) -> DateTime<Utc>;

    /// Project a monotonic instant onto the wall clock.
    fn wall_at(&self, instant: Instant) -> DateTime<Utc> {
        let now = self.now();
        let wall = self.wall();
        match instant.checked_duration_since(now) {
            Some(ahead) => wall + to_chrono(ahead),
            None => {
                let behind = now.saturating_duration_since(instant);
                wall - to_chrono(behind)
            }
        }
    }
}

/// Clock handle shared between engine components.
pub type SharedClock = Arc<dyn Clock>;

/// Capture a clock handle backed by the operating system.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to, for deterministic tests and replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move the clock forward. Clones observe the same offset.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Total time advanced since construction.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }

    /// Wrap the clock for injection into engine components.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn wall(&self) -> DateTime<Utc> {
        self.wall_origin + to_chrono(*self.offset.lock())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Convert a duration into milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_shared_offset() {
        let clock = ManualClock::new();
        let shared = clock.shared();
        let start = shared.now();
        clock.advance(Duration::from_secs(61));
        assert_eq!(shared.now() - start, Duration::from_secs(61));
        assert_eq!(clock.elapsed(), Duration::from_secs(61));
    }

    #[test]
    fn wall_at_projects_future_instants() {
        let clock = ManualClock::new();
        let target = clock.now() + Duration::from_secs(30);
        let projected = clock.wall_at(target);
        assert_eq!((projected - clock.wall()).num_seconds(), 30);
    }

    #[test]
    fn millis_conversion_saturates() {
        assert_eq!(duration_to_millis(Duration::from_millis(250)), 250);
        assert_eq!(duration_to_millis(Duration::MAX), u64::MAX);
    }
}
