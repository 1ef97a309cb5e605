//! Suite timeouts and the keep-alive heartbeat.
//!
//! Two limits apply to a running suite:
//! - `overall`: maximum wall-clock time
//! - `idle`: maximum time without new output in the capture file
//!
//! The enforcer only detects the condition. The lifecycle controller
//! terminates the suite through the supervisor and classifies it as a
//! crash.

use std::time::{Duration, Instant};

/// Per-suite limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuiteTimeouts {
    pub overall: Duration,
    /// `None` disables the idle check.
    pub idle: Option<Duration>,
}

impl Default for SuiteTimeouts {
    fn default() -> Self {
        Self {
            overall: Duration::from_secs(7200),
            idle: Some(Duration::from_secs(1800)),
        }
    }
}

impl SuiteTimeouts {
    /// Apply a suite's own limits (seconds) over the run-wide ones.
    pub fn with_overrides(self, overall_secs: Option<f64>, idle_secs: Option<f64>) -> Self {
        Self {
            overall: overall_secs.map(Duration::from_secs_f64).unwrap_or(self.overall),
            idle: idle_secs.map(Duration::from_secs_f64).or(self.idle),
        }
    }
}

/// Timeout check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    Ok,
    OverallTimeout,
    IdleTimeout,
}

impl TimeoutStatus {
    pub fn is_timeout(&self) -> bool {
        !matches!(self, TimeoutStatus::Ok)
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            TimeoutStatus::Ok => None,
            TimeoutStatus::OverallTimeout => Some("overall timeout"),
            TimeoutStatus::IdleTimeout => Some("no output timeout"),
        }
    }
}

/// Tracks wall-clock time and output growth for one suite run.
#[derive(Debug, Clone)]
pub struct TimeoutEnforcer {
    timeouts: SuiteTimeouts,
    start_time: Instant,
    last_activity: Instant,
    last_output_len: u64,
}

impl TimeoutEnforcer {
    pub fn new(timeouts: SuiteTimeouts) -> Self {
        Self::started_at(timeouts, Instant::now())
    }

    pub fn started_at(timeouts: SuiteTimeouts, start: Instant) -> Self {
        Self {
            timeouts,
            start_time: start,
            last_activity: start,
            last_output_len: 0,
        }
    }

    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Feed the current capture size; growth counts as activity.
    pub fn observe_output(&mut self, len: u64) {
        self.observe_output_at(len, Instant::now());
    }

    pub fn observe_output_at(&mut self, len: u64, now: Instant) {
        if len > self.last_output_len {
            self.last_output_len = len;
            self.last_activity = now;
        }
    }

    pub fn check(&self) -> TimeoutStatus {
        self.check_at(Instant::now())
    }

    /// Overall is checked before idle.
    pub fn check_at(&self, now: Instant) -> TimeoutStatus {
        if now.saturating_duration_since(self.start_time) > self.timeouts.overall {
            return TimeoutStatus::OverallTimeout;
        }
        if let Some(idle) = self.timeouts.idle {
            if now.saturating_duration_since(self.last_activity) > idle {
                return TimeoutStatus::IdleTimeout;
            }
        }
        TimeoutStatus::Ok
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn overall_remaining(&self) -> Duration {
        self.timeouts.overall.saturating_sub(self.elapsed())
    }

    pub fn timeouts(&self) -> &SuiteTimeouts {
        &self.timeouts
    }
}

/// Periodic keep-alive line so an outer supervisor that kills silent jobs
/// leaves a long poll loop alone.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    last: Instant,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self::started_at(interval, Instant::now())
    }

    pub fn started_at(interval: Duration, start: Instant) -> Self {
        Self { interval, last: start }
    }

    /// True at most once per interval; a zero interval never fires.
    pub fn due(&mut self) -> bool {
        self.due_at(Instant::now())
    }

    pub fn due_at(&mut self, now: Instant) -> bool {
        if self.interval.is_zero() {
            return false;
        }
        if now.saturating_duration_since(self.last) > self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}
