//! Retry, polling and timeout constants.
//!
//! The defaults are the values the emulator automation has always used;
//! they are tuned to one emulator generation and so are configurable.

use std::time::Duration;

use emu_console::{ConsoleTimeouts, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::timeout::SuiteTimeouts;

use super::ConfigError;

/// `[timing]` table, all durations in (fractional) seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub redirect_attempts: u32,
    pub redirect_first_delay_secs: f64,
    pub redirect_delay_secs: f64,

    pub agent_attempts: u32,
    pub agent_delay_secs: f64,

    pub startup_attempts: u32,
    pub startup_delay_secs: f64,

    pub poll_interval_secs: f64,
    pub heartbeat_interval_secs: f64,
    pub terminate_grace_secs: f64,

    pub connect_timeout_secs: f64,
    pub read_timeout_secs: f64,
    pub install_timeout_secs: f64,

    pub suite_timeout_secs: f64,
    /// Zero disables the idle-output check.
    pub suite_idle_timeout_secs: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            redirect_attempts: 5,
            redirect_first_delay_secs: 10.0,
            redirect_delay_secs: 30.0,
            agent_attempts: 4,
            agent_delay_secs: 30.0,
            startup_attempts: 3,
            startup_delay_secs: 30.0,
            poll_interval_secs: 30.0,
            heartbeat_interval_secs: 300.0,
            terminate_grace_secs: 10.0,
            connect_timeout_secs: 10.0,
            read_timeout_secs: 10.0,
            install_timeout_secs: 600.0,
            suite_timeout_secs: 7200.0,
            suite_idle_timeout_secs: 1800.0,
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, attempts) in [
            ("redirect_attempts", self.redirect_attempts),
            ("agent_attempts", self.agent_attempts),
            ("startup_attempts", self.startup_attempts),
        ] {
            if attempts == 0 {
                return Err(ConfigError::invalid(format!("timing.{}", field), "must be at least 1"));
            }
        }

        for (field, secs) in self.durations() {
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::invalid(
                    format!("timing.{}", field),
                    format!("must be a non-negative number of seconds, got {}", secs),
                ));
            }
        }

        for (field, secs) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
            ("install_timeout_secs", self.install_timeout_secs),
            ("suite_timeout_secs", self.suite_timeout_secs),
        ] {
            if secs == 0.0 {
                return Err(ConfigError::invalid(format!("timing.{}", field), "must be greater than zero"));
            }
        }

        if self.suite_idle_timeout_secs > self.suite_timeout_secs {
            return Err(ConfigError::invalid(
                "timing.suite_idle_timeout_secs",
                format!("must not exceed suite_timeout_secs ({})", self.suite_timeout_secs),
            ));
        }
        Ok(())
    }

    fn durations(&self) -> [(&'static str, f64); 12] {
        [
            ("redirect_first_delay_secs", self.redirect_first_delay_secs),
            ("redirect_delay_secs", self.redirect_delay_secs),
            ("agent_delay_secs", self.agent_delay_secs),
            ("startup_delay_secs", self.startup_delay_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("terminate_grace_secs", self.terminate_grace_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
            ("install_timeout_secs", self.install_timeout_secs),
            ("suite_timeout_secs", self.suite_timeout_secs),
            ("suite_idle_timeout_secs", self.suite_idle_timeout_secs),
        ]
    }

    /// Resolve into runtime values. Call after [`TimingConfig::validate`].
    pub fn to_timing(&self) -> Timing {
        let d = Duration::from_secs_f64;
        Timing {
            redirect: RetryPolicy::escalating(
                self.redirect_attempts,
                d(self.redirect_first_delay_secs),
                d(self.redirect_delay_secs),
            ),
            agent: RetryPolicy::fixed(self.agent_attempts, d(self.agent_delay_secs)),
            startup: RetryPolicy::fixed(self.startup_attempts, d(self.startup_delay_secs)),
            poll_interval: d(self.poll_interval_secs),
            heartbeat_interval: d(self.heartbeat_interval_secs),
            terminate_grace: d(self.terminate_grace_secs),
            console: ConsoleTimeouts {
                connect: d(self.connect_timeout_secs),
                read: d(self.read_timeout_secs),
            },
            install_timeout: d(self.install_timeout_secs),
            suite: SuiteTimeouts {
                overall: d(self.suite_timeout_secs),
                idle: (self.suite_idle_timeout_secs > 0.0).then(|| d(self.suite_idle_timeout_secs)),
            },
        }
    }
}

/// Runtime timing, read by the lifecycle controller and device backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    /// Console connection for port redirection.
    pub redirect: RetryPolicy,
    /// Agent prompt probe.
    pub agent: RetryPolicy,
    /// Whole device-startup phase.
    pub startup: RetryPolicy,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub terminate_grace: Duration,
    pub console: ConsoleTimeouts,
    pub install_timeout: Duration,
    pub suite: SuiteTimeouts,
}

impl Default for Timing {
    fn default() -> Self {
        TimingConfig::default().to_timing()
    }
}
