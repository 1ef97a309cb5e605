//! Failure taxonomy for phases and suites.

use emu_classifier::Severity;
use serde::{Deserialize, Serialize};

/// Why a phase or suite did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// A process could not be spawned
    Launch,
    /// Devices never came up within the startup retries
    Startup,
    /// A device slot could not be claimed
    Acquire,
    /// An install needed by the suite failed
    Install,
    /// The suite command could not be built
    Dispatch,
    /// The suite exceeded its overall time limit
    TimeoutOverall,
    /// The suite stopped producing output
    TimeoutIdle,
    /// The suite asked to be rerun more often than allowed
    RerunExhausted,
    /// No output line was recognised
    Ambiguous,
    /// The run was interrupted
    Cancelled,
}

impl FailureKind {
    pub fn description(&self) -> &'static str {
        match self {
            FailureKind::Launch => "Process launch failed",
            FailureKind::Startup => "Device startup failed",
            FailureKind::Acquire => "Device acquisition failed",
            FailureKind::Install => "Installation failed",
            FailureKind::Dispatch => "Suite command could not be built",
            FailureKind::TimeoutOverall => "Suite timed out",
            FailureKind::TimeoutIdle => "Suite produced no output",
            FailureKind::RerunExhausted => "Suite rerun limit reached",
            FailureKind::Ambiguous => "No recognised test output",
            FailureKind::Cancelled => "Run cancelled",
        }
    }

    /// Minimum severity a failure of this kind implies.
    pub fn severity(&self) -> Severity {
        match self {
            FailureKind::TimeoutOverall | FailureKind::TimeoutIdle | FailureKind::Ambiguous => Severity::Failure,
            _ => Severity::Fatal,
        }
    }

    /// Kind for a timeout reason reported by the enforcer.
    pub fn from_timeout_reason(reason: &str) -> FailureKind {
        if reason.contains("output") {
            FailureKind::TimeoutIdle
        } else {
            FailureKind::TimeoutOverall
        }
    }
}
