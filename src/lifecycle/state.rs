//! Lifecycle state machine
//!
//! IDLE → ACQUIRING_DEVICES → DEVICES_STARTING → DEVICES_HEALTHY →
//! ARTIFACT_INSTALLING → SUITES_RUNNING → RESULTS_COLLECTED →
//! DEVICES_STOPPED → DONE, with FAILED reachable from every non-terminal
//! state and absorbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Idle,
    AcquiringDevices,
    DevicesStarting,
    DevicesHealthy,
    ArtifactInstalling,
    SuitesRunning,
    ResultsCollected,
    DevicesStopped,
    Done,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Done | LifecycleState::Failed)
    }

    /// The one state that follows on success.
    pub fn next(&self) -> Option<LifecycleState> {
        use LifecycleState::*;
        match self {
            Idle => Some(AcquiringDevices),
            AcquiringDevices => Some(DevicesStarting),
            DevicesStarting => Some(DevicesHealthy),
            DevicesHealthy => Some(ArtifactInstalling),
            ArtifactInstalling => Some(SuitesRunning),
            SuitesRunning => Some(ResultsCollected),
            ResultsCollected => Some(DevicesStopped),
            DevicesStopped => Some(Done),
            Done | Failed => None,
        }
    }

    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == LifecycleState::Failed || self.next() == Some(target)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "IDLE",
            LifecycleState::AcquiringDevices => "ACQUIRING_DEVICES",
            LifecycleState::DevicesStarting => "DEVICES_STARTING",
            LifecycleState::DevicesHealthy => "DEVICES_HEALTHY",
            LifecycleState::ArtifactInstalling => "ARTIFACT_INSTALLING",
            LifecycleState::SuitesRunning => "SUITES_RUNNING",
            LifecycleState::ResultsCollected => "RESULTS_COLLECTED",
            LifecycleState::DevicesStopped => "DEVICES_STOPPED",
            LifecycleState::Done => "DONE",
            LifecycleState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid lifecycle transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Current state plus every state entered, in order.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: LifecycleState,
    failed_from: Option<LifecycleState>,
    history: Vec<(LifecycleState, DateTime<Utc>)>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Idle,
            failed_from: None,
            history: vec![(LifecycleState::Idle, Utc::now())],
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.state == LifecycleState::Failed
    }

    pub fn failed_from(&self) -> Option<LifecycleState> {
        self.failed_from
    }

    pub fn history(&self) -> Vec<LifecycleState> {
        self.history.iter().map(|(state, _)| *state).collect()
    }

    pub fn transition(&mut self, target: LifecycleState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(target) {
            return Err(InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        tracing::info!(from = %self.state, to = %target, "lifecycle transition");
        if target == LifecycleState::Failed {
            self.failed_from = Some(self.state);
        }
        self.state = target;
        self.history.push((target, Utc::now()));
        Ok(())
    }

    /// Move to FAILED; a no-op once terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            // Every non-terminal state may fail.
            let _ = self.transition(LifecycleState::Failed);
        }
    }
}
