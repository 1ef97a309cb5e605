//! One triggered suite and its state machine.
//!
//! RUNNING → EXITED → CLASSIFIED. The classification is only attached
//! after the exit has been observed, so the capture it was computed from
//! is complete.

use chrono::{DateTime, Utc};
use emu_classifier::Classification;
use serde::{Deserialize, Serialize};

use super::{CommandLine, DispatchError};
use crate::supervisor::{ExitOutcome, ProcessId};
use crate::timeout::TimeoutEnforcer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuiteState {
    Running,
    Exited,
    Classified,
}

impl SuiteState {
    pub fn can_transition_to(&self, target: SuiteState) -> bool {
        matches!(
            (self, target),
            (SuiteState::Running, SuiteState::Exited) | (SuiteState::Exited, SuiteState::Classified)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SuiteRun {
    pub suite: String,
    pub category: String,
    pub command: CommandLine,
    pub device_index: usize,
    pub device: String,
    pub process: ProcessId,
    /// 1-based.
    pub attempt: u32,
    pub enforcer: TimeoutEnforcer,
    pub started_at: DateTime<Utc>,
    state: SuiteState,
    outcome: Option<ExitOutcome>,
    timeout_reason: Option<&'static str>,
    classification: Option<Classification>,
}

impl SuiteRun {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        suite: &str,
        category: &str,
        command: CommandLine,
        device_index: usize,
        device: &str,
        process: ProcessId,
        attempt: u32,
        enforcer: TimeoutEnforcer,
    ) -> Self {
        Self {
            suite: suite.to_string(),
            category: category.to_string(),
            command,
            device_index,
            device: device.to_string(),
            process,
            attempt,
            enforcer,
            started_at: Utc::now(),
            state: SuiteState::Running,
            outcome: None,
            timeout_reason: None,
            classification: None,
        }
    }

    pub fn state(&self) -> SuiteState {
        self.state
    }

    pub fn outcome(&self) -> Option<&ExitOutcome> {
        self.outcome.as_ref()
    }

    /// Set when the harness killed the suite for running too long.
    pub fn timeout_reason(&self) -> Option<&'static str> {
        self.timeout_reason
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.classification.as_ref()
    }

    /// Exit code for the classifier; a timed-out suite has none even if
    /// it caught SIGTERM and exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        if self.timeout_reason.is_some() {
            return None;
        }
        self.outcome.as_ref().and_then(ExitOutcome::code)
    }

    pub fn mark_exited(&mut self, outcome: ExitOutcome, timeout_reason: Option<&'static str>) -> Result<(), DispatchError> {
        self.transition(SuiteState::Exited)?;
        self.outcome = Some(outcome);
        self.timeout_reason = timeout_reason;
        Ok(())
    }

    pub fn mark_classified(&mut self, classification: Classification) -> Result<(), DispatchError> {
        self.transition(SuiteState::Classified)?;
        self.classification = Some(classification);
        Ok(())
    }

    /// Name of the preserved capture file.
    pub fn log_file_name(&self) -> String {
        if self.attempt > 1 {
            format!("{}-{}-run{}.log", self.suite, self.device, self.attempt)
        } else {
            format!("{}-{}.log", self.suite, self.device)
        }
    }

    fn transition(&mut self, target: SuiteState) -> Result<(), DispatchError> {
        if !self.state.can_transition_to(target) {
            return Err(DispatchError::InvalidTransition {
                suite: self.suite.clone(),
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        Ok(())
    }
}
