//! Run summary (run_summary.json)

use chrono::{DateTime, Utc};
use emu_classifier::{aggregate, CiStatus, Severity};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use super::failure::FailureKind;
use super::suite_summary::{SuiteStatus, SuiteSummary};
use crate::device::HealthState;
use crate::lifecycle::LifecycleState;

/// Bumped on any incompatible change to the summary layout.
pub const RUN_SUMMARY_SCHEMA_VERSION: u32 = 1;

pub const RUN_SUMMARY_SCHEMA_ID: &str = "emu-harness/run_summary@1";

/// File name inside the upload directory.
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Verdict of one lifecycle phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: LifecycleState,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub message: String,
}

impl PhaseOutcome {
    pub fn new(phase: LifecycleState, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            phase,
            severity,
            failure_kind: None,
            message: message.into(),
        }
    }

    pub fn failure(phase: LifecycleState, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            phase,
            severity: kind.severity(),
            failure_kind: Some(kind),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub name: String,
    pub device_id: String,
    pub console_port: u16,
    pub health: HealthState,
    /// Emulator processes started for this slot, one per startup attempt.
    pub launched_pids: Vec<u32>,
}

/// Outcome of one harness run, written to the upload directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,

    /// Join of every phase and suite verdict
    pub verdict: Severity,
    pub ci_status: CiStatus,
    pub exit_code: i32,

    /// Last lifecycle state reached
    pub final_state: LifecycleState,
    /// State the run was in when it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_from: Option<LifecycleState>,

    pub phases: Vec<PhaseOutcome>,
    pub suites: Vec<SuiteSummary>,
    pub devices: Vec<DeviceSummary>,

    /// Individual test totals across all suites.
    pub tests_passed: u64,
    pub tests_failed: u64,
    /// Suites that never ran.
    pub suites_blocked: usize,

    pub duration_ms: u64,
    pub human_summary: String,
}

impl RunSummary {
    /// Build the summary. A run that failed is fatal regardless of what
    /// the individual verdicts say.
    pub fn new(
        final_state: LifecycleState,
        failed_from: Option<LifecycleState>,
        phases: Vec<PhaseOutcome>,
        suites: Vec<SuiteSummary>,
        devices: Vec<DeviceSummary>,
        duration_ms: u64,
    ) -> Self {
        let mut verdict = aggregate(phases.iter().map(|p| p.severity).chain(suites.iter().map(|s| s.verdict)));
        if failed_from.is_some() {
            verdict.escalate(Severity::Fatal);
        }
        let ci_status = verdict.ci_status();
        let tests_passed = suites.iter().map(SuiteSummary::passed).fold(0u64, u64::saturating_add);
        let tests_failed = suites.iter().map(SuiteSummary::failed).fold(0u64, u64::saturating_add);
        let suites_blocked = suites.iter().filter(|s| s.status == SuiteStatus::Blocked).count();
        let human_summary = Self::generate_human_summary(ci_status, &suites, failed_from);

        Self {
            schema_version: RUN_SUMMARY_SCHEMA_VERSION,
            schema_id: RUN_SUMMARY_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            verdict,
            ci_status,
            exit_code: ci_status.exit_code(),
            final_state,
            failed_from,
            phases,
            suites,
            devices,
            tests_passed,
            tests_failed,
            suites_blocked,
            duration_ms,
            human_summary,
        }
    }

    fn generate_human_summary(ci_status: CiStatus, suites: &[SuiteSummary], failed_from: Option<LifecycleState>) -> String {
        let clean = suites.iter().filter(|s| s.verdict == Severity::Success).count();
        let mut text = format!("{}: {}/{} suites clean", ci_status.label(), clean, suites.len());
        if let Some(state) = failed_from {
            text.push_str(&format!(", run failed during {}", state));
        }
        text
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_classifier::Classification;

    fn suite(name: &str, severity: Severity) -> SuiteSummary {
        SuiteSummary::classified(
            name,
            "mochitest",
            "emulator-1",
            1,
            Classification {
                severity,
                passed: 5,
                failed: u64::from(severity != Severity::Success),
                exit_code: Some(0),
                ambiguous: false,
                rerun_requested: false,
            },
            None,
            100,
        )
    }

    #[test]
    fn test_verdict_is_join_of_suites_and_phases() {
        let summary = RunSummary::new(
            LifecycleState::Done,
            None,
            vec![PhaseOutcome::new(LifecycleState::ArtifactInstalling, Severity::Success, "installed")],
            vec![suite("a", Severity::Success), suite("b", Severity::Warning)],
            vec![],
            10,
        );
        assert_eq!(summary.verdict, Severity::Warning);
        assert_eq!(summary.ci_status, CiStatus::Warnings);
        assert_eq!(summary.exit_code, 1);
        assert_eq!(summary.tests_passed, 10);
        assert_eq!(summary.tests_failed, 1);
        assert_eq!(summary.human_summary, "WARNINGS: 1/2 suites clean");
    }

    #[test]
    fn test_failed_run_is_fatal() {
        let summary = RunSummary::new(
            LifecycleState::Failed,
            Some(LifecycleState::DevicesStarting),
            vec![],
            vec![],
            vec![],
            10,
        );
        assert_eq!(summary.verdict, Severity::Fatal);
        assert_eq!(summary.exit_code, 4);
        assert!(summary.human_summary.contains("DEVICES_STARTING"));
    }

    #[test]
    fn test_empty_run_is_success() {
        let summary = RunSummary::new(LifecycleState::Done, None, vec![], vec![], vec![], 0);
        assert_eq!(summary.verdict, Severity::Success);
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload").join(RUN_SUMMARY_FILE);
        let summary = RunSummary::new(LifecycleState::Done, None, vec![], vec![suite("a", Severity::Success)], vec![], 7);
        summary.write_to_file(&path).unwrap();
        let loaded = RunSummary::from_file(&path).unwrap();
        assert_eq!(loaded.schema_id, RUN_SUMMARY_SCHEMA_ID);
        assert_eq!(loaded.suites, summary.suites);
        assert_eq!(loaded.final_state, LifecycleState::Done);
        assert_eq!(loaded.tests_passed, 5);
        let json = summary.to_json().unwrap();
        assert!(json.contains("\"tests_passed\": 5"));
        assert!(!json.contains("suites_passed"));
    }
}
