//! Per-suite result record.

use emu_classifier::{Classification, Severity};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::failure::FailureKind;

/// How far a suite got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteStatus {
    /// Ran to exit (or was killed on timeout) and was classified
    Classified,
    /// Never triggered because a precondition failed
    Blocked,
    /// Stopped by a cancellation request
    Cancelled,
    /// The harness lost track of the process
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub suite: String,
    pub category: String,
    pub device: String,
    pub status: SuiteStatus,
    pub verdict: Severity,
    /// Number of times the suite was triggered.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Preserved capture, when the run kept its logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub duration_ms: u64,
}

impl SuiteSummary {
    pub fn classified(
        suite: &str,
        category: &str,
        device: &str,
        attempts: u32,
        classification: Classification,
        failure_kind: Option<FailureKind>,
        duration_ms: u64,
    ) -> Self {
        let mut verdict = classification.severity;
        if let Some(kind) = failure_kind {
            verdict.escalate(kind.severity());
        }
        Self {
            suite: suite.to_string(),
            category: category.to_string(),
            device: device.to_string(),
            status: SuiteStatus::Classified,
            verdict,
            attempts,
            message: Some(classification.summary_line(suite)),
            classification: Some(classification),
            failure_kind,
            log_path: None,
            duration_ms,
        }
    }

    /// A suite that never ran.
    pub fn blocked(suite: &str, category: &str, device: &str, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            suite: suite.to_string(),
            category: category.to_string(),
            device: device.to_string(),
            status: SuiteStatus::Blocked,
            verdict: kind.severity(),
            attempts: 0,
            classification: None,
            failure_kind: Some(kind),
            message: Some(message.into()),
            log_path: None,
            duration_ms: 0,
        }
    }

    pub fn errored(
        suite: &str,
        category: &str,
        device: &str,
        attempts: u32,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            attempts,
            status: SuiteStatus::Errored,
            ..Self::blocked(suite, category, device, kind, message)
        }
    }

    pub fn cancelled(suite: &str, category: &str, device: &str, attempts: u32, duration_ms: u64) -> Self {
        Self {
            suite: suite.to_string(),
            category: category.to_string(),
            device: device.to_string(),
            status: SuiteStatus::Cancelled,
            verdict: Severity::Fatal,
            attempts,
            classification: None,
            failure_kind: Some(FailureKind::Cancelled),
            message: Some(format!("{}: cancelled", suite)),
            log_path: None,
            duration_ms,
        }
    }

    pub fn passed(&self) -> u64 {
        self.classification.as_ref().map(|c| c.passed).unwrap_or(0)
    }

    pub fn failed(&self) -> u64 {
        self.classification.as_ref().map(|c| c.failed).unwrap_or(0)
    }
}
