//! Classification result and exit-code policy.

use serde::{Deserialize, Serialize};

use crate::severity::Severity;

/// How process exit status maps onto severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPolicy {
    /// Exit code a harness uses for "tests ran, some failed".
    #[serde(default = "default_tests_failed_code")]
    pub tests_failed_code: i32,

    /// Severity for any other unexpected exit.
    #[serde(default = "default_harness_failure")]
    pub harness_failure: Severity,

    /// Severity when no exit code exists (signal, timeout).
    #[serde(default = "default_harness_failure")]
    pub crash: Severity,
}

fn default_tests_failed_code() -> i32 {
    10
}

fn default_harness_failure() -> Severity {
    Severity::Failure
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            tests_failed_code: default_tests_failed_code(),
            harness_failure: default_harness_failure(),
            crash: default_harness_failure(),
        }
    }
}

/// Outcome of classifying one suite run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub severity: Severity,
    pub passed: u64,
    pub failed: u64,
    /// `None` when the process was killed.
    pub exit_code: Option<i32>,
    /// No output line matched any rule.
    pub ambiguous: bool,
    /// The output asked for the suite to be run again.
    pub rerun_requested: bool,
}

impl Classification {
    /// One-line summary for the build log.
    pub fn summary_line(&self, suite: &str) -> String {
        let mut line = format!("{}: passed {}, failed {}", suite, self.passed, self.failed);
        match self.exit_code {
            Some(code) => line.push_str(&format!(" (exit {})", code)),
            None => line.push_str(" (killed)"),
        }
        if self.ambiguous {
            line.push_str(" [no recognised output]");
        }
        line.push_str(&format!(" => {}", self.severity.ci_status().label()));
        line
    }
}
