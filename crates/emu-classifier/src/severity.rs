//! Severity lattice and CI status mapping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Build-status severity, ordered from best to worst.
///
/// The derived `Ord` is the lattice order; [`Severity::join`] is `max`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Success,
    Warning,
    Failure,
    Fatal,
}

impl Severity {
    /// All levels in lattice order.
    pub const ALL: [Severity; 4] = [
        Severity::Success,
        Severity::Warning,
        Severity::Failure,
        Severity::Fatal,
    ];

    /// Worst-of join.
    pub fn join(self, other: Severity) -> Severity {
        self.max(other)
    }

    /// Raise `self` in place to at least `other`.
    pub fn escalate(&mut self, other: Severity) {
        *self = self.join(other);
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Failure => "failure",
            Severity::Fatal => "fatal",
        }
    }

    /// Map to the upstream CI status vocabulary.
    pub fn ci_status(&self) -> CiStatus {
        match self {
            Severity::Success => CiStatus::Success,
            Severity::Warning => CiStatus::Warnings,
            Severity::Failure => CiStatus::Failure,
            Severity::Fatal => CiStatus::Exception,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worst-of reduction over any number of verdicts.
///
/// The empty sequence reduces to [`Severity::Success`], the lattice bottom.
pub fn aggregate<I>(verdicts: I) -> Severity
where
    I: IntoIterator<Item = Severity>,
{
    verdicts
        .into_iter()
        .fold(Severity::Success, Severity::join)
}

/// Status vocabulary of the upstream CI system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CiStatus {
    Success,
    Warnings,
    Failure,
    Exception,
}

impl CiStatus {
    /// Process exit code reported to the CI system.
    pub fn exit_code(&self) -> i32 {
        match self {
            CiStatus::Success => 0,
            CiStatus::Warnings => 1,
            CiStatus::Failure => 2,
            CiStatus::Exception => 4,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CiStatus::Success => "SUCCESS",
            CiStatus::Warnings => "WARNINGS",
            CiStatus::Failure => "FAILURE",
            CiStatus::Exception => "EXCEPTION",
        }
    }
}
