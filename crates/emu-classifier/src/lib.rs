//! Output classifier for emulator test-suite runs.
//!
//! Scans captured suite output line by line against a category-specific
//! rule table, tallies passes and failures, and folds the scan together
//! with the process exit status into a single [`Severity`]. Verdicts from
//! many suites are merged with [`aggregate`], the lattice join.

mod result;
mod rules;
mod severity;

pub use result::{Classification, ExitPolicy};
pub use rules::{Rule, RuleHit, RuleSet, RuleSpec, Tally};
pub use severity::{aggregate, CiStatus, Severity};

use std::collections::BTreeMap;

/// Errors raised while building rule tables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifierError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("pattern '{0}' must have a capture group to count tests")]
    MissingCapture(String),
}

/// Incremental scanner over one suite's output.
///
/// Feed lines as they become available, then call [`OutputScanner::finish`]
/// once the exit status is known.
#[derive(Debug)]
pub struct OutputScanner<'a> {
    rules: &'a RuleSet,
    passed: u64,
    failed: u64,
    recognised: u64,
    scanned: Severity,
    rerun_requested: bool,
}

impl<'a> OutputScanner<'a> {
    pub fn new(rules: &'a RuleSet) -> Self {
        Self {
            rules,
            passed: 0,
            failed: 0,
            recognised: 0,
            scanned: Severity::Success,
            rerun_requested: false,
        }
    }

    pub fn scan_line(&mut self, line: &str) {
        let Some(hit) = self.rules.check(line) else {
            return;
        };
        self.recognised += 1;
        self.scanned.escalate(hit.severity);
        match hit.tally {
            Tally::None => {}
            Tally::Pass => self.passed = self.passed.saturating_add(1),
            Tally::Fail => self.failed = self.failed.saturating_add(1),
            // Counts come from child output; clamp rather than overflow.
            Tally::AddPasses => self.passed = self.passed.saturating_add(hit.count),
            Tally::AddFails => self.failed = self.failed.saturating_add(hit.count),
            Tally::Rerun => self.rerun_requested = true,
        }
    }

    pub fn scan_text(&mut self, text: &str) {
        for line in text.lines() {
            self.scan_line(line);
        }
    }

    /// Combine the scan with the exit status. `exit_code` is `None` when
    /// the process was killed by a signal or a timeout.
    pub fn finish(self, exit_code: Option<i32>, policy: &ExitPolicy) -> Classification {
        let ambiguous = self.recognised == 0;
        let from_exit = match exit_code {
            Some(0) if self.failed == 0 && self.passed > 0 => Severity::Success,
            Some(code) if code == policy.tests_failed_code && self.failed > 0 => Severity::Warning,
            Some(_) => policy.harness_failure,
            None => policy.crash,
        };
        let mut severity = self.scanned.join(from_exit);
        if ambiguous {
            severity.escalate(Severity::Failure);
        }
        Classification {
            severity,
            passed: self.passed,
            failed: self.failed,
            exit_code,
            ambiguous,
            rerun_requested: self.rerun_requested,
        }
    }
}

/// Classify a complete capture in one call.
pub fn classify(
    text: &str,
    exit_code: Option<i32>,
    rules: &RuleSet,
    policy: &ExitPolicy,
) -> Classification {
    let mut scanner = OutputScanner::new(rules);
    scanner.scan_text(text);
    scanner.finish(exit_code, policy)
}

/// Rule tables keyed by suite category, plus the exit-code policy.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    tables: BTreeMap<String, RuleSet>,
    policy: ExitPolicy,
}

impl Classifier {
    pub fn new(policy: ExitPolicy) -> Self {
        Self {
            tables: BTreeMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &ExitPolicy {
        &self.policy
    }

    /// Prepend custom rules to a category's built-in table.
    pub fn extend_category(&mut self, category: &str, specs: &[RuleSpec]) -> Result<(), ClassifierError> {
        let custom = specs
            .iter()
            .map(Rule::from_spec)
            .collect::<Result<Vec<_>, _>>()?;
        self.tables
            .entry(category.to_string())
            .or_insert_with(|| RuleSet::builtin(category))
            .prepend(custom);
        Ok(())
    }

    /// Rule table for `category`: a customised one if configured, the
    /// built-in table otherwise.
    pub fn rules_for(&self, category: &str) -> std::borrow::Cow<'_, RuleSet> {
        match self.tables.get(category) {
            Some(rules) => std::borrow::Cow::Borrowed(rules),
            None => std::borrow::Cow::Owned(RuleSet::builtin(category)),
        }
    }

    pub fn classify(&self, category: &str, text: &str, exit_code: Option<i32>) -> Classification {
        let rules = self.rules_for(category);
        classify(text, exit_code, &rules, &self.policy)
    }
}
