//! Category rule tables.
//!
//! A rule pairs a line matcher with a tally action and a severity. Tables
//! are ordered and the first matching rule wins, so category-specific
//! summary rules sit ahead of the shared error rules.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::severity::Severity;
use crate::ClassifierError;

/// What a matching line contributes to the pass/fail tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tally {
    /// Recognised, counts nothing.
    None,
    /// One passing test.
    Pass,
    /// One failing test.
    Fail,
    /// Add the first capture group to the pass total.
    AddPasses,
    /// Add the first capture group to the fail total.
    AddFails,
    /// The harness asks for the whole suite to be run again.
    Rerun,
}

impl Tally {
    fn needs_capture(&self) -> bool {
        matches!(self, Tally::AddPasses | Tally::AddFails)
    }
}

/// Serializable rule description, as found in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    #[serde(default)]
    pub regex: bool,
    #[serde(default = "default_tally")]
    pub tally: Tally,
    #[serde(default)]
    pub severity: Severity,
}

fn default_tally() -> Tally {
    Tally::None
}

#[derive(Debug, Clone)]
enum Matcher {
    Substring(String),
    Pattern(Regex),
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    matcher: Matcher,
    pub tally: Tally,
    pub severity: Severity,
}

/// Result of matching one line against one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleHit {
    pub tally: Tally,
    pub severity: Severity,
    /// Parsed first capture group for `AddPasses`/`AddFails`.
    pub count: u64,
}

impl Rule {
    pub fn substring(needle: &str, tally: Tally, severity: Severity) -> Self {
        Self {
            matcher: Matcher::Substring(needle.to_string()),
            tally,
            severity,
        }
    }

    pub fn pattern(pattern: &str, tally: Tally, severity: Severity) -> Result<Self, ClassifierError> {
        let regex = Regex::new(pattern).map_err(|e| ClassifierError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        if tally.needs_capture() && regex.captures_len() < 2 {
            return Err(ClassifierError::MissingCapture(pattern.to_string()));
        }
        Ok(Self {
            matcher: Matcher::Pattern(regex),
            tally,
            severity,
        })
    }

    pub fn from_spec(spec: &RuleSpec) -> Result<Self, ClassifierError> {
        if spec.regex {
            Self::pattern(&spec.pattern, spec.tally, spec.severity)
        } else if spec.tally.needs_capture() {
            Err(ClassifierError::MissingCapture(spec.pattern.clone()))
        } else {
            Ok(Self::substring(&spec.pattern, spec.tally, spec.severity))
        }
    }

    /// Match a single line.
    pub fn check(&self, line: &str) -> Option<RuleHit> {
        match &self.matcher {
            Matcher::Substring(needle) => line.contains(needle.as_str()).then_some(RuleHit {
                tally: self.tally,
                severity: self.severity,
                count: 0,
            }),
            Matcher::Pattern(regex) => {
                let caps = regex.captures(line)?;
                let count = if self.tally.needs_capture() {
                    caps.get(1)
                        .and_then(|m| m.as_str().trim().parse::<u64>().ok())
                        .unwrap_or(0)
                } else {
                    0
                };
                Some(RuleHit {
                    tally: self.tally,
                    severity: self.severity,
                    count,
                })
            }
        }
    }
}

/// Ordered rule table for one suite category.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Insert rules ahead of the existing ones so they take precedence.
    pub fn prepend(&mut self, rules: Vec<Rule>) {
        let mut merged = rules;
        merged.append(&mut self.rules);
        self.rules = merged;
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule that matches `line`, if any.
    pub fn check(&self, line: &str) -> Option<RuleHit> {
        self.rules.iter().find_map(|rule| rule.check(line))
    }

    /// Built-in table for a category. Unknown categories get the generic
    /// per-test-line table.
    pub fn builtin(category: &str) -> Self {
        let mut rules = match category {
            "mochitest" | "robocop" => summary_rules(
                r"INFO Passed:\s+(\d+)",
                r"INFO Failed:\s+(\d+)",
                Some(r"INFO Todo:\s+(\d+)"),
            ),
            "reftest" | "crashtest" | "jsreftest" => summary_rules(
                r"REFTEST INFO \| Successful: (\d+)",
                r"REFTEST INFO \| Unexpected: (\d+)",
                Some(r"REFTEST INFO \| Known problems: (\d+)"),
            ),
            "xpcshell" => summary_rules(r"INFO \| Passed: (\d+)", r"INFO \| Failed: (\d+)", None),
            "marionette" | "gaiatest" => {
                let mut rules = vec![Rule::substring(
                    "Error installing gecko!",
                    Tally::Rerun,
                    Severity::Success,
                )];
                rules.extend(summary_rules(r"passed:\s+(\d+)", r"failed:\s+(\d+)", Some(r"todo:\s+(\d+)")));
                rules
            }
            _ => generic_rules(),
        };
        rules.extend(shared_error_rules());
        Self { rules }
    }
}

fn builtin_pattern(pattern: &str, tally: Tally, severity: Severity) -> Rule {
    Rule::pattern(pattern, tally, severity).expect("built-in classifier pattern must compile")
}

fn summary_rules(passed: &str, failed: &str, todo: Option<&str>) -> Vec<Rule> {
    let mut rules = vec![
        builtin_pattern(passed, Tally::AddPasses, Severity::Success),
        builtin_pattern(failed, Tally::AddFails, Severity::Success),
    ];
    if let Some(todo) = todo {
        rules.push(builtin_pattern(todo, Tally::None, Severity::Success));
    }
    // Per-test failure lines are already covered by the summary count.
    rules.push(Rule::substring("TEST-UNEXPECTED-", Tally::None, Severity::Warning));
    rules
}

fn generic_rules() -> Vec<Rule> {
    vec![
        Rule::substring("TEST-UNEXPECTED-", Tally::Fail, Severity::Warning),
        Rule::substring("TEST-PASS", Tally::Pass, Severity::Success),
        Rule::substring("TEST-KNOWN-FAIL", Tally::None, Severity::Success),
    ]
}

fn shared_error_rules() -> Vec<Rule> {
    vec![
        Rule::substring("PROCESS-CRASH", Tally::None, Severity::Failure),
        Rule::substring("###!!! ABORT", Tally::None, Severity::Failure),
        Rule::substring("Traceback (most recent call last)", Tally::None, Severity::Failure),
    ]
}
