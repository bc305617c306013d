//! Findings, per-check outcomes and run-level reports.
//!
//! Every component produces a [`Report`]. Findings are accumulated, never
//! dropped, and the error count alone decides the exit status.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(label)
    }
}

/// Where a finding points: a migration file and line, or a live object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl Location {
    pub fn file(source: impl Into<String>, line: usize) -> Self {
        Self {
            source: source.into(),
            line: Some(line),
        }
    }

    pub fn object(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            line: None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.source, line),
            None => f.write_str(&self.source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl Finding {
    pub fn new(rule: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            severity,
            message: message.into(),
            location: None,
            before: None,
            after: None,
        }
    }

    pub fn error(rule: &str, message: impl Into<String>) -> Self {
        Self::new(rule, Severity::Error, message)
    }

    pub fn warning(rule: &str, message: impl Into<String>) -> Self {
        Self::new(rule, Severity::Warning, message)
    }

    pub fn info(rule: &str, message: impl Into<String>) -> Self {
        Self::new(rule, Severity::Info, message)
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn change(mut self, before: Option<String>, after: Option<String>) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

/// Result of one self-contained check (an invariant or an attack scenario).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub id: String,
    pub title: String,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
}

impl CheckOutcome {
    /// Status follows the worst finding: any error fails, any warning warns.
    pub fn from_findings(id: &str, title: &str, findings: Vec<Finding>) -> Self {
        let status = match findings.iter().map(|f| f.severity).max() {
            Some(Severity::Error) => CheckStatus::Fail,
            Some(Severity::Warning) => CheckStatus::Warn,
            _ => CheckStatus::Pass,
        };
        Self {
            id: id.to_string(),
            title: title.to_string(),
            status,
            findings,
        }
    }

    /// A check that could not complete is a failure carrying the cause.
    pub fn errored(id: &str, title: &str, cause: impl fmt::Display) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            status: CheckStatus::Fail,
            findings: vec![Finding::error(id, format!("check failed to run: {}", cause))],
        }
    }

    pub fn skipped(id: &str, title: &str, reason: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            status: CheckStatus::Skip,
            findings: vec![Finding::info(id, reason)],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub component: String,
    pub run_id: String,
    pub generated_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    /// Free-form lines printed after the findings (e.g. registry scaffolds).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    /// When false, error findings are reported but do not fail the gate.
    pub enforcing: bool,
}

impl Report {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            run_id: crate::core::time::new_run_id(),
            generated_at: crate::core::time::now_rfc3339(),
            checks: Vec::new(),
            findings: Vec::new(),
            notes: Vec::new(),
            enforcing: true,
        }
    }

    pub fn push(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    pub fn extend(&mut self, findings: impl IntoIterator<Item = Finding>) {
        self.findings.extend(findings);
    }

    pub fn push_check(&mut self, outcome: CheckOutcome) {
        self.checks.push(outcome);
    }

    /// All findings: top-level ones followed by those attached to checks.
    pub fn all_findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .chain(self.checks.iter().flat_map(|c| c.findings.iter()))
    }

    pub fn tally(&self) -> Tally {
        let mut tally = Tally::default();
        for finding in self.all_findings() {
            match finding.severity {
                Severity::Error => tally.errors += 1,
                Severity::Warning => tally.warnings += 1,
                Severity::Info => tally.infos += 1,
            }
        }
        tally
    }

    /// Gate verdict: `Err(GateFailed)` when an enforcing report carries errors.
    pub fn verdict(&self) -> Result<(), crate::core::error::GuardError> {
        let errors = self.tally().errors;
        if self.enforcing && errors > 0 {
            Err(crate::core::error::GuardError::GateFailed(errors))
        } else {
            Ok(())
        }
    }
}
