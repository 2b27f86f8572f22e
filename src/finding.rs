use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Whether a finding prevents approval. `Blocking` orders above `NonBlocking`,
/// so `max()` picks the stricter of two severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    NonBlocking,
    Blocking,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::NonBlocking => "NON-BLOCKING",
            Severity::Blocking => "BLOCKING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Location {
    pub fn new(file: impl Into<String>, line: Option<u32>) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line}", self.file),
            None => write!(f, "{}", self.file),
        }
    }
}

/// A single classified issue surfaced by a quality check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub source: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Finding {
    pub fn new(
        source: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        location: Option<Location>,
    ) -> Self {
        Self {
            source: source.into(),
            severity,
            message: message.into(),
            location,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }

    /// Canonical order: source name, then location, then message.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.source
            .cmp(&other.source)
            .then_with(|| self.location.cmp(&other.location))
            .then_with(|| self.message.cmp(&other.message))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    RequestChanges,
}

impl Decision {
    pub fn for_findings(findings: &[Finding]) -> Self {
        if findings.iter().any(Finding::is_blocking) {
            Decision::RequestChanges
        } else {
            Decision::Approve
        }
    }
}

/// Immutable record of one review round, appended to a task's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSnapshot {
    pub iteration: u32,
    pub decision: Decision,
    pub timestamp: u64,
    /// Delivery id or finding fingerprint of the trigger that produced this round.
    pub trigger_key: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl FindingSnapshot {
    pub fn blocking(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_blocking())
    }

    pub fn blocking_count(&self) -> usize {
        self.blocking().count()
    }

    pub fn blocking_messages(&self) -> Vec<&str> {
        self.blocking().map(|f| f.message.as_str()).collect()
    }
}

/// Stable SHA-256 fingerprint of an ordered finding list.
pub fn fingerprint(findings: &[Finding]) -> String {
    let mut hasher = Sha256::new();
    for finding in findings {
        hasher.update(finding.source.as_bytes());
        hasher.update([0x1f]);
        hasher.update(finding.severity.label().as_bytes());
        hasher.update([0x1f]);
        if let Some(ref loc) = finding.location {
            hasher.update(loc.to_string().as_bytes());
        }
        hasher.update([0x1f]);
        hasher.update(finding.message.as_bytes());
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}
