use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::error::Error;
use crate::finding::{Finding, Location, Severity};
use crate::report::{DiagnosticLevel, ParserRegistry, RiskLevel, StructuredReport};

/// A source that was left out of the finding set because its report was unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedSource {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Classification {
    pub findings: Vec<Finding>,
    pub dropped: Vec<DroppedSource>,
}

impl Classification {
    pub fn blocking(&self) -> Vec<Finding> {
        self.findings
            .iter()
            .filter(|f| f.is_blocking())
            .cloned()
            .collect()
    }

    pub fn blocking_count(&self) -> usize {
        self.findings.iter().filter(|f| f.is_blocking()).count()
    }
}

/// Turns heterogeneous check reports into one ordered, severity-tagged finding list.
pub struct FindingClassifier {
    parsers: ParserRegistry,
    coverage_threshold: Option<f64>,
}

impl FindingClassifier {
    pub fn new(coverage_threshold: Option<f64>) -> Self {
        Self::with_parsers(ParserRegistry::new(), coverage_threshold)
    }

    pub fn with_parsers(parsers: ParserRegistry, coverage_threshold: Option<f64>) -> Self {
        Self {
            parsers,
            coverage_threshold,
        }
    }

    /// Classify raw reports keyed by source name.
    ///
    /// The output is ordered by source, location, then message, so identical input always
    /// yields an identical sequence. A source whose report cannot be parsed is dropped and
    /// recorded in [`Classification::dropped`].
    pub fn classify(&self, raw_reports: &BTreeMap<String, String>) -> Classification {
        let mut classification = Classification::default();

        for (source, raw) in raw_reports {
            match self.parsers.parse(source, raw) {
                Ok(report) => {
                    let findings = findings_for(source, &report, self.coverage_threshold);
                    debug!(source = %source, count = findings.len(), "classified report");
                    classification.findings.extend(findings);
                }
                Err(e) => {
                    let reason = match e {
                        Error::ClassifierInput { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    warn!(source = %source, reason = %reason, "dropping malformed check report");
                    classification.dropped.push(DroppedSource {
                        source: source.clone(),
                        reason,
                    });
                }
            }
        }

        escalate_shared_locations(&mut classification.findings);
        classification.findings.sort_by(Finding::canonical_cmp);
        classification.findings.dedup_by(|later, kept| {
            if later.canonical_cmp(kept).is_eq() {
                kept.severity = kept.severity.max(later.severity);
                true
            } else {
                false
            }
        });

        classification
    }
}

/// Within one source, every finding at a location takes the highest severity reported there.
///
/// Findings are promoted rather than merged: each keeps its message, so the stuck detector
/// still sees every message at a blocking location, and the promoted set is stable from one
/// round to the next as long as the same findings are reported.
fn escalate_shared_locations(findings: &mut [Finding]) {
    let mut strongest: HashMap<(String, Location), Severity> = HashMap::new();
    for finding in findings.iter() {
        if let Some(ref loc) = finding.location {
            let entry = strongest
                .entry((finding.source.clone(), loc.clone()))
                .or_insert(finding.severity);
            *entry = (*entry).max(finding.severity);
        }
    }

    for finding in findings.iter_mut() {
        if let Some(ref loc) = finding.location
            && let Some(severity) = strongest.get(&(finding.source.clone(), loc.clone()))
        {
            finding.severity = *severity;
        }
    }
}

fn findings_for(
    source: &str,
    report: &StructuredReport,
    coverage_threshold: Option<f64>,
) -> Vec<Finding> {
    match report {
        StructuredReport::Tests(tests) => tests
            .failures
            .iter()
            .map(|f| {
                Finding::new(
                    source,
                    Severity::Blocking,
                    format!("{}: {}", f.test_name, f.message.trim()),
                    f.file.as_ref().map(|file| Location::new(file, f.line)),
                )
            })
            .collect(),
        StructuredReport::Lint(lint) => lint
            .errors
            .iter()
            .map(|v| {
                let message = if v.code.is_empty() {
                    v.message.clone()
                } else {
                    format!("{} {}", v.code, v.message)
                };
                Finding::new(
                    source,
                    Severity::NonBlocking,
                    message,
                    Some(Location::new(&v.file, v.line)),
                )
            })
            .collect(),
        StructuredReport::Format(format) => format
            .files
            .iter()
            .map(|file| {
                Finding::new(
                    source,
                    Severity::NonBlocking,
                    "file is not formatted",
                    Some(Location::new(file, None)),
                )
            })
            .collect(),
        StructuredReport::Types(types) => types
            .errors
            .iter()
            .map(|d| {
                let severity = match d.severity {
                    DiagnosticLevel::Error => Severity::Blocking,
                    DiagnosticLevel::Warning | DiagnosticLevel::Note => Severity::NonBlocking,
                };
                Finding::new(
                    source,
                    severity,
                    d.message.clone(),
                    Some(Location::new(&d.file, d.line)),
                )
            })
            .collect(),
        StructuredReport::Security(security) => security
            .issues
            .iter()
            .map(|issue| {
                let severity = if issue.severity >= RiskLevel::Medium {
                    Severity::Blocking
                } else {
                    Severity::NonBlocking
                };
                let message = if issue.test_id.is_empty() {
                    format!("{} ({})", issue.message, issue.severity.label())
                } else {
                    format!(
                        "[{}] {} ({})",
                        issue.test_id,
                        issue.message,
                        issue.severity.label()
                    )
                };
                Finding::new(
                    source,
                    severity,
                    message,
                    Some(Location::new(&issue.filename, issue.line)),
                )
            })
            .collect(),
        StructuredReport::Dependencies(deps) => deps
            .vulnerabilities
            .iter()
            .map(|v| {
                let severity = if v.severity >= RiskLevel::High {
                    Severity::Blocking
                } else {
                    Severity::NonBlocking
                };
                let mut message = format!("{}: {} ({})", v.package, v.id, v.severity.label());
                if !v.description.is_empty() {
                    message.push_str(&format!(" {}", v.description));
                }
                Finding::new(source, severity, message, None)
            })
            .collect(),
        StructuredReport::Coverage(coverage) => match coverage_threshold {
            Some(threshold) if coverage.total_percent < threshold => vec![Finding::new(
                source,
                Severity::Blocking,
                format!(
                    "coverage {:.1}% is below the required {:.1}%",
                    coverage.total_percent, threshold
                ),
                None,
            )],
            _ => Vec::new(),
        },
    }
}
