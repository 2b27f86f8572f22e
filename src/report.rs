use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Which kind of quality check a source reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Tests,
    Lint,
    Format,
    Types,
    Security,
    Dependencies,
    Coverage,
}

impl ReportKind {
    /// Resolve a source name (canonical tag or tool name) to its report kind.
    pub fn from_source(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "tests" | "test" | "pytest" => Some(ReportKind::Tests),
            "lint" | "ruff" => Some(ReportKind::Lint),
            "format" | "formatting" => Some(ReportKind::Format),
            "types" | "type" | "mypy" => Some(ReportKind::Types),
            "security" | "bandit" => Some(ReportKind::Security),
            "dependencies" | "dependency" | "pip_audit" | "pip-audit" => {
                Some(ReportKind::Dependencies)
            }
            "coverage" => Some(ReportKind::Coverage),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Tests => "tests",
            ReportKind::Lint => "lint",
            ReportKind::Format => "format",
            ReportKind::Types => "types",
            ReportKind::Security => "security",
            ReportKind::Dependencies => "dependencies",
            ReportKind::Coverage => "coverage",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Structured report shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TestFailure {
    #[serde(default = "unknown")]
    pub test_name: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    #[serde(default = "test_failed")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct TestReport {
    #[serde(default)]
    pub failures: Vec<TestFailure>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LintViolation {
    pub file: String,
    pub line: Option<u32>,
    #[serde(default)]
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct LintReport {
    #[serde(default)]
    pub errors: Vec<LintViolation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct FormatReport {
    /// Files whose formatting differs from the formatter's output.
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    #[default]
    #[serde(alias = "ERROR", alias = "Error")]
    Error,
    #[serde(alias = "WARNING", alias = "Warning")]
    Warning,
    #[serde(alias = "NOTE", alias = "Note")]
    Note,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypeDiagnostic {
    pub file: String,
    pub line: Option<u32>,
    pub message: String,
    #[serde(default)]
    pub severity: DiagnosticLevel,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct TypeReport {
    #[serde(default)]
    pub errors: Vec<TypeDiagnostic>,
}

/// Vulnerability severity shared by security scanners and dependency audits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[serde(alias = "LOW", alias = "Low")]
    Low,
    #[default]
    #[serde(alias = "MEDIUM", alias = "Medium", alias = "moderate", alias = "MODERATE")]
    Medium,
    #[serde(alias = "HIGH", alias = "High")]
    High,
    #[serde(alias = "CRITICAL", alias = "Critical")]
    Critical,
}

impl RiskLevel {
    pub fn label(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SecurityIssue {
    #[serde(alias = "file")]
    pub filename: String,
    pub line: Option<u32>,
    pub severity: RiskLevel,
    #[serde(default)]
    pub test_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct SecurityReport {
    #[serde(default)]
    pub issues: Vec<SecurityIssue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Vulnerability {
    pub package: String,
    #[serde(alias = "vulnerability")]
    pub id: String,
    #[serde(default)]
    pub severity: RiskLevel,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct DependencyReport {
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CoverageReport {
    pub total_percent: f64,
}

/// A check result already parsed out of its tool-specific format.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredReport {
    Tests(TestReport),
    Lint(LintReport),
    Format(FormatReport),
    Types(TypeReport),
    Security(SecurityReport),
    Dependencies(DependencyReport),
    Coverage(CoverageReport),
}

fn unknown() -> String {
    "unknown".to_string()
}

fn test_failed() -> String {
    "Test failed".to_string()
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Turns one source's raw report text into a [`StructuredReport`].
pub trait CheckReportParser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<StructuredReport>;
}

/// Parses the normalized JSON summary each CI step uploads.
pub struct JsonReportParser {
    kind: ReportKind,
}

impl JsonReportParser {
    pub fn new(kind: ReportKind) -> Self {
        Self { kind }
    }

    fn decode<T: DeserializeOwned>(&self, raw: &str) -> Result<T> {
        serde_json::from_str(raw).map_err(|e| Error::ClassifierInput {
            check: self.kind.to_string(),
            reason: e.to_string(),
        })
    }
}

impl CheckReportParser for JsonReportParser {
    fn parse(&self, raw: &str) -> Result<StructuredReport> {
        let report = match self.kind {
            ReportKind::Tests => StructuredReport::Tests(self.decode(raw)?),
            ReportKind::Lint => StructuredReport::Lint(self.decode(raw)?),
            ReportKind::Format => StructuredReport::Format(self.decode(raw)?),
            ReportKind::Types => StructuredReport::Types(self.decode(raw)?),
            ReportKind::Security => StructuredReport::Security(self.decode(raw)?),
            ReportKind::Dependencies => StructuredReport::Dependencies(self.decode(raw)?),
            ReportKind::Coverage => {
                let coverage: CoverageReport = self.decode(raw)?;
                if !(0.0..=100.0).contains(&coverage.total_percent) {
                    return Err(Error::ClassifierInput {
                        check: self.kind.to_string(),
                        reason: format!(
                            "total_percent {} is outside 0..=100",
                            coverage.total_percent
                        ),
                    });
                }
                StructuredReport::Coverage(coverage)
            }
        };
        Ok(report)
    }
}

/// Maps source names to the parser responsible for them.
pub struct ParserRegistry {
    parsers: HashMap<String, Box<dyn CheckReportParser>>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserRegistry {
    /// Empty registry; every source falls back to [`ReportKind::from_source`].
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Override the parser used for a source name.
    pub fn register(&mut self, source: &str, parser: impl CheckReportParser + 'static) {
        self.parsers
            .insert(source.to_lowercase(), Box::new(parser));
    }

    pub fn parse(&self, source: &str, raw: &str) -> Result<StructuredReport> {
        let relabel = |e: Error| match e {
            Error::ClassifierInput { reason, .. } => Error::ClassifierInput {
                check: source.to_string(),
                reason,
            },
            other => other,
        };

        if let Some(parser) = self.parsers.get(&source.to_lowercase()) {
            return parser.parse(raw).map_err(relabel);
        }

        let kind = ReportKind::from_source(source).ok_or_else(|| Error::ClassifierInput {
            check: source.to_string(),
            reason: "unknown check source".to_string(),
        })?;
        JsonReportParser::new(kind).parse(raw).map_err(relabel)
    }
}
