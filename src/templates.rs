use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::finding::Finding;

const DEFAULT_REPAIR_PROMPT: &str = include_str!("default_templates/repair-prompt.md");
const DEFAULT_APPROVE: &str = include_str!("default_templates/approve.md");
const DEFAULT_REPAIR_REQUESTED: &str = include_str!("default_templates/repair-requested.md");
const DEFAULT_STUCK: &str = include_str!("default_templates/stuck.md");
const DEFAULT_LIMIT_REACHED: &str = include_str!("default_templates/limit-reached.md");
const DEFAULT_FAILED: &str = include_str!("default_templates/failed.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    RepairPrompt,
    Approve,
    RepairRequested,
    Stuck,
    LimitReached,
    Failed,
}

impl TemplateKind {
    pub fn name(&self) -> &'static str {
        match self {
            TemplateKind::RepairPrompt => "repair-prompt",
            TemplateKind::Approve => "approve",
            TemplateKind::RepairRequested => "repair-requested",
            TemplateKind::Stuck => "stuck",
            TemplateKind::LimitReached => "limit-reached",
            TemplateKind::Failed => "failed",
        }
    }

    fn default_source(&self) -> &'static str {
        match self {
            TemplateKind::RepairPrompt => DEFAULT_REPAIR_PROMPT,
            TemplateKind::Approve => DEFAULT_APPROVE,
            TemplateKind::RepairRequested => DEFAULT_REPAIR_REQUESTED,
            TemplateKind::Stuck => DEFAULT_STUCK,
            TemplateKind::LimitReached => DEFAULT_LIMIT_REACHED,
            TemplateKind::Failed => DEFAULT_FAILED,
        }
    }

    fn file_name(&self) -> String {
        format!("{}.md", self.name())
    }
}

/// A finding flattened for templates.
#[derive(Debug, Clone, Serialize)]
pub struct FindingView {
    pub source: String,
    pub severity: &'static str,
    pub has_location: bool,
    pub location: String,
    pub message: String,
}

impl From<&Finding> for FindingView {
    fn from(f: &Finding) -> Self {
        Self {
            source: f.source.clone(),
            severity: f.severity.label(),
            has_location: f.location.is_some(),
            location: f.location.as_ref().map(|l| l.to_string()).unwrap_or_default(),
            message: f.message.clone(),
        }
    }
}

/// Values available to every template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderContext {
    pub task_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub findings: Vec<FindingView>,
    pub has_summary: bool,
    pub summary: String,
    pub error: String,
}

impl RenderContext {
    pub fn new(task_id: &str, iteration: u32, max_iterations: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            iteration,
            max_iterations,
            ..Self::default()
        }
    }

    pub fn with_findings<'a>(mut self, findings: impl IntoIterator<Item = &'a Finding>) -> Self {
        self.findings = findings.into_iter().map(FindingView::from).collect();
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self.has_summary = !self.summary.is_empty();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }
}

/// Template loader with embedded defaults and user overrides.
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    override_dir: Option<PathBuf>,
}

impl TemplateEngine {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        Self { override_dir }
    }

    /// Template source for `kind`. A file in the override directory takes precedence.
    pub fn load_template(&self, kind: TemplateKind) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(kind.file_name());
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|e| {
                    Error::Template(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                });
            }
        }
        Ok(kind.default_source().to_string())
    }

    pub fn render(&self, kind: TemplateKind, ctx: &RenderContext) -> Result<String> {
        let source = self.load_template(kind)?;
        render_template(kind.name(), source, ctx)
    }
}

/// Compile and render one template. Unknown variables are errors.
pub fn render_template(name: &str, source: String, ctx: &RenderContext) -> Result<String> {
    let mut engine = upon::Engine::new();
    engine
        .add_template(name.to_string(), source)
        .map_err(|e| Error::Template(format!("invalid template {name}: {e}")))?;
    engine
        .template(name)
        .render(ctx)
        .to_string()
        .map_err(|e| Error::Template(format!("failed to render {name}: {e}")))
}
