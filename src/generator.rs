use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::finding::Finding;
use crate::process::{CommandSpec, run_command};
use crate::templates::{RenderContext, TemplateEngine, TemplateKind};

/// Candidate change produced by one repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
}

/// Input to one repair round.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub task_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub blocking: Vec<Finding>,
}

/// Produces a change set that addresses a task's Blocking findings.
pub trait GeneratorClient: Send + Sync {
    fn repair(&self, request: &RepairRequest) -> impl Future<Output = Result<ChangeSet>> + Send;
}

/// Runs an agent CLI with a rendered repair prompt on stdin and parses its JSON reply.
pub struct CommandGenerator {
    binary: String,
    model: Option<String>,
    timeout: Option<Duration>,
    working_dir: PathBuf,
    templates: TemplateEngine,
}

impl CommandGenerator {
    pub fn new(
        binary: String,
        model: Option<String>,
        timeout: Option<Duration>,
        working_dir: PathBuf,
        templates: TemplateEngine,
    ) -> Self {
        Self {
            binary,
            model,
            timeout,
            working_dir,
            templates,
        }
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }

    pub fn render_prompt(&self, request: &RepairRequest) -> Result<String> {
        let ctx = RenderContext::new(&request.task_id, request.iteration, request.max_iterations)
            .with_findings(&request.blocking);
        self.templates.render(TemplateKind::RepairPrompt, &ctx)
    }
}

impl GeneratorClient for CommandGenerator {
    async fn repair(&self, request: &RepairRequest) -> Result<ChangeSet> {
        let prompt = self
            .render_prompt(request)
            .map_err(|e| Error::Generation(e.to_string()))?;

        let mut spec = CommandSpec::new(self.binary.clone(), self.working_dir.clone())
            .args(self.build_args())
            .stdin(prompt);
        if let Some(timeout) = self.timeout {
            spec = spec.timeout(timeout);
        }
        spec.log_label = format!("repair {}", request.task_id);

        info!(
            task_id = %request.task_id,
            iteration = request.iteration,
            blocking = request.blocking.len(),
            "requesting repair"
        );
        let output = run_command(spec)
            .await
            .map_err(|e| Error::Generation(e.to_string()))?;

        if !output.success() {
            return Err(Error::Generation(format!(
                "{} exited with code {}: {}",
                self.binary,
                output.exit_code,
                output.stderr_tail(5)
            )));
        }
        parse_change_set(&output.stdout)
    }
}

/// Parse the agent's reply, tolerating code fences and surrounding prose.
pub fn parse_change_set(raw: &str) -> Result<ChangeSet> {
    let body = strip_markdown_fences(raw);
    if let Ok(change_set) = serde_json::from_str::<ChangeSet>(&body) {
        return Ok(change_set);
    }
    let object = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => {
            return Err(Error::Generation(
                "generator reply contained no JSON object".to_string(),
            ));
        }
    };
    serde_json::from_str(object)
        .map_err(|e| Error::Generation(format!("failed to parse generator reply: {e}")))
}

fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let Some(newline) = rest.find('\n') else {
        return String::new();
    };
    let inner = &rest[newline + 1..];
    match inner.rfind("```") {
        Some(end) => inner[..end].trim().to_string(),
        None => inner.trim().to_string(),
    }
}
