use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::finding::Finding;
use crate::ledger::{ActionKind, Outcome};
use crate::templates::{RenderContext, TemplateEngine, TemplateKind};

const GITHUB_API_URL: &str = "https://api.github.com";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

pub const LABEL_APPROVED: &str = "agent:approved";
pub const LABEL_IN_PROGRESS: &str = "agent:in-progress";
pub const LABEL_STUCK: &str = "agent:stuck";
pub const LABEL_MAX_ITERATIONS: &str = "agent:max-iterations";
pub const LABEL_FAILED: &str = "agent:failed";

/// An externally visible loop outcome, delivered once per action identity.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub task_id: String,
    pub kind: ActionKind,
    pub iteration: u32,
    pub max_iterations: u32,
    pub blocking: Vec<Finding>,
    pub change_summary: Option<String>,
    pub error: Option<String>,
}

impl ReviewOutcome {
    pub fn new(task_id: &str, kind: ActionKind, iteration: u32, max_iterations: u32) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind,
            iteration,
            max_iterations,
            blocking: Vec::new(),
            change_summary: None,
            error: None,
        }
    }

    fn template_kind(&self) -> TemplateKind {
        match self.kind {
            ActionKind::Approve => TemplateKind::Approve,
            ActionKind::RepairRequested => TemplateKind::RepairRequested,
            ActionKind::Stuck => TemplateKind::Stuck,
            ActionKind::LimitReached => TemplateKind::LimitReached,
            ActionKind::Failed => TemplateKind::Failed,
        }
    }

    /// Render the comment or review body for this outcome.
    pub fn render_body(&self, templates: &TemplateEngine) -> Result<String> {
        let mut ctx = RenderContext::new(&self.task_id, self.iteration, self.max_iterations)
            .with_findings(&self.blocking);
        if let Some(ref summary) = self.change_summary {
            ctx = ctx.with_summary(summary.clone());
        }
        if let Some(ref error) = self.error {
            ctx = ctx.with_error(error.clone());
        }
        templates.render(self.template_kind(), &ctx)
    }
}

/// Applies loop outcomes to the hosting service (reviews, comments, labels).
pub trait ReviewClient: Send + Sync {
    fn apply_outcome(
        &self,
        outcome: &ReviewOutcome,
    ) -> impl Future<Output = Result<Outcome>> + Send;
}

/// Parse a `gh-<number>` task id into a pull request number.
pub fn pull_number(task_id: &str) -> Result<u64> {
    task_id
        .strip_prefix("gh-")
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| Error::TaskId(format!("{task_id} (expected gh-<number>)")))
}

// ---------------------------------------------------------------------------
// REST transport (for testability)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ApiCall {
    pub method: &'static str,
    pub path: String,
    pub body: Option<serde_json::Value>,
    /// Treat 404 as success (e.g. removing a label that is not set).
    pub tolerate_missing: bool,
}

impl ApiCall {
    fn post(path: String, body: serde_json::Value) -> Self {
        Self {
            method: "POST",
            path,
            body: Some(body),
            tolerate_missing: false,
        }
    }

    fn delete_tolerant(path: String) -> Self {
        Self {
            method: "DELETE",
            path,
            body: None,
            tolerate_missing: true,
        }
    }
}

pub trait GitHubApi: Send + Sync {
    /// Perform one call. `Ok(None)` means a tolerated 404.
    fn send(&self, call: &ApiCall) -> Result<Option<serde_json::Value>>;
}

pub struct UreqGitHubApi {
    token: String,
    base_url: String,
}

impl UreqGitHubApi {
    pub fn new(token: String) -> Self {
        Self::with_base_url(token, GITHUB_API_URL.to_string())
    }

    pub fn with_base_url(token: String, base_url: String) -> Self {
        Self { token, base_url }
    }

    /// Read the token from `GITHUB_TOKEN`.
    pub fn from_env() -> Result<Self> {
        std::env::var("GITHUB_TOKEN")
            .map(Self::new)
            .map_err(|_| Error::ExternalService("GITHUB_TOKEN is not set".to_string()))
    }
}

impl GitHubApi for UreqGitHubApi {
    fn send(&self, call: &ApiCall) -> Result<Option<serde_json::Value>> {
        let url = format!("{}{}", self.base_url, call.path);
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        for attempt in 1..=MAX_RETRIES {
            let request = ureq::request(call.method, &url)
                .set("Authorization", &format!("Bearer {}", self.token))
                .set("Accept", "application/vnd.github+json")
                .set("X-GitHub-Api-Version", "2022-11-28")
                .set("User-Agent", "reviewloop");
            let result = match call.body {
                Some(ref body) => request.send_json(body),
                None => request.call(),
            };
            match result {
                Ok(response) => {
                    if response.status() == 204 {
                        return Ok(Some(serde_json::Value::Null));
                    }
                    let json: serde_json::Value = response.into_json().map_err(|e| {
                        Error::ExternalService(format!("failed to parse GitHub response: {e}"))
                    })?;
                    return Ok(Some(json));
                }
                Err(ureq::Error::Status(404, _)) if call.tolerate_missing => {
                    debug!(path = %call.path, "ignoring 404");
                    return Ok(None);
                }
                Err(ref e) if attempt < MAX_RETRIES && is_retryable(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        backoff_ms,
                        "retrying GitHub API after transient error"
                    );
                    thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms *= 2;
                }
                Err(e) => {
                    return Err(Error::ExternalService(format!(
                        "GitHub {} {} failed: {e}",
                        call.method, call.path
                    )));
                }
            }
        }
        Err(Error::ExternalService(format!(
            "GitHub {} {} failed after {MAX_RETRIES} attempts",
            call.method, call.path
        )))
    }
}

/// Only retry rate-limits (429), server errors (5xx), and transport/network errors.
fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        ureq::Error::Transport(_) => true,
    }
}

// ---------------------------------------------------------------------------
// GitHub pull request client
// ---------------------------------------------------------------------------

pub struct GitHubReviewClient<A: GitHubApi> {
    repository: String,
    api: Arc<A>,
    templates: TemplateEngine,
}

impl<A: GitHubApi + 'static> GitHubReviewClient<A> {
    pub fn new(repository: String, api: A, templates: TemplateEngine) -> Self {
        Self {
            repository,
            api: Arc::new(api),
            templates,
        }
    }

    /// The REST calls that make `outcome` visible on its pull request.
    pub fn plan(&self, outcome: &ReviewOutcome) -> Result<Vec<ApiCall>> {
        let number = pull_number(&outcome.task_id)?;
        let body = outcome.render_body(&self.templates)?;
        let repo = &self.repository;
        let reviews = format!("/repos/{repo}/pulls/{number}/reviews");
        let comments = format!("/repos/{repo}/issues/{number}/comments");
        let labels = format!("/repos/{repo}/issues/{number}/labels");
        let remove = |label: &str| ApiCall::delete_tolerant(format!("{labels}/{label}"));
        let add = |names: Vec<String>| ApiCall::post(labels.clone(), serde_json::json!({ "labels": names }));

        let calls = match outcome.kind {
            ActionKind::Approve => vec![
                ApiCall::post(reviews, serde_json::json!({ "event": "APPROVE", "body": body })),
                remove(LABEL_IN_PROGRESS),
                add(vec![LABEL_APPROVED.to_string()]),
            ],
            ActionKind::RepairRequested => {
                let mut calls = vec![ApiCall::post(
                    reviews,
                    serde_json::json!({ "event": "REQUEST_CHANGES", "body": body }),
                )];
                if outcome.iteration > 1 {
                    calls.push(remove(&format!("iteration-{}", outcome.iteration - 1)));
                }
                calls.push(add(vec![
                    LABEL_IN_PROGRESS.to_string(),
                    format!("iteration-{}", outcome.iteration),
                ]));
                calls
            }
            ActionKind::Stuck => vec![
                ApiCall::post(comments, serde_json::json!({ "body": body })),
                remove(LABEL_IN_PROGRESS),
                add(vec![LABEL_STUCK.to_string()]),
            ],
            ActionKind::LimitReached => vec![
                ApiCall::post(comments, serde_json::json!({ "body": body })),
                remove(LABEL_IN_PROGRESS),
                add(vec![LABEL_MAX_ITERATIONS.to_string()]),
            ],
            ActionKind::Failed => vec![
                ApiCall::post(comments, serde_json::json!({ "body": body })),
                remove(LABEL_IN_PROGRESS),
                add(vec![LABEL_FAILED.to_string()]),
            ],
        };
        Ok(calls)
    }
}

impl<A: GitHubApi + 'static> ReviewClient for GitHubReviewClient<A> {
    async fn apply_outcome(&self, outcome: &ReviewOutcome) -> Result<Outcome> {
        let calls = self.plan(outcome)?;
        let api = Arc::clone(&self.api);
        let reference = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let mut reference = None;
            for call in &calls {
                let response = api.send(call)?;
                if reference.is_none() {
                    reference = response
                        .as_ref()
                        .and_then(|v| v.get("html_url"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                }
            }
            Ok(reference)
        })
        .await
        .map_err(|e| Error::ExternalService(format!("GitHub worker failed: {e}")))??;

        info!(
            task_id = %outcome.task_id,
            kind = %outcome.kind,
            iteration = outcome.iteration,
            "outcome published"
        );
        let summary = format!("{} on {}", outcome.kind, outcome.task_id);
        Ok(match reference {
            Some(url) => Outcome::new(summary).with_reference(url),
            None => Outcome::new(summary),
        })
    }
}

/// Logs outcomes instead of publishing them.
#[derive(Default)]
pub struct DryRunReviewClient {
    templates: TemplateEngine,
}

impl DryRunReviewClient {
    pub fn new(templates: TemplateEngine) -> Self {
        Self { templates }
    }
}

impl ReviewClient for DryRunReviewClient {
    async fn apply_outcome(&self, outcome: &ReviewOutcome) -> Result<Outcome> {
        let body = outcome.render_body(&self.templates)?;
        info!(
            task_id = %outcome.task_id,
            kind = %outcome.kind,
            iteration = outcome.iteration,
            "[dry-run] would publish:\n{body}"
        );
        Ok(Outcome::new(format!(
            "dry-run {} on {}",
            outcome.kind, outcome.task_id
        )))
    }
}
