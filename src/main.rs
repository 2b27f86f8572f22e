use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reviewloop::cli::{Cli, CliCommand};
use reviewloop::config::Config;
use reviewloop::controller::{DecisionOutcome, LoopController, Trigger};
use reviewloop::error::{Error, Result};
use reviewloop::generator::CommandGenerator;
use reviewloop::ledger::FileLedger;
use reviewloop::rate_limit::RateLimiter;
use reviewloop::review::{DryRunReviewClient, GitHubReviewClient, ReviewClient, UreqGitHubApi};
use reviewloop::state::FileStore;
use reviewloop::templates::TemplateEngine;

/// Exit code for errors that resolve by resubmitting the same trigger later.
const EXIT_RETRYABLE: i32 = 75;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    info!(?config, "config loaded");

    let templates = TemplateEngine::new(config.template_dir.clone());
    let result = if config.dry_run {
        run(&cli, &config, DryRunReviewClient::new(templates)).await
    } else {
        match github_client(&config, templates.clone()) {
            Some(client) => run(&cli, &config, client).await,
            None => run(&cli, &config, DryRunReviewClient::new(templates)).await,
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(if e.is_retryable() { EXIT_RETRYABLE } else { 1 });
    }
}

fn github_client(
    config: &Config,
    templates: TemplateEngine,
) -> Option<GitHubReviewClient<UreqGitHubApi>> {
    let Some(ref repository) = config.repository else {
        warn!("no repository configured, outcomes will only be logged");
        return None;
    };
    match UreqGitHubApi::from_env() {
        Ok(api) => Some(GitHubReviewClient::new(repository.clone(), api, templates)),
        Err(e) => {
            warn!(error = %e, "outcomes will only be logged");
            None
        }
    }
}

async fn run<R: ReviewClient>(cli: &Cli, config: &Config, reviewer: R) -> Result<()> {
    let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let generator = CommandGenerator::new(
        config.generator_binary.clone(),
        config.generator_model.clone(),
        Some(Duration::from_secs(config.generator_timeout_secs)),
        working_dir,
        TemplateEngine::new(config.template_dir.clone()),
    );
    let controller = LoopController::new(
        Arc::new(FileStore::new(&config.state_dir, config.max_iterations)),
        Arc::new(FileLedger::new(&config.state_dir)),
        RateLimiter::new(config.rate_limit_policy(), config.rate_limit_scope),
        generator,
        reviewer,
        config.loop_settings(),
    );

    match cli.command {
        CliCommand::Trigger {
            ref task_id,
            ref reports,
            ref delivery_id,
        } => {
            let mut raw = BTreeMap::new();
            for (source, path) in reports {
                match std::fs::read_to_string(path) {
                    Ok(content) => {
                        raw.insert(source.clone(), content);
                    }
                    Err(e) => {
                        let reason = format!("cannot read {path}: {e}");
                        warn!(source = %source, reason = %reason, "dropping unreadable check report");
                    }
                }
            }
            // Deciding on zero reports would approve on no evidence.
            if raw.is_empty() {
                let sources: Vec<&str> = reports.iter().map(|(s, _)| s.as_str()).collect();
                return Err(Error::ClassifierInput {
                    check: sources.join(","),
                    reason: "no report could be read".to_string(),
                });
            }
            let mut trigger = Trigger::new(task_id.clone(), raw);
            if let Some(id) = delivery_id {
                trigger = trigger.with_delivery_id(id.clone());
            }
            let outcome = controller.on_trigger(&trigger).await?;
            println!("{}", describe(task_id, &outcome));
        }
        CliCommand::Status { ref task_id } => {
            let record = controller.status(task_id)?;
            let rendered = toml::to_string_pretty(&record)
                .map_err(|e| Error::Store(format!("failed to render record: {e}")))?;
            print!("{rendered}");
        }
        CliCommand::Reset { ref task_id } => {
            let record = controller.reset(task_id).await?;
            println!("{task_id}: reset to {}", record.status);
        }
    }
    Ok(())
}

fn describe(task_id: &str, outcome: &DecisionOutcome) -> String {
    match outcome {
        DecisionOutcome::Approved { iteration } => {
            format!("{task_id}: approved at iteration {iteration}")
        }
        DecisionOutcome::RepairRequested {
            iteration,
            change_set,
        } => format!(
            "{task_id}: repair requested at iteration {iteration}: {}",
            change_set.summary
        ),
        DecisionOutcome::MaxIterationsReached { iteration } => {
            format!("{task_id}: max iterations reached at iteration {iteration}")
        }
        DecisionOutcome::Stuck {
            iteration,
            mean_similarity,
        } => format!(
            "{task_id}: stuck at iteration {iteration} (similarity {mean_similarity:.2})"
        ),
        DecisionOutcome::Failed { iteration, error } => {
            format!("{task_id}: failed at iteration {iteration}: {error}")
        }
        DecisionOutcome::Ignored { status } => {
            format!("{task_id}: ignored, task is {status}")
        }
        DecisionOutcome::Duplicate { iteration, status } => {
            format!("{task_id}: duplicate trigger, task is {status} at iteration {iteration}")
        }
    }
}
