use clap::{Parser, Subcommand};

/// Iteration control for automated review and repair loops
#[derive(Parser, Debug, Clone)]
#[command(name = "reviewloop", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,

    /// Path to config file (default: reviewloop.toml, optional)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Maximum review rounds per task (1-10)
    #[arg(long, global = true)]
    pub max_iterations: Option<u32>,

    /// Mean similarity above which three rounds count as stuck (0.0-1.0)
    #[arg(long, global = true)]
    pub similarity_threshold: Option<f64>,

    /// Coverage percentage below which coverage reports block approval
    #[arg(long, global = true)]
    pub min_coverage: Option<f64>,

    /// Directory for iteration records and the action ledger
    #[arg(long, global = true)]
    pub state_dir: Option<String>,

    /// Directory with template overrides
    #[arg(long, global = true)]
    pub template_dir: Option<String>,

    /// GitHub repository (owner/repo) that outcomes are published to
    #[arg(long, global = true)]
    pub repository: Option<String>,

    /// Agent binary used for repairs (default: claude)
    #[arg(long, global = true)]
    pub generator_binary: Option<String>,

    /// Model passed to the agent binary
    #[arg(long, global = true)]
    pub generator_model: Option<String>,

    /// Repair timeout in seconds
    #[arg(long, global = true)]
    pub generator_timeout: Option<u64>,

    /// Log outcomes instead of publishing them
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Feed check reports for a task into the loop
    Trigger {
        /// Task id (gh-<pull number>)
        task_id: String,

        /// Check report as <source>=<path>; repeatable
        #[arg(long = "report", value_name = "SOURCE=PATH", required = true, value_parser = parse_report_arg)]
        reports: Vec<(String, String)>,

        /// Delivery id; a redelivery with the same id is ignored
        #[arg(long)]
        delivery_id: Option<String>,
    },

    /// Print the committed record of a task
    Status {
        task_id: String,
    },

    /// Clear a task back to pending
    Reset {
        task_id: String,
    },
}

fn parse_report_arg(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((source, path)) if !source.trim().is_empty() && !path.trim().is_empty() => {
            Ok((source.trim().to_string(), path.trim().to_string()))
        }
        _ => Err(format!("expected <source>=<path>, got '{value}'")),
    }
}
