use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::cli::Cli;
use crate::controller::LoopSettings;
use crate::error::{Error, Result};
use crate::rate_limit::{RateLimitPolicy, RateLimitScope};

pub const DEFAULT_CONFIG_FILE: &str = "reviewloop.toml";

const REPOSITORY_PATTERN: &str = r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$";

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub max_iterations: Option<u32>,
    pub similarity_threshold: Option<f64>,
    pub min_coverage_percent: Option<f64>,
    pub rate_limit_quota: Option<usize>,
    pub rate_limit_window_secs: Option<u64>,
    pub rate_limit_max_wait_secs: Option<u64>,
    pub rate_limit_scope: Option<RateLimitScope>,
    pub generator_timeout_secs: Option<u64>,
    pub generator_binary: Option<String>,
    pub generator_model: Option<String>,
    pub state_dir: Option<String>,
    pub template_dir: Option<String>,
    pub repository: Option<String>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub max_iterations: u32,
    pub similarity_threshold: f64,
    pub min_coverage_percent: Option<f64>,
    pub rate_limit_quota: usize,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_wait_secs: u64,
    pub rate_limit_scope: RateLimitScope,
    pub generator_timeout_secs: u64,
    pub generator_binary: String,
    pub generator_model: Option<String>,
    pub state_dir: PathBuf,
    pub template_dir: Option<PathBuf>,
    pub repository: Option<String>,
    pub dry_run: bool,
}

impl Config {
    /// Read the config file (if any), apply CLI overrides, and validate.
    ///
    /// A missing default file is fine; a missing file named with `--config` is an error.
    pub fn load(cli: &Cli) -> Result<Self> {
        let (path, explicit) = match cli.config {
            Some(ref p) => (Path::new(p), true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };
        let file_config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            parse_config(&content)?
        } else if explicit {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        } else {
            ConfigFile::default()
        };

        let config = merge(file_config, cli);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.max_iterations) {
            return Err(Error::ConfigValidation(format!(
                "max_iterations must be between 1 and 10, got {}",
                self.max_iterations
            )));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::ConfigValidation(format!(
                "similarity_threshold must be between 0.0 and 1.0, got {}",
                self.similarity_threshold
            )));
        }
        if let Some(pct) = self.min_coverage_percent
            && !(0.0..=100.0).contains(&pct)
        {
            return Err(Error::ConfigValidation(format!(
                "min_coverage_percent must be between 0 and 100, got {pct}"
            )));
        }
        if self.rate_limit_quota == 0 {
            return Err(Error::ConfigValidation(
                "rate_limit_quota must be > 0".to_string(),
            ));
        }
        if self.rate_limit_window_secs == 0 {
            return Err(Error::ConfigValidation(
                "rate_limit_window_secs must be > 0".to_string(),
            ));
        }
        if self.generator_timeout_secs == 0 {
            return Err(Error::ConfigValidation(
                "generator_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.generator_binary.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "generator_binary must not be empty".to_string(),
            ));
        }
        if let Some(ref repo) = self.repository
            && !Regex::new(REPOSITORY_PATTERN)
                .map_err(|e| Error::ConfigValidation(e.to_string()))?
                .is_match(repo)
        {
            return Err(Error::ConfigValidation(format!(
                "repository must look like owner/repo, got '{repo}'"
            )));
        }
        Ok(())
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            quota: self.rate_limit_quota,
            window: Duration::from_secs(self.rate_limit_window_secs),
            max_wait: Duration::from_secs(self.rate_limit_max_wait_secs),
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            similarity_threshold: self.similarity_threshold,
            min_coverage_percent: self.min_coverage_percent,
            generator_timeout: Duration::from_secs(self.generator_timeout_secs),
        }
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    Ok(toml::from_str(content)?)
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Config {
    Config {
        max_iterations: cli.max_iterations.or(file.max_iterations).unwrap_or(5),
        similarity_threshold: cli
            .similarity_threshold
            .or(file.similarity_threshold)
            .unwrap_or(0.70),
        min_coverage_percent: cli.min_coverage.or(file.min_coverage_percent),
        rate_limit_quota: file.rate_limit_quota.unwrap_or(10),
        rate_limit_window_secs: file.rate_limit_window_secs.unwrap_or(60),
        rate_limit_max_wait_secs: file.rate_limit_max_wait_secs.unwrap_or(120),
        rate_limit_scope: file.rate_limit_scope.unwrap_or_default(),
        generator_timeout_secs: cli
            .generator_timeout
            .or(file.generator_timeout_secs)
            .unwrap_or(1800),
        generator_binary: cli
            .generator_binary
            .clone()
            .or(file.generator_binary)
            .unwrap_or_else(|| "claude".to_string()),
        generator_model: cli.generator_model.clone().or(file.generator_model),
        state_dir: PathBuf::from(
            cli.state_dir
                .clone()
                .or(file.state_dir)
                .unwrap_or_else(|| ".reviewloop/state".to_string()),
        ),
        template_dir: cli
            .template_dir
            .clone()
            .or(file.template_dir)
            .map(PathBuf::from),
        repository: cli.repository.clone().or(file.repository),
        dry_run: cli.dry_run || file.dry_run.unwrap_or(false),
    }
}
