use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("commit conflict for {task_id}: expected revision {expected}, found {found}")]
    Conflict {
        task_id: String,
        expected: u64,
        found: u64,
    },

    #[error("rate limit exceeded after waiting {waited:?}")]
    RateLimitExceeded { waited: Duration },

    #[error("generation error: {0}")]
    Generation(String),

    #[error("external service error: {0}")]
    ExternalService(String),

    #[error("malformed {check} report: {reason}")]
    ClassifierInput { check: String, reason: String },

    #[error("state store error: {0}")]
    Store(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("invalid task id: {0}")]
    TaskId(String),
}

impl Error {
    /// Errors the caller may resolve by resubmitting the same trigger later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RateLimitExceeded { .. } | Error::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
