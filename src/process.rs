use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const KILL_GRACE: Duration = Duration::from_millis(500);

/// How to run one child process.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
    pub log_label: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self {
            log_label: program.clone(),
            program,
            args: Vec::new(),
            working_dir: working_dir.into(),
            timeout: None,
            stdin: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr_lines: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    /// Last few stderr lines, for error messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let start = self.stderr_lines.len().saturating_sub(lines);
        self.stderr_lines[start..].join("\n")
    }
}

/// Run a child in its own process group, collecting stdout and logging stderr.
///
/// On timeout the whole group receives SIGTERM, then SIGKILL.
pub async fn run_command(spec: CommandSpec) -> Result<CommandOutput> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", spec.program)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process("child has no pid".into()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Process("stdout not piped".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Process("stderr not piped".into()))?;

    let label_out = spec.log_label.clone();
    let stdout_task = tokio::spawn(async move {
        let mut collected = String::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{label_out}] {line}");
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    });

    let label_err = spec.log_label.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            warn!("[{label_err}] {line}");
            lines.push(line);
        }
        lines
    });

    if let Some(input) = spec.stdin {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("stdin not piped".into()))?;
        // A child that exits without reading stdin is reported through its exit status.
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            debug!(label = %spec.log_label, "stdin write failed: {e}");
        }
        drop(stdin);
    }

    let status = match spec.timeout {
        Some(dur) => match tokio::time::timeout(dur, child.wait()).await {
            Ok(r) => r.map_err(|e| Error::Process(format!("wait error: {e}")))?,
            Err(_) => {
                kill_group(pid, KILL_GRACE).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::Process(format!(
                    "'{}' timed out after {dur:?}",
                    spec.program
                )));
            }
        },
        None => child
            .wait()
            .await
            .map_err(|e| Error::Process(format!("wait error: {e}")))?,
    };

    let stdout = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (exit_code, signal) = exit_info(&status);
    Ok(CommandOutput {
        exit_code,
        signal,
        stdout,
        stderr_lines,
    })
}

#[cfg(unix)]
async fn kill_group(pid: u32, grace: Duration) {
    let pgid = pid as i32;
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
    tokio::time::sleep(grace).await;
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn kill_group(_pid: u32, _grace: Duration) {}

fn exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}
