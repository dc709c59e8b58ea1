use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use imgpipe_util::{DeadlineExceeded, block_on_with_timeout};
use tracing::{debug, warn};

/// A process invocation handed to a [`CommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Wall-clock limit; the child is killed when it expires.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// `<shell> -c <script>`.
    pub fn shell(shell: &str, script: impl Into<String>) -> Self {
        Self::new(shell).arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program and arguments joined for logs.
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished (or abandoned) process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal or timed out.
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status_code: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failure(status_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status_code == Some(0)
    }

    /// Human-readable reason for a failed command.
    pub fn failure_reason(&self, program: &str) -> String {
        if self.timed_out {
            return format!("'{program}' timed out");
        }
        let stderr = self.stderr.trim();
        let status = match self.status_code {
            Some(code) => format!("exited with status {code}"),
            None => "was terminated by a signal".to_string(),
        };
        if stderr.is_empty() {
            format!("'{program}' {status}")
        } else {
            format!("'{program}' {status}: {stderr}")
        }
    }
}

/// Executes external commands for handlers and hooks.
///
/// Implementations must be shareable across the worker threads a batch
/// handler fans out to.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;
}

/// Spawns real processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %command.display_line(), timeout = ?command.timeout, "spawning command");

        let mut process = tokio::process::Command::new(&command.program);
        process
            .args(&command.args)
            .envs(command.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            process.current_dir(dir);
        }

        let program = command.program.clone();
        let result = block_on_with_timeout(
            async move {
                let output = process
                    .output()
                    .await
                    .with_context(|| format!("failed to spawn '{program}'"))?;
                Ok(CommandOutput {
                    status_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    timed_out: false,
                })
            },
            command.timeout,
        );

        match result {
            Err(error) if error.downcast_ref::<DeadlineExceeded>().is_some() => {
                warn!(command = %command.display_line(), timeout = ?command.timeout, "command timed out and was killed");
                Ok(CommandOutput::timed_out())
            }
            other => other,
        }
    }
}

/// Records commands and reports success without spawning anything.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    recorded: Mutex<Vec<CommandSpec>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands seen so far, in call order.
    pub fn recorded(&self) -> Vec<CommandSpec> {
        self.recorded.lock().map(|recorded| recorded.clone()).unwrap_or_default()
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %command.display_line(), "dry run: not spawning");
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push(command.clone());
        }
        Ok(CommandOutput::success(String::new()))
    }
}
