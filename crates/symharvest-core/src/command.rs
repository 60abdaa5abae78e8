//! External command execution.
//!
//! A [`Command`] is an immutable description of one process launch. The
//! [`CommandRunner`] trait turns it into a [`CommandResult`]; production code
//! uses [`ProcessRunner`], tests inject stubs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command as ProcessCommand;
use tracing::{debug, warn};

use crate::error::{HarvestError, HarvestResult};

/// Exit code reported for a command terminated by its timeout.
pub const TIMED_OUT_EXIT_CODE: i32 = -1;

/// A program invocation: executable, ordered arguments and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: String,
    args: Vec<String>,
    working_directory: PathBuf,
}

impl Command {
    pub fn new(program: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_directory: working_directory.into(),
        }
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

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured outcome of a command that ran to completion or was timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    duration: Duration,
}

impl CommandResult {
    pub fn new(exit_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    /// Result for a command killed after exceeding `limit`.
    pub fn timed_out(limit: Duration) -> Self {
        Self {
            exit_code: TIMED_OUT_EXIT_CODE,
            stdout: Vec::new(),
            stderr: format!("timed out after {}s", limit.as_secs_f64()).into_bytes(),
            duration: limit,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn is_timed_out(&self) -> bool {
        self.exit_code == TIMED_OUT_EXIT_CODE
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// One-line explanation of a failed result, used in reports.
    pub fn failure_reason(&self) -> String {
        if self.is_timed_out() {
            return self.stderr_lossy();
        }
        let stderr = self.stderr_lossy();
        match stderr.lines().rev().find(|line| !line.trim().is_empty()) {
            Some(line) => format!("exit code {}: {}", self.exit_code, line.trim()),
            None => format!("exit code {}", self.exit_code),
        }
    }
}

/// Executes commands. Nonzero exit codes are results, not errors.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &Command, timeout: Option<Duration>)
        -> HarvestResult<CommandResult>;
}

/// Runs commands as child processes via `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> HarvestResult<CommandResult> {
        let start = Instant::now();

        if !command.working_directory().is_dir() {
            return Err(HarvestError::InvalidWorkingDirectory {
                path: command.working_directory().to_path_buf(),
            });
        }

        debug!(command = %command, cwd = %command.working_directory().display(), "Spawning");

        let mut process = ProcessCommand::new(command.program());
        process
            .args(command.arguments())
            .current_dir(command.working_directory())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down everything it spawned.
        #[cfg(unix)]
        process.process_group(0);

        let child = process
            .spawn()
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => HarvestError::ExecutableNotFound {
                    program: command.program().to_string(),
                },
                _ => HarvestError::Spawn {
                    program: command.program().to_string(),
                    source,
                },
            })?;
        let pid = child.id();

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    warn!(
                        command = %command,
                        limit_secs = limit.as_secs_f64(),
                        "Command timed out"
                    );
                    kill_process_group(pid);
                    return Ok(CommandResult::timed_out(limit));
                }
            },
            None => child.wait_with_output().await?,
        };

        Ok(
            CommandResult::new(exit_code(output.status), output.stdout, output.stderr)
                .with_duration(start.elapsed()),
        )
    }
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; it touches no memory of ours.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
