//! Child process lifecycle: spawn with piped stdio, drain stderr, and
//! terminate gracefully before forcing.
//!
//! # Termination sequence
//!
//! 1. Close stdin so a well-behaved child sees end-of-input.
//! 2. Wait up to the grace period for a natural exit.
//! 3. Send SIGTERM (unix) and wait up to the kill timeout.
//! 4. Send SIGKILL and reap.
//!
//! [`ChildProcess::terminate`] runs this sequence at most once.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::GatewayError;

/// Timing of the graceful-then-forced shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// Wait for a natural exit after stdin is closed.
    pub grace: Duration,
    /// Wait after SIGTERM before SIGKILL.
    pub kill_timeout: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&crate::config::ProcessConfig> for TerminationPolicy {
    fn from(config: &crate::config::ProcessConfig) -> Self {
        Self {
            grace: Duration::from_millis(config.grace_period_ms),
            kill_timeout: Duration::from_millis(config.kill_timeout_ms),
        }
    }
}

/// How a call to [`ChildProcess::terminate`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The child exited on its own after stdin was closed.
    Exited,
    /// The child exited after SIGTERM.
    Terminated,
    /// The child had to be killed.
    Killed,
    /// A previous call already terminated the child; nothing was done.
    AlreadyTerminated,
}

/// Spawns children of one fixed command line.
#[derive(Debug, Clone)]
pub struct Launcher {
    command: String,
    program: String,
    args: Vec<String>,
    policy: TerminationPolicy,
}

impl Launcher {
    /// Parses `command` into program and arguments (whitespace separated).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidCommand`] if the command is empty.
    pub fn new(command: &str, policy: TerminationPolicy) -> Result<Self, GatewayError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| GatewayError::InvalidCommand("command cannot be empty".to_string()))?;

        Ok(Self {
            command: command.trim().to_string(),
            program,
            args: parts.collect(),
            policy,
        })
    }

    /// Returns the full command line.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns the termination policy given to spawned children.
    #[must_use]
    pub const fn policy(&self) -> TerminationPolicy {
        self.policy
    }

    /// Starts a new child with piped stdin, stdout and stderr.
    ///
    /// Must be called from within a Tokio runtime: a task is spawned to
    /// drain the child's stderr into the log.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Spawn`] if the process cannot be started.
    pub fn spawn(&self) -> Result<ChildProcess, GatewayError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GatewayError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, pid));
        }

        info!(pid = ?pid, command = %self.command, "Started child process");

        Ok(ChildProcess {
            command: self.command.clone(),
            pid,
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            policy: self.policy,
            terminated: false,
        })
    }
}

/// Forwards every stderr line of a child to the log until EOF.
async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "child_stderr", pid = ?pid, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(pid = ?pid, error = %e, "Stopped reading child stderr");
                break;
            }
        }
    }
}

/// One running instance of the wrapped command.
///
/// Owned by exactly one holder at a time. Dropping it without calling
/// [`terminate`](Self::terminate) kills the process.
#[derive(Debug)]
pub struct ChildProcess {
    command: String,
    pid: Option<u32>,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    policy: TerminationPolicy,
    terminated: bool,
}

impl ChildProcess {
    /// Returns the command line this process was started with.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns the OS process id, if the process was started.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Takes the stdin handle. Subsequent calls return `None`.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Takes the stdout handle. Subsequent calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Returns `true` once [`terminate`](Self::terminate) has run.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Polls the process without blocking.
    ///
    /// Returns `false` if it has exited or was terminated.
    pub fn is_alive(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stops the process: close stdin, wait, SIGTERM, wait, SIGKILL.
    ///
    /// Idempotent: once a call has run the sequence, later calls return
    /// [`Termination::AlreadyTerminated`] without touching the process.
    /// Blocks for at most the grace period plus the kill timeout before
    /// the final kill.
    pub async fn terminate(&mut self) -> Termination {
        if self.terminated {
            return Termination::AlreadyTerminated;
        }
        self.terminated = true;

        let pid = self.pid;
        debug!(pid = ?pid, command = %self.command, "Terminating child process");

        drop(self.stdin.take());

        let outcome = if wait_for_exit(&mut self.child, self.policy.grace).await {
            debug!(pid = ?pid, "Child process exited gracefully");
            Termination::Exited
        } else {
            send_terminate(&mut self.child, pid);
            if wait_for_exit(&mut self.child, self.policy.kill_timeout).await {
                info!(pid = ?pid, "Child process terminated");
                Termination::Terminated
            } else {
                warn!(pid = ?pid, "Child process ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(pid = ?pid, error = %e, "Failed to kill child process");
                }
                Termination::Killed
            }
        };

        drop(self.stdout.take());
        outcome
    }
}

/// Waits up to `limit` for the child to exit. Returns `true` if it did.
async fn wait_for_exit(child: &mut Child, limit: Duration) -> bool {
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(status = %status, "Child process exit status");
            true
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for child process");
            true
        }
        Err(_) => false,
    }
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _pid: Option<u32>) {
    // No SIGTERM equivalent; the kill timeout still applies before the final wait.
    let _ = child.start_kill();
}
