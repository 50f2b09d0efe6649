//! Host command execution.
//!
//! Every side effect on the hypervisor host (virsh, brctl, vmx.sh, tar, ...)
//! goes through the [`HostExecutor`] trait so that planning, install and
//! teardown logic can be exercised against a recording fake.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ProvisionError, Result};

/// Default timeout for one-shot host commands.
pub const HOST_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A single host command: program, arguments and optional working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
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

    /// Run the command from `dir` instead of the current directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Build the equivalent `std::process::Command`.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(' ') {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        if let Some(dir) = &self.cwd {
            write!(f, " (in {})", dir.display())?;
        }
        Ok(())
    }
}

/// Result of executing a host command.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Whether the command finished before its timeout.
    pub completed: bool,
    /// Exit code (0 = success, -1 when killed or terminated by a signal).
    pub exit_code: i32,
    /// Captured stdout, trimmed.
    pub output: String,
    /// Captured stderr, trimmed.
    pub errors: String,
}

impl ExecResult {
    /// Check if the command succeeded.
    pub fn success(&self) -> bool {
        self.completed && self.exit_code == 0
    }

    /// A finished command with exit code 0 and the given stdout.
    pub fn ok(output: &str) -> Self {
        Self {
            completed: true,
            exit_code: 0,
            output: output.to_string(),
            errors: String::new(),
        }
    }

    /// A finished command with a non-zero exit code.
    pub fn failed(exit_code: i32, errors: &str) -> Self {
        Self {
            completed: true,
            exit_code,
            output: String::new(),
            errors: errors.to_string(),
        }
    }
}

/// Runs commands on the hypervisor host.
pub trait HostExecutor {
    /// Execute a command and capture output + exit code.
    ///
    /// A command that exceeds `timeout` is killed and reported with
    /// `completed == false`; only a failure to start it is an `Err`.
    fn exec(&self, cmd: &HostCommand, timeout: Duration) -> Result<ExecResult>;

    /// Execute a command that's expected to succeed.
    ///
    /// Returns stdout on success, `ProvisionError::HostCommand` otherwise.
    fn exec_ok(&self, cmd: &HostCommand, timeout: Duration) -> Result<String> {
        let result = self.exec(cmd, timeout)?;
        if !result.success() {
            let output = if result.errors.is_empty() {
                result.output
            } else {
                result.errors
            };
            return Err(ProvisionError::HostCommand {
                command: cmd.to_string(),
                exit_code: result.exit_code,
                output,
            });
        }
        Ok(result.output)
    }
}

/// Executor backed by `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl HostExecutor for SystemExecutor {
    fn exec(&self, cmd: &HostCommand, timeout: Duration) -> Result<ExecResult> {
        debug!(command = %cmd, "running host command");

        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProvisionError::Spawn {
                command: cmd.to_string(),
                source,
            })?;

        // Drain both pipes on their own threads so a chatty command can't
        // block on a full pipe while we poll for exit.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = thread::spawn(move || read_pipe(stdout));
        let err_reader = thread::spawn(move || read_pipe(stderr));

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if start.elapsed() > timeout {
                warn!(command = %cmd, timeout_secs = timeout.as_secs(), "host command timed out, killing it");
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };

        let Some(status) = status else {
            // Grandchildren may still hold the pipes open, don't join the readers.
            return Ok(ExecResult {
                completed: false,
                exit_code: -1,
                output: String::new(),
                errors: format!("timed out after {}s", timeout.as_secs()),
            });
        };

        let output = out_reader.join().unwrap_or_default();
        let errors = err_reader.join().unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);
        debug!(command = %cmd, exit_code, "host command finished");

        Ok(ExecResult {
            completed: true,
            exit_code,
            output: output.trim().to_string(),
            errors: errors.trim().to_string(),
        })
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
