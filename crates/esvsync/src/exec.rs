//! External process execution.
//!
//! Every external tool (`frodo`, `git`) is launched through a
//! [`CommandExecutor`] with a structured argument list. Nothing is ever
//! passed through a shell.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Errors from running an external command.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with code {exit_code}: {}", format_command_error(.exit_code, .stdout, .stderr))]
    CommandFailed {
        program: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("'{program}' timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
}

/// Merges stderr and stdout into one message, stderr first.
pub fn format_command_error(exit_code: &i32, stdout: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    let stdout = stdout.trim();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!("Command failed with exit code {}", exit_code),
        (true, false) => stdout.to_string(),
        (false, true) => stderr.to_string(),
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// A command to run: program, arguments, working directory and extra
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
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

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Returns the value of an environment override, if set.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external commands. Fails with [`ExecError::CommandFailed`] on a
/// non-zero exit.
pub trait CommandExecutor: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;
}

/// Executes commands as child processes of this one.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kills a child still running after `timeout`.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    fn build(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn run_with_deadline(
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<(Option<i32>, String, String), ExecError> {
        let mut child = Self::build(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::Spawn {
                program: spec.program.clone(),
                source: e,
            })?;

        // Drain both pipes on their own threads so a chatty child never
        // blocks on a full pipe while we poll.
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    if let Err(e) = child.kill() {
                        log::warn!("Failed to kill timed out '{}': {}", spec.program, e);
                    }
                    let _ = child.wait();
                    return Err(ExecError::TimedOut {
                        program: spec.program.clone(),
                        timeout,
                    });
                }
                Ok(None) => thread::sleep(Duration::from_millis(20)),
                Err(e) => {
                    return Err(ExecError::Spawn {
                        program: spec.program.clone(),
                        source: e,
                    })
                }
            }
        };

        let stdout = stdout_reader.map(join_reader).unwrap_or_default();
        let stderr = stderr_reader.map(join_reader).unwrap_or_default();
        Ok((status.code(), stdout, stderr))
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

impl CommandExecutor for ProcessExecutor {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        log::debug!("Running: {}", spec);

        let (code, stdout, stderr) = match self.timeout {
            Some(timeout) => Self::run_with_deadline(spec, timeout)?,
            None => {
                let output = Self::build(spec)
                    .stdin(Stdio::null())
                    .output()
                    .map_err(|e| ExecError::Spawn {
                        program: spec.program.clone(),
                        source: e,
                    })?;
                (
                    output.status.code(),
                    String::from_utf8_lossy(&output.stdout).into_owned(),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                )
            }
        };

        match code {
            Some(0) => Ok(CommandOutput { stdout, stderr }),
            // Killed by a signal has no exit code.
            other => Err(ExecError::CommandFailed {
                program: spec.program.clone(),
                exit_code: other.unwrap_or(-1),
                stdout,
                stderr,
            }),
        }
    }
}
