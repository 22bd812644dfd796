//! External process invocation.
//!
//! Terraform, kubectl, git and ssh-keygen are all driven through
//! [`ProcessRunner`]. The working directory and environment overlay are
//! applied to the child only; the installer's own working directory and
//! environment are never modified.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors from spawning or waiting on a child process.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The binary could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The binary ran and exited unsuccessfully.
    #[error("{program} exited with {}", describe_exit(.code))]
    Exit { program: String, code: Option<i32> },

    /// Cancellation was requested before the binary was started.
    #[error("{program} not started: run cancelled")]
    Cancelled { program: String },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "a signal".to_string(),
    }
}

/// One external command: binary, arguments, working directory and env overlay.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
    /// Indices into `args` masked when the invocation is displayed.
    redacted: BTreeSet<usize>,
    workdir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            redacted: BTreeSet::new(),
            workdir: None,
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Add an argument that carries a secret. It reaches the child unchanged
    /// but is masked in logs and error messages.
    #[must_use]
    pub fn secret_arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.redacted.insert(self.args.len());
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Run the child in `dir`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Add one variable to the child's environment overlay.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add many variables to the child's environment overlay.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    #[must_use]
    pub fn env_overlay(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Short name of the binary for error messages.
    #[must_use]
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

// Environment values are left out: the overlay routinely carries tokens.
impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program_name())?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.redacted.contains(&i) {
                write!(f, " ****")?;
            } else {
                write!(f, " {}", arg.to_string_lossy())?;
            }
        }
        Ok(())
    }
}

/// A long-running child (e.g. `kubectl port-forward`) terminated on drop.
pub struct BackgroundProcess {
    program: String,
    child: Child,
}

impl BackgroundProcess {
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Terminate the child now and wait for it to exit.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(program = %self.program, error = %e, "Background process already exited");
        }
    }
}

/// Runs external binaries with output passed through to the operator.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    cancel: Option<CancellationToken>,
}

impl ProcessRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to start new processes once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn check_cancelled(&self, invocation: &Invocation) -> Result<(), ProcessError> {
        if self
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(ProcessError::Cancelled {
                program: invocation.program_name(),
            });
        }
        Ok(())
    }

    /// Run to completion with stdout and stderr inherited.
    ///
    /// # Errors
    ///
    /// Returns an error naming the binary if it cannot be started or exits non-zero.
    pub async fn run(&self, invocation: &Invocation) -> Result<(), ProcessError> {
        self.check_cancelled(invocation)?;
        info!(command = %invocation, workdir = ?invocation.workdir(), "Running");

        let status = invocation
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|source| ProcessError::Spawn {
                program: invocation.program_name(),
                source,
            })?;

        if !status.success() {
            return Err(ProcessError::Exit {
                program: invocation.program_name(),
                code: status.code(),
            });
        }
        Ok(())
    }

    /// Run to completion and return trimmed stdout. Stderr is inherited.
    ///
    /// # Errors
    ///
    /// Returns an error naming the binary if it cannot be started or exits non-zero.
    pub async fn capture(&self, invocation: &Invocation) -> Result<String, ProcessError> {
        self.check_cancelled(invocation)?;
        debug!(command = %invocation, workdir = ?invocation.workdir(), "Capturing");

        let output = invocation
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                program: invocation.program_name(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProcessError::Exit {
                program: invocation.program_name(),
                code: output.status.code(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Start a child that keeps running until the returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary cannot be started.
    pub fn spawn(&self, invocation: &Invocation) -> Result<BackgroundProcess, ProcessError> {
        self.check_cancelled(invocation)?;
        info!(command = %invocation, "Starting background process");

        let child = invocation
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: invocation.program_name(),
                source,
            })?;

        Ok(BackgroundProcess {
            program: invocation.program_name(),
            child,
        })
    }
}
