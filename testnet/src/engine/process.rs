// File: testnet/src/engine/process.rs
//
// External Process Handling
//
// One-shot commands (engine CLI, node CLI) run through `CommandSpec::run`,
// which bounds them with a timeout and kills them if the future is dropped.
// Long-running helpers (the container log follower) are held as a
// `ScopedProcess`, released with SIGTERM, a grace period, then SIGKILL.

use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};

use crate::error::{TestnetError, TestnetResult};

/// A command line plus its environment, built up before running.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdin: Option<String>,
    current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Data piped to the process; never included in logs or errors.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }

    /// Runs to completion, capturing output. Exceeding `limit` kills the
    /// process and yields [`TestnetError::Timeout`].
    pub async fn run(&self, limit: Duration) -> TestnetResult<CommandOutput> {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Running `{}`", self);
        }

        let mut command = self.command();
        command
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| TestnetError::io(&self.program, e))?;

        if let (Some(input), Some(mut pipe)) = (&self.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| TestnetError::io(&self.program, e))?;
            // Closing the pipe signals end of input.
            drop(pipe);
        }

        let output = timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| TestnetError::Timeout {
                what: format!("`{}` to finish", self),
                elapsed: limit,
            })?
            .map_err(|e| TestnetError::io(&self.program, e))?;

        Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Blocking variant for contexts without a runtime, such as `Drop`.
    pub fn run_blocking(&self) -> TestnetResult<CommandOutput> {
        let mut command = std::process::Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        let output = command
            .output()
            .map_err(|e| TestnetError::io(&self.program, e))?;
        Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stderr, or stdout when stderr is empty; trimmed.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.trim().to_string()
    }
}

/// How a [`ScopedProcess`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// It had already exited on its own.
    Exited,
    /// It honoured SIGTERM within the grace period.
    Terminated,
    /// It had to be killed.
    Killed,
}

/// A child process that is always released.
///
/// `shutdown` sends SIGTERM, waits up to the grace period and then kills;
/// dropping without `shutdown` kills immediately.
pub struct ScopedProcess {
    name: String,
    child: Option<Child>,
    grace: Duration,
}

impl ScopedProcess {
    /// Spawns `spec` with the given output sinks.
    pub fn spawn(
        spec: &CommandSpec,
        stdout: Stdio,
        stderr: Stdio,
        grace: Duration,
    ) -> TestnetResult<Self> {
        let mut command = spec.command();
        command.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        let child = command
            .spawn()
            .map_err(|e| TestnetError::io(spec.program(), e))?;
        debug!("Started `{}` (pid {:?})", spec, child.id());
        Ok(Self {
            name: spec.to_string(),
            child: Some(child),
            grace,
        })
    }

    /// OS process id, while the process is running.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Terminates gracefully, escalating to SIGKILL after the grace period.
    pub async fn shutdown(mut self) -> TestnetResult<Release> {
        let Some(mut child) = self.child.take() else {
            return Ok(Release::Exited);
        };

        if child
            .try_wait()
            .map_err(|e| TestnetError::io(&self.name, e))?
            .is_some()
        {
            return Ok(Release::Exited);
        }

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to {} (pid {}) failed: {}", self.name, pid, e);
            }
        }

        match timeout(self.grace, child.wait()).await {
            Ok(Ok(_)) => Ok(Release::Terminated),
            Ok(Err(e)) => Err(TestnetError::io(&self.name, e)),
            Err(_) => {
                warn!(
                    "{} ignored SIGTERM for {:?}, killing it",
                    self.name, self.grace
                );
                child
                    .kill()
                    .await
                    .map_err(|e| TestnetError::io(&self.name, e))?;
                Ok(Release::Killed)
            }
        }
    }
}

impl Drop for ScopedProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Ok(None) = child.try_wait() {
                debug!("Killing {} on drop", self.name);
                let _ = child.start_kill();
            }
        }
    }
}

impl fmt::Debug for ScopedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedProcess")
            .field("name", &self.name)
            .field("pid", &self.id())
            .field("grace", &self.grace)
            .finish()
    }
}
