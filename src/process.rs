//! External process invocation
//!
//! Hardware-query tools and the supervisor are opaque executables. The core
//! only talks to them through [`CommandRunner`] (run to completion, capture
//! output) and [`hand_off`] (give the terminal to the supervisor).

use crate::error::{SwapError, SwapResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

// ============================================================================
// Trait Definitions
// ============================================================================

/// A command to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Trait for running external commands to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command and capture its output.
    /// A missing executable is an `Err`; a non-zero exit is an `Ok` with `success == false`.
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production runner using tokio::process
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("{} timed out after {:?}", spec.program, self.timeout),
                )
            })??;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ============================================================================
// Supervisor hand-off
// ============================================================================

/// How `serve` gives control to the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandoffMode {
    /// Replace the current process (Unix only; falls back to `Supervise`)
    #[default]
    Exec,
    /// Spawn a child, forward termination signals, exit with its status
    Supervise,
}

/// Supervisor invocation
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: CommandSpec,
    /// Compiled config path, for logging
    pub config_path: PathBuf,
    /// Grace period between SIGTERM and SIGKILL in supervise mode
    pub grace: Duration,
}

/// Hand execution to the supervisor, inheriting standard I/O.
///
/// In `Exec` mode this only returns on failure. In `Supervise` mode it
/// returns the child's exit code.
pub async fn hand_off(spec: LaunchSpec, mode: HandoffMode) -> SwapResult<i32> {
    tracing::info!(
        program = %spec.command.program,
        args = ?spec.command.args,
        config = ?spec.config_path,
        mode = ?mode,
        "Handing off to supervisor"
    );

    #[cfg(unix)]
    if mode == HandoffMode::Exec {
        use std::os::unix::process::CommandExt;

        let err = std::process::Command::new(&spec.command.program)
            .args(&spec.command.args)
            .envs(spec.command.env.iter().map(|(k, v)| (k, v)))
            .exec();
        return Err(launch_error(&spec.command.program, err));
    }

    supervise(spec).await
}

fn launch_error(program: &str, err: std::io::Error) -> SwapError {
    SwapError::Config(format!("failed to launch supervisor '{}': {}", program, err))
}

async fn supervise(spec: LaunchSpec) -> SwapResult<i32> {
    let mut child = Command::new(&spec.command.program)
        .args(&spec.command.args)
        .envs(spec.command.env.iter().map(|(k, v)| (k, v)))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| launch_error(&spec.command.program, e))?;

    tracing::info!(pid = ?child.id(), "Supervisor started");

    let status = tokio::select! {
        status = child.wait() => status,
        _ = shutdown_signal() => {
            stop_child(&mut child, spec.grace).await;
            child.wait().await
        }
    };
    let status = status.map_err(|e| launch_error(&spec.command.program, e))?;

    let code = status.code().unwrap_or(1);
    tracing::info!(code = code, "Supervisor exited");
    Ok(code)
}

/// Try graceful shutdown first (SIGTERM), then SIGKILL after `grace`
async fn stop_child(child: &mut tokio::process::Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(pid as i32);
        let _ = kill(pid, Signal::SIGTERM);

        tokio::select! {
            _ = child.wait() => {
                tracing::info!("Supervisor stopped gracefully");
            }
            _ = tokio::time::sleep(grace) => {
                tracing::warn!("Graceful shutdown timeout, sending SIGKILL");
                let _ = kill(pid, Signal::SIGKILL);
            }
        }
        return;
    }

    let _ = grace;
    let _ = child.kill().await;
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted runner: unknown programs behave as "not installed"
    #[derive(Default)]
    pub struct MockCommandRunner {
        outputs: Mutex<HashMap<String, CommandOutput>>,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl MockCommandRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Program exits 0 with `stdout`
        pub fn with_success(self, program: &str, stdout: &str) -> Self {
            self.outputs.lock().unwrap().insert(
                program.to_string(),
                CommandOutput {
                    success: true,
                    code: Some(0),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            );
            self
        }

        /// Program is installed but fails
        pub fn with_failure(self, program: &str, stderr: &str) -> Self {
            self.outputs.lock().unwrap().insert(
                program.to_string(),
                CommandOutput {
                    success: false,
                    code: Some(9),
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                },
            );
            self
        }

        pub fn called_programs(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.program.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for MockCommandRunner {
        async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            self.outputs
                .lock()
                .unwrap()
                .get(&spec.program)
                .cloned()
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "program not found")
                })
        }
    }
}
