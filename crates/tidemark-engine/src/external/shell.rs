//! Shell command execution
//!
//! Every vendor tool (`hadoop`, `hive`, `oozie`, `vsql`, `curl`) is driven
//! through [`CommandRunner`], so the clients built on top can be exercised
//! against scripted output in tests.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command exited with status {status}: {command} (stderr: {stderr})")]
    NonZeroExit {
        command: String,
        status: i32,
        stderr: String,
    },
}

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a shell command line and capture its output
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError>;

    /// Like [`run`](Self::run), but a non-zero exit status is an error
    async fn run_checked(&self, command: &str) -> Result<CommandOutput, ShellError> {
        let output = self.run(command).await?;
        if output.success() {
            return Ok(output);
        }

        warn!(
            command,
            status = output.status,
            stderr = %output.stderr.trim(),
            "Shell command failed"
        );
        Err(ShellError::NonZeroExit {
            command: command.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Runs commands through `bash -c`
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError> {
        debug!(command, "Executing shell command");

        let output = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|source| ShellError::Spawn {
                command: command.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
