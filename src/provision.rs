//! External setup/teardown collaborators
//!
//! Provisioning a backend is delegated to configured executables. The setup
//! command receives the correlation id as its last argument and reports the
//! new backend as a JSON object on the last line of its stdout.

use crate::config::ProvisioningConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Invalid command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {timeout_secs} seconds")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("'{command}' failed with {status}")]
    Failed {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("Invalid setup output: {reason}")]
    InvalidOutput { reason: String, stdout: String },
}

impl ProvisionError {
    /// Error message with any captured collaborator output attached
    pub fn diagnostic(&self) -> String {
        match self {
            ProvisionError::Failed { stdout, stderr, .. } => {
                let mut message = self.to_string();
                if !stderr.trim().is_empty() {
                    message.push_str(&format!("\nstderr: {}", stderr.trim()));
                }
                if !stdout.trim().is_empty() {
                    message.push_str(&format!("\nstdout: {}", stdout.trim()));
                }
                message
            }
            ProvisionError::InvalidOutput { stdout, .. } if !stdout.trim().is_empty() => {
                format!("{}\nstdout: {}", self, stdout.trim())
            }
            _ => self.to_string(),
        }
    }
}

/// Record reported by the setup command for a freshly provisioned backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupOutcome {
    pub port: u16,
    pub worktree: String,
    pub prod_hash: String,
    pub master_hash: String,
    pub compare_advice: String,
    pub matches_master: bool,
    pub pid_file: String,
    pub pid: u32,
}

impl SetupOutcome {
    /// Parse the last non-empty line of the setup command's stdout
    pub fn from_stdout(stdout: &str) -> Result<Self, ProvisionError> {
        let invalid = |reason: String| ProvisionError::InvalidOutput {
            reason,
            stdout: stdout.to_string(),
        };

        let line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| invalid("setup command produced no output".to_string()))?;

        let outcome: SetupOutcome = serde_json::from_str(line).map_err(|e| invalid(e.to_string()))?;
        if outcome.port == 0 {
            return Err(invalid("port must be between 1 and 65535".to_string()));
        }
        Ok(outcome)
    }
}

/// Runs the configured setup, cleanup and clone commands
pub struct ScriptProvisioner {
    setup_command: Vec<String>,
    cleanup_command: Vec<String>,
    setup_timeout: Duration,
    cleanup_timeout: Duration,
    repo_url: Option<String>,
    repo_path: PathBuf,
    clone_timeout: Duration,
    env: Vec<(&'static str, String)>,
}

impl ScriptProvisioner {
    pub fn new(config: &ProvisioningConfig) -> Result<Self, ProvisionError> {
        Ok(Self {
            setup_command: split_command(&config.setup_command)?,
            cleanup_command: split_command(&config.cleanup_command)?,
            setup_timeout: config.setup_timeout(),
            cleanup_timeout: config.cleanup_timeout(),
            repo_url: config.repo_url.clone(),
            repo_path: config.repo_path.clone(),
            clone_timeout: config.clone_timeout(),
            env: config.collaborator_env(),
        })
    }

    /// Provision a backend for `correlation_id`
    pub async fn setup(&self, correlation_id: &str) -> Result<SetupOutcome, ProvisionError> {
        let stdout = self
            .run(&self.setup_command, correlation_id, self.setup_timeout)
            .await?;

        let outcome = SetupOutcome::from_stdout(&stdout)?;
        info!(
            correlation_id,
            port = outcome.port,
            pid = outcome.pid,
            worktree = %outcome.worktree,
            matches_master = outcome.matches_master,
            "Backend provisioned"
        );
        Ok(outcome)
    }

    /// Tear down the backend for `correlation_id`
    pub async fn teardown(&self, correlation_id: &str) -> Result<(), ProvisionError> {
        self.run(&self.cleanup_command, correlation_id, self.cleanup_timeout)
            .await?;
        info!(correlation_id, "Backend torn down");
        Ok(())
    }

    /// Clone the configured repository unless a checkout already exists
    ///
    /// Returns whether a clone was performed.
    pub async fn clone_repository(&self) -> Result<bool, ProvisionError> {
        let Some(ref url) = self.repo_url else {
            debug!("No repository URL configured, skipping clone");
            return Ok(false);
        };

        if self.repo_path.join(".git").exists() {
            debug!(path = %self.repo_path.display(), "Repository already present");
            return Ok(false);
        }

        info!(url = %url, path = %self.repo_path.display(), "Cloning repository");

        let mut cmd = Command::new("git");
        cmd.arg("clone").arg(url).arg(&self.repo_path);
        execute(cmd, format!("git clone {}", url), self.clone_timeout).await?;

        info!(path = %self.repo_path.display(), "Repository cloned");
        Ok(true)
    }

    async fn run(
        &self,
        command: &[String],
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<String, ProvisionError> {
        let command_line = format!("{} {}", shell_words::join(command), correlation_id);

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]).arg(correlation_id);
        cmd.envs(self.env.iter().map(|(k, v)| (*k, v.as_str())));

        execute(cmd, command_line, timeout).await
    }
}

fn split_command(command: &str) -> Result<Vec<String>, ProvisionError> {
    let invalid = |reason: String| ProvisionError::InvalidCommand {
        command: command.to_string(),
        reason,
    };

    let words = shell_words::split(command).map_err(|e| invalid(e.to_string()))?;
    if words.is_empty() {
        return Err(invalid("command is empty".to_string()));
    }
    Ok(words)
}

/// Run to completion under `timeout`, returning stdout on a zero exit status
async fn execute(mut cmd: Command, command_line: String, timeout: Duration) -> Result<String, ProvisionError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    debug!(command = %command_line, "Running collaborator");

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(ProvisionError::Spawn {
                command: command_line,
                source,
            })
        }
        Err(_) => {
            warn!(command = %command_line, timeout_secs = timeout.as_secs(), "Collaborator timed out");
            return Err(ProvisionError::Timeout {
                command: command_line,
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    debug!(command = %command_line, stdout = %stdout, "Collaborator stdout");
    if !stderr.trim().is_empty() {
        warn!(command = %command_line, stderr = %stderr, "Collaborator stderr");
    }

    if !output.status.success() {
        return Err(ProvisionError::Failed {
            command: command_line,
            status: output.status.to_string(),
            stdout,
            stderr,
        });
    }

    Ok(stdout)
}
