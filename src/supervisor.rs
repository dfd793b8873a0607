//! Out-of-band supervision of backend OS processes
//!
//! Backends are found by scanning the live process table for the configured
//! program invoked with its serve subcommand. Nothing is cached: every call
//! reads the kernel's current view. Enumeration and signalling are blocking
//! and run on the blocking thread pool.

use crate::config::BackendConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often termination progress is polled
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A backend process as seen at scan time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub pid: i32,
    pub port: Option<u16>,
    pub hostname: Option<String>,
    pub cmdline: String,
}

/// Health payload reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub version: String,
}

/// Result of a termination attempt, reported as data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillOutcome {
    pub success: bool,
    pub message: String,
}

impl KillOutcome {
    fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to connect to backend on port {port}: {reason}")]
    HealthCheckFailed { port: u16, reason: String },
    #[error("Process table unavailable: {0}")]
    Os(String),
}

/// Discovers, probes and terminates backend processes
pub struct ProcessSupervisor {
    program: String,
    serve_token: String,
    health_path: String,
    health_timeout: Duration,
    grace_period: Duration,
    client: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            program: config.program.clone(),
            serve_token: config.serve_token.clone(),
            health_path: config.health_path.clone(),
            health_timeout: config.health_timeout(),
            grace_period: config.kill_grace_period(),
            client: reqwest::Client::new(),
        }
    }

    pub fn health_timeout(&self) -> Duration {
        self.health_timeout
    }

    /// Snapshot of every live backend process
    pub async fn list_backend_processes(&self) -> Result<Vec<ProcessRecord>, SupervisorError> {
        let program = self.program.clone();
        let token = self.serve_token.clone();

        tokio::task::spawn_blocking(move || scan_processes(&program, &token))
            .await
            .map_err(|e| SupervisorError::Os(format!("process scan task failed: {}", e)))?
    }

    /// Probe a backend's health endpoint on loopback
    pub async fn check_health(&self, port: u16, timeout: Duration) -> Result<HealthStatus, SupervisorError> {
        let url = format!("http://127.0.0.1:{}{}", port, self.health_path);
        let failed = |reason: String| SupervisorError::HealthCheckFailed { port, reason };

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!(
                "unexpected status code {} from health endpoint",
                status.as_u16()
            )));
        }

        response
            .json::<HealthStatus>()
            .await
            .map_err(|e| failed(format!("invalid health payload: {}", e)))
    }

    /// Terminate a backend process: SIGTERM, grace period, then SIGKILL
    ///
    /// Refuses any pid that is not a backend in the current listing.
    pub async fn kill_process(&self, pid: i32) -> KillOutcome {
        let processes = match self.list_backend_processes().await {
            Ok(processes) => processes,
            Err(e) => return KillOutcome::failure(e.to_string()),
        };

        if pid <= 0 || !processes.iter().any(|p| p.pid == pid) {
            debug!(pid, "Refusing to kill process that is not a known backend");
            return KillOutcome::failure(format!("Process {} not found", pid));
        }

        let grace_period = self.grace_period;
        tokio::task::spawn_blocking(move || terminate(pid, grace_period))
            .await
            .unwrap_or_else(|e| KillOutcome::failure(format!("termination task failed: {}", e)))
    }
}

/// Extract a backend record from a command line, if it is a backend invocation
pub fn parse_invocation(pid: i32, args: &[String], program: &str, serve_token: &str) -> Option<ProcessRecord> {
    let is_program = |arg: &String| {
        arg == program || Path::new(arg).file_name().is_some_and(|name| name == program)
    };

    if !args.iter().any(is_program) || !args.iter().any(|a| a == serve_token) {
        return None;
    }

    Some(ProcessRecord {
        pid,
        port: flag_value(args, "--port").and_then(|v| v.parse().ok()),
        hostname: flag_value(args, "--hostname").map(str::to_string),
        cmdline: args.join(" "),
    })
}

/// Value of `--flag value` or `--flag=value`
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().enumerate().find_map(|(i, arg)| {
        if arg == flag {
            args.get(i + 1).map(String::as_str)
        } else {
            arg.strip_prefix(flag).and_then(|rest| rest.strip_prefix('='))
        }
    })
}

#[cfg(target_os = "linux")]
fn scan_processes(program: &str, serve_token: &str) -> Result<Vec<ProcessRecord>, SupervisorError> {
    let processes = procfs::process::all_processes().map_err(|e| SupervisorError::Os(e.to_string()))?;

    // Processes that exit mid-scan or deny access are skipped
    Ok(processes
        .filter_map(|p| p.ok())
        .filter_map(|p| {
            let args = p.cmdline().ok()?;
            parse_invocation(p.pid, &args, program, serve_token)
        })
        .collect())
}

#[cfg(not(target_os = "linux"))]
fn scan_processes(_program: &str, _serve_token: &str) -> Result<Vec<ProcessRecord>, SupervisorError> {
    Err(SupervisorError::Os(
        "process enumeration is only supported on Linux".to_string(),
    ))
}

/// Whether the pid no longer refers to a running process
#[cfg(target_os = "linux")]
fn is_gone(pid: i32) -> bool {
    match procfs::process::Process::new(pid).and_then(|p| p.stat()) {
        // Zombies have exited and only await reaping by their parent
        Ok(stat) => stat.state == 'Z',
        Err(_) => true,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_gone(pid: i32) -> bool {
    let result = unsafe { libc::kill(pid, 0) };
    result != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

#[cfg(unix)]
enum SignalError {
    AlreadyExited,
    PermissionDenied,
    Other(std::io::Error),
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: libc::c_int) -> Result<(), SignalError> {
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Err(SignalError::AlreadyExited),
        Some(libc::EPERM) => Err(SignalError::PermissionDenied),
        _ => Err(SignalError::Other(err)),
    }
}

#[cfg(unix)]
fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if is_gone(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn terminate(pid: i32, grace_period: Duration) -> KillOutcome {
    let phases = [(libc::SIGTERM, "SIGTERM"), (libc::SIGKILL, "SIGKILL")];

    for (signal, name) in phases {
        info!(pid, signal = name, "Sending signal to backend process");
        match send_signal(pid, signal) {
            Ok(()) => {}
            Err(SignalError::AlreadyExited) => {
                return KillOutcome::failure(format!("Process {} already exited before {}", pid, name));
            }
            Err(SignalError::PermissionDenied) => {
                warn!(pid, signal = name, "Permission denied signalling process");
                return KillOutcome::failure(format!("Permission denied sending {} to process {}", name, pid));
            }
            Err(SignalError::Other(e)) => {
                return KillOutcome::failure(format!("Failed to send {} to process {}: {}", name, pid, e));
            }
        }

        if wait_for_exit(pid, grace_period) {
            info!(pid, signal = name, "Backend process exited");
            return KillOutcome::success(format!("Process {} terminated with {}", pid, name));
        }

        warn!(
            pid,
            signal = name,
            grace_period_ms = grace_period.as_millis() as u64,
            "Process still running after grace period"
        );
    }

    KillOutcome::failure(format!("Process {} did not exit after SIGKILL", pid))
}

#[cfg(not(unix))]
fn terminate(pid: i32, _grace_period: Duration) -> KillOutcome {
    KillOutcome::failure(format!(
        "Terminating process {} is not supported on this platform",
        pid
    ))
}
