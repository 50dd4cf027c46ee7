//! Remote command execution.
//!
//! The executor runs exactly one command per call over an authenticated
//! remote shell and returns its exit status and captured output. It never
//! retries; idempotency of the issued commands is the caller's concern.
//!
//! The production implementation shells out to the system `ssh` binary. The
//! per-call timeout is enforced by dropping the child process future, which
//! kills `ssh` and with it the channel, so a hung remote command cannot hold
//! the caller past its budget.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::coordinates::{Coordinates, CredentialRef};
use crate::error::ExecError;

/// Exit status `ssh` itself uses for connection-level failures.
pub const SSH_FAILURE_EXIT: i32 = 255;

/// Maximum bytes of stdout/stderr retained per command.
pub const MAX_CAPTURE_BYTES: usize = 16 * 1024;

/// Default connect timeout handed to `ssh -o ConnectTimeout`.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// stderr fragments that mean ssh could not use our own key. ssh still goes
/// on to print "Permission denied", so these are checked first.
const LOCAL_KEY_MARKERS: &[&str] = &[
    "unprotected private key file",
    "bad permissions",
    "load key",
    "not accessible",
];

/// stderr fragments that mean the server rejected our credential.
const AUTH_MARKERS: &[&str] = &[
    "permission denied",
    "too many authentication failures",
    "no supported authentication methods",
    "authentication failed",
];

/// stderr fragments that mean local misconfiguration.
const CONFIG_MARKERS: &[&str] = &[
    "could not resolve hostname",
    "name or service not known",
    "bad configuration option",
    "unsupported option",
    "bad port",
];

// =============================================================================
// Executor Interface
// =============================================================================

/// Result of a remote command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs single commands against a reachable host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Execute `command` on `target`, killing it after `timeout`.
    async fn execute(
        &self,
        target: &Coordinates,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError>;
}

// =============================================================================
// SSH Implementation
// =============================================================================

/// Configuration for [`SshExecutor`].
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Path to the ssh client binary.
    pub binary: PathBuf,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Additional `-o` options, e.g. `ServerAliveInterval=5`.
    pub extra_options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ssh"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            extra_options: Vec::new(),
        }
    }
}

/// Executor backed by the OpenSSH client.
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Build the ssh invocation for one command.
    fn build_command(&self, target: &Coordinates, command: &str) -> Result<Command, ExecError> {
        let port = target.ssh_port().ok_or_else(|| {
            ExecError::Configuration("guest port 22 is not forwarded".to_string())
        })?;

        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-p")
            .arg(port.to_string())
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ));

        if let CredentialRef::IdentityFile { path } = &target.credential {
            // ssh only warns about a missing identity and then fails auth,
            // which would look like a retryable credential race.
            if !path.exists() {
                return Err(ExecError::Configuration(format!(
                    "identity file {} does not exist",
                    path.display()
                )));
            }
            cmd.arg("-i").arg(path).args(["-o", "IdentitiesOnly=yes"]);
        }

        for option in &self.config.extra_options {
            cmd.arg("-o").arg(option);
        }

        cmd.arg(format!("{}@{}", target.principal, target.host))
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Ok(cmd)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        target: &Coordinates,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let mut cmd = self.build_command(target, command)?;

        debug!(
            host = %target.host,
            port = target.ssh_port(),
            principal = %target.principal,
            command,
            timeout_secs = timeout.as_secs(),
            "Executing remote command"
        );

        let child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => ExecError::Configuration(format!(
                "ssh binary {} not found",
                self.config.binary.display()
            )),
            _ => ExecError::Configuration(format!("failed to spawn ssh: {}", e)),
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecError::Unreachable(format!(
                    "failed to collect ssh output: {}",
                    e
                )))
            }
            Err(_) => {
                // Dropping the future dropped the child; kill_on_drop closes the channel.
                warn!(command, timeout_secs = timeout.as_secs(), "Remote command timed out");
                return Err(ExecError::Timeout(timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let Some(exit_code) = output.status.code() else {
            return Err(ExecError::Unreachable(
                "ssh terminated by signal".to_string(),
            ));
        };

        // A remote command exiting 255 is indistinguishable from an ssh
        // failure; ssh's own diagnostics decide.
        if exit_code == SSH_FAILURE_EXIT {
            let err = classify_ssh_failure(&stderr);
            debug!(error = %err, "ssh connection failed");
            return Err(err);
        }

        debug!(exit_code, stdout_bytes = stdout.len(), "Remote command finished");

        Ok(CommandOutput {
            exit_code,
            stdout: tail(&stdout, MAX_CAPTURE_BYTES),
            stderr: tail(&stderr, MAX_CAPTURE_BYTES),
        })
    }
}

/// Classify an ssh exit-255 failure from its stderr.
///
/// Unknown failures count as unreachable: early in boot sshd produces a
/// zoo of half-open connection errors, all of which resolve with time.
pub fn classify_ssh_failure(stderr: &str) -> ExecError {
    let lower = stderr.to_ascii_lowercase();
    let detail = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("ssh exited with status 255")
        .to_string();

    let local_key = stderr.lines().map(str::trim).find(|line| {
        let line = line.to_ascii_lowercase();
        LOCAL_KEY_MARKERS.iter().any(|marker| line.contains(marker))
    });

    if let Some(line) = local_key {
        ExecError::Configuration(line.to_string())
    } else if AUTH_MARKERS.iter().any(|marker| lower.contains(marker)) {
        ExecError::AuthenticationFailed(detail)
    } else if CONFIG_MARKERS.iter().any(|marker| lower.contains(marker)) {
        ExecError::Configuration(detail)
    } else {
        ExecError::Unreachable(detail)
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Keep at most `max_bytes` from the end of `text`.
pub fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated]\n{}", &text[start..])
}
