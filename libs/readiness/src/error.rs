//! Error taxonomy for the readiness core.
//!
//! Every failure observed while driving a session falls into one of five
//! buckets:
//!
//! - `TransientUnready`: still booting; retried inside the phase budget
//! - `AuthenticationNotYetAvailable`: credentials not applied yet; retried
//! - `ProtocolOrConfiguration`: a defect, never retried
//! - `EnvironmentProvisioningFailure`: [`ProvisionError`], fails the session
//!   before any phase runs
//! - `TeardownFailure`: [`TeardownError`], logged, never changes the outcome
//!
//! The first three are per-attempt classifications ([`FailureClass`]).

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use vmsmoke_id::EnvironmentId;

/// Classification of a single failed readiness attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Connection refused, reset, not listening yet, or attempt timed out.
    TransientUnready,
    /// The remote end answered but rejected our credentials.
    AuthenticationNotYetAvailable,
    /// Misconfiguration or protocol mismatch; retrying cannot help.
    ProtocolOrConfiguration,
}

impl FailureClass {
    /// Whether the prober keeps polling after an attempt of this class.
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureClass::ProtocolOrConfiguration)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::TransientUnready => "transient_unready",
            FailureClass::AuthenticationNotYetAvailable => "authentication_not_yet_available",
            FailureClass::ProtocolOrConfiguration => "protocol_or_configuration",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of one readiness check attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{class}: {message}")]
pub struct CheckError {
    pub class: FailureClass,
    pub message: String,
}

impl CheckError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::TransientUnready, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(FailureClass::AuthenticationNotYetAvailable, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(FailureClass::ProtocolOrConfiguration, message)
    }
}

/// Errors from a single remote command execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// The remote shell could not be reached (refused, reset, no route).
    #[error("host unreachable: {0}")]
    Unreachable(String),

    /// The remote shell rejected the credential.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The command did not finish within its timeout and was killed.
    #[error("command timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Local misconfiguration: missing binary, missing identity file,
    /// unresolvable host, bad ssh option.
    #[error("remote shell misconfigured: {0}")]
    Configuration(String),
}

impl ExecError {
    /// Map this error onto the readiness failure taxonomy.
    pub fn class(&self) -> FailureClass {
        match self {
            ExecError::Unreachable(_) | ExecError::Timeout(_) => FailureClass::TransientUnready,
            ExecError::AuthenticationFailed(_) => FailureClass::AuthenticationNotYetAvailable,
            ExecError::Configuration(_) => FailureClass::ProtocolOrConfiguration,
        }
    }
}

impl From<ExecError> for CheckError {
    fn from(err: ExecError) -> Self {
        CheckError::new(err.class(), err.to_string())
    }
}

/// The environment could not be acquired; no phase runs.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The request itself is unusable (missing image, no ports).
    #[error("invalid provisioning request: {0}")]
    InvalidRequest(String),

    /// Disk, seed or directory preparation failed.
    #[error("failed to prepare environment: {0}")]
    Prepare(String),

    /// The hypervisor process failed to start or exited during startup.
    #[error("hypervisor failed to start: {0}")]
    Launch(String),

    #[error("environment not ready within {}s", .0.as_secs())]
    TimedOut(Duration),

    /// Shutdown was requested before the environment came up.
    #[error("provisioning aborted by shutdown")]
    Aborted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Releasing an environment failed. Logged, never escalated.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("unknown environment: {0}")]
    UnknownEnvironment(EnvironmentId),

    #[error("hypervisor process did not stop: {0}")]
    ProcessStillRunning(String),

    #[error("failed to clean up environment files: {0}")]
    Cleanup(String),
}
