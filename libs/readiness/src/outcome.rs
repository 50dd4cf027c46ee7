//! Terminal verdict of a session.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::{CheckError, FailureClass};
use crate::report::as_millis;

/// Why a phase that did not time out failed the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A probe hit a non-retryable failure.
    Rejected { class: FailureClass, message: String },
    /// A one-shot command exited with an unexpected status.
    CommandFailed { exit_code: i32, expected: i32 },
    /// A one-shot command could not be executed.
    ExecFailed { class: FailureClass, message: String },
    /// The run was interrupted by a shutdown request.
    Aborted,
    /// The environment could not be acquired; no phase ran.
    ProvisioningFailed { message: String },
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Rejected { .. } => "rejected",
            FailureReason::CommandFailed { .. } => "command_failed",
            FailureReason::ExecFailed { .. } => "exec_failed",
            FailureReason::Aborted => "aborted",
            FailureReason::ProvisioningFailed { .. } => "provisioning_failed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected { class, message } => write!(f, "{}: {}", class, message),
            FailureReason::CommandFailed {
                exit_code,
                expected,
            } => write!(f, "command exited with {} (expected {})", exit_code, expected),
            FailureReason::ExecFailed { message, .. } => f.write_str(message),
            FailureReason::Aborted => f.write_str("aborted by shutdown request"),
            FailureReason::ProvisioningFailed { message } => {
                write!(f, "provisioning failed: {}", message)
            }
        }
    }
}

/// What cut a timed-out phase short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutCause {
    /// The phase used up its own timeout.
    PhaseTimeout,
    /// The session deadline left less than the phase timeout.
    SessionDeadline,
}

impl TimeoutCause {
    /// Reason code recorded in the phase trace.
    pub fn reason_code(self) -> &'static str {
        match self {
            TimeoutCause::PhaseTimeout => "timed_out",
            TimeoutCause::SessionDeadline => "deadline_exceeded",
        }
    }
}

/// Terminal verdict. Created once by the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed {
        phase: String,
        reason: FailureReason,
    },
    TimedOut {
        phase: String,
        #[serde(rename = "budget_ms", serialize_with = "as_millis")]
        budget: Duration,
        cause: TimeoutCause,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_failure: Option<CheckError>,
    },
}

/// Exit status for a passed run.
pub const EXIT_PASSED: i32 = 0;
/// Exit status for a failed run.
pub const EXIT_FAILED: i32 = 1;
/// Exit status for a timed-out run.
pub const EXIT_TIMED_OUT: i32 = 2;

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Outcome::TimedOut { .. })
    }

    /// The phase the run ended in, if it did not pass.
    pub fn phase(&self) -> Option<&str> {
        match self {
            Outcome::Passed => None,
            Outcome::Failed { phase, .. } | Outcome::TimedOut { phase, .. } => Some(phase),
        }
    }

    /// Stable code for scripting consumers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed { reason, .. } => reason.code(),
            Outcome::TimedOut { cause, .. } => cause.reason_code(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Passed => EXIT_PASSED,
            Outcome::Failed { .. } => EXIT_FAILED,
            Outcome::TimedOut { .. } => EXIT_TIMED_OUT,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => f.write_str("passed"),
            Outcome::Failed { phase, reason } => {
                write!(f, "failed in phase {:?}: {}", phase, reason)
            }
            Outcome::TimedOut {
                phase,
                budget,
                cause,
                last_failure,
            } => {
                let limit = match cause {
                    TimeoutCause::PhaseTimeout => "phase timeout",
                    TimeoutCause::SessionDeadline => "session deadline",
                };
                write!(
                    f,
                    "timed out in phase {:?} after {}s ({})",
                    phase,
                    budget.as_secs(),
                    limit
                )?;
                if let Some(err) = last_failure {
                    write!(f, "; last failure {}", err)?;
                }
                Ok(())
            }
        }
    }
}
