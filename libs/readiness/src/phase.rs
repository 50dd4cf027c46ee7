//! Phase definitions.
//!
//! A phase is one ordered, timeout-bounded step of the readiness sequence:
//! either a probe polled until it succeeds, or a one-shot remote command.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default polling interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Default HTTP health path.
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Default success token of the health endpoint.
pub const DEFAULT_HEALTH_TOKEN: &str = "healthy";

/// Whether a failing phase ends the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Failure ends the session.
    #[default]
    Fatal,
    /// Failure is recorded as a warning and the sequence continues.
    Warning,
}

/// What a phase does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PhaseAction {
    /// A guest port accepts TCP connections.
    ///
    /// With `expect_banner` the server must also send at least one byte,
    /// which distinguishes a forwarding proxy accepting on the host side from
    /// a guest service that is really listening.
    Transport {
        port: u16,
        #[serde(default)]
        expect_banner: bool,
    },

    /// A remote shell round trip succeeds.
    ShellRoundtrip,

    /// An HTTP GET returns the expected status and body token.
    HttpCheck {
        port: u16,
        #[serde(default = "default_health_path")]
        path: String,
        #[serde(default = "default_expect_status")]
        expect_status: u16,
        #[serde(default = "default_expect_body")]
        expect_body: Option<String>,
    },

    /// A file exists on the guest.
    FileExists { path: String },

    /// A file on the guest contains a literal string.
    FileContains { path: String, needle: String },

    /// A remote command run exactly once.
    Command {
        command: String,
        #[serde(default)]
        expect_exit: i32,
    },
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

fn default_expect_status() -> u16 {
    200
}

fn default_expect_body() -> Option<String> {
    Some(DEFAULT_HEALTH_TOKEN.to_string())
}

impl PhaseAction {
    pub fn kind(&self) -> &'static str {
        match self {
            PhaseAction::Transport { .. } => "transport",
            PhaseAction::ShellRoundtrip => "shell-roundtrip",
            PhaseAction::HttpCheck { .. } => "http-check",
            PhaseAction::FileExists { .. } => "file-exists",
            PhaseAction::FileContains { .. } => "file-contains",
            PhaseAction::Command { .. } => "command",
        }
    }

    /// One-shot actions are never polled.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, PhaseAction::Command { .. })
    }

    /// Whether this action goes through the remote shell.
    pub fn uses_shell(&self) -> bool {
        matches!(
            self,
            PhaseAction::ShellRoundtrip
                | PhaseAction::FileExists { .. }
                | PhaseAction::FileContains { .. }
                | PhaseAction::Command { .. }
        )
    }

    /// Guest port addressed directly (not through the shell).
    pub fn guest_port(&self) -> Option<u16> {
        match self {
            PhaseAction::Transport { port, .. } | PhaseAction::HttpCheck { port, .. } => {
                Some(*port)
            }
            _ => None,
        }
    }
}

/// A named, timeout-bounded step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    pub action: PhaseAction,
    pub timeout: Duration,
    pub interval: Duration,
    pub severity: Severity,
}

impl Phase {
    /// Create a fatal phase polled at the default interval.
    pub fn new(name: impl Into<String>, action: PhaseAction, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            action,
            timeout,
            interval: DEFAULT_INTERVAL.min(timeout),
            severity: Severity::Fatal,
        }
    }

    /// Downgrade failures of this phase to warnings.
    pub fn optional(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}
