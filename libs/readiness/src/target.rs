//! Target files.
//!
//! A target file describes one environment (image, login principal,
//! forwarded guest ports) and the ordered phases it must pass.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordinates::SSH_GUEST_PORT;
use crate::phase::{Phase, PhaseAction, Severity};
use crate::session::Session;

/// Errors from loading or validating a target file.
#[derive(Debug, Error)]
pub enum TargetSpecError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid target file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("target name must not be empty")]
    EmptyName,

    #[error("target {0:?} has no phases")]
    NoPhases(String),

    #[error("phase name {0:?} is used more than once")]
    DuplicatePhase(String),

    #[error("phase {0:?} has a zero timeout")]
    ZeroTimeout(String),

    #[error("phase {0:?} has a zero interval")]
    ZeroInterval(String),

    #[error("phase {phase:?} polls every {interval_secs}s but times out after {timeout_secs}s")]
    IntervalExceedsTimeout {
        phase: String,
        interval_secs: u64,
        timeout_secs: u64,
    },

    #[error("phase {phase:?} uses guest port {port}, which is not in forward_ports")]
    PortNotForwarded { phase: String, port: u16 },

    #[error("phase {0:?} needs a remote shell but guest port 22 is not forwarded")]
    ShellPortNotForwarded(String),

    #[error("deadline of {deadline_secs}s is shorter than the longest phase timeout ({longest_secs}s)")]
    DeadlineTooShort { deadline_secs: u64, longest_secs: u64 },

    #[error("{field} of {secs}s is above the {max_secs}s limit")]
    TooLong {
        field: String,
        secs: u64,
        max_secs: u64,
    },
}

impl TargetSpecError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            TargetSpecError::Read { .. } => "unreadable",
            TargetSpecError::Parse(_) => "parse_error",
            _ => "invalid_target",
        }
    }
}

/// Upper bound for any phase timeout or session deadline (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

fn check_limit(field: impl FnOnce() -> String, secs: u64) -> Result<(), TargetSpecError> {
    if secs > MAX_TIMEOUT_SECS {
        return Err(TargetSpecError::TooLong {
            field: field(),
            secs,
            max_secs: MAX_TIMEOUT_SECS,
        });
    }
    Ok(())
}

fn default_principal() -> String {
    "ubuntu".to_string()
}

fn default_forward_ports() -> Vec<u16> {
    vec![SSH_GUEST_PORT]
}

fn default_interval_secs() -> u64 {
    2
}

/// One `[[phases]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    #[serde(flatten)]
    pub action: PhaseAction,
    pub timeout_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub severity: Severity,
}

impl PhaseSpec {
    pub fn to_phase(&self) -> Phase {
        Phase {
            name: self.name.clone(),
            action: self.action.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            interval: Duration::from_secs(self.interval_secs),
            severity: self.severity,
        }
    }
}

/// A parsed target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    pub image: PathBuf,
    #[serde(default = "default_principal")]
    pub principal: String,
    #[serde(default = "default_forward_ports")]
    pub forward_ports: Vec<u16>,
    /// Overall deadline; defaults to the sum of phase timeouts plus slack.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    /// Commands the guest runs once at first boot.
    #[serde(default)]
    pub first_boot_commands: Vec<String>,
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
}

impl TargetSpec {
    /// Parse and validate a target from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, TargetSpecError> {
        let spec: TargetSpec = toml::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Read, parse and validate a target file.
    pub fn load(path: &Path) -> Result<Self, TargetSpecError> {
        let text = std::fs::read_to_string(path).map_err(|source| TargetSpecError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), TargetSpecError> {
        if self.name.trim().is_empty() {
            return Err(TargetSpecError::EmptyName);
        }
        if self.phases.is_empty() {
            return Err(TargetSpecError::NoPhases(self.name.clone()));
        }

        let forwarded: HashSet<u16> = self.forward_ports.iter().copied().collect();
        let mut names = HashSet::new();

        for phase in &self.phases {
            if !names.insert(phase.name.as_str()) {
                return Err(TargetSpecError::DuplicatePhase(phase.name.clone()));
            }
            if phase.timeout_secs == 0 {
                return Err(TargetSpecError::ZeroTimeout(phase.name.clone()));
            }
            check_limit(|| format!("phase {:?} timeout", phase.name), phase.timeout_secs)?;
            if phase.interval_secs == 0 {
                return Err(TargetSpecError::ZeroInterval(phase.name.clone()));
            }
            if phase.interval_secs > phase.timeout_secs {
                return Err(TargetSpecError::IntervalExceedsTimeout {
                    phase: phase.name.clone(),
                    interval_secs: phase.interval_secs,
                    timeout_secs: phase.timeout_secs,
                });
            }
            if let Some(port) = phase.action.guest_port() {
                if !forwarded.contains(&port) {
                    return Err(TargetSpecError::PortNotForwarded {
                        phase: phase.name.clone(),
                        port,
                    });
                }
            }
            if phase.action.uses_shell() && !forwarded.contains(&SSH_GUEST_PORT) {
                return Err(TargetSpecError::ShellPortNotForwarded(phase.name.clone()));
            }
        }

        if let Some(deadline_secs) = self.deadline_secs {
            check_limit(|| "deadline".to_string(), deadline_secs)?;
            let longest_secs = self
                .phases
                .iter()
                .map(|p| p.timeout_secs)
                .max()
                .unwrap_or_default();
            if deadline_secs < longest_secs {
                return Err(TargetSpecError::DeadlineTooShort {
                    deadline_secs,
                    longest_secs,
                });
            }
        }

        Ok(())
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.phases.iter().map(PhaseSpec::to_phase).collect()
    }

    /// Session budget: the explicit deadline, or phase timeouts plus `slack`.
    pub fn deadline(&self, slack: Duration) -> Duration {
        match self.deadline_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Session::default_budget(&self.phases(), slack),
        }
    }

    /// Forwarded guest ports without duplicates, in file order.
    pub fn guest_ports(&self) -> Vec<u16> {
        let mut seen = HashSet::new();
        self.forward_ports
            .iter()
            .copied()
            .filter(|p| seen.insert(*p))
            .collect()
    }
}
