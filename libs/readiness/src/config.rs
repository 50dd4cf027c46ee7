//! Harness configuration from `VMSMOKE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::executor::SshConfig;
use crate::lifecycle::DEFAULT_PROVISION_TIMEOUT;
use crate::sequencer::SequencerConfig;

/// A configuration value could not be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Parse an optional variable, keeping `default` when unset or empty.
///
/// A value that is set but does not parse is an error.
pub fn parse_var<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: value.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

/// Like [`parse_var`] for a whole number of seconds that must be positive.
pub fn parse_secs<F>(lookup: &F, key: &'static str, default_secs: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_var(lookup, key, default_secs)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be at least one second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

/// Harness configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Root for per-session work directories (keys, disks, seeds).
    pub work_dir: PathBuf,

    /// `ssh` binary used by the remote executor.
    pub ssh_binary: PathBuf,

    pub ssh_connect_timeout: Duration,

    /// Sub-timeout for each diagnostic capture.
    pub diagnostic_timeout: Duration,

    /// Attempts kept per phase for failure reports.
    pub attempt_history: usize,

    /// Added to the sum of phase timeouts when a target has no deadline.
    pub deadline_slack: Duration,

    /// Time allowed for an environment to come up.
    pub provision_timeout: Duration,

    /// Tracing filter directive.
    pub log_filter: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("vmsmoke"),
            ssh_binary: PathBuf::from("ssh"),
            ssh_connect_timeout: Duration::from_secs(10),
            diagnostic_timeout: Duration::from_secs(10),
            attempt_history: 10,
            deadline_slack: Duration::from_secs(60),
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
            log_filter: "info".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let work_dir = lookup("VMSMOKE_WORK_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);

        let ssh_binary = lookup("VMSMOKE_SSH_BINARY")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.ssh_binary);

        let ssh_connect_timeout = parse_secs(
            &lookup,
            "VMSMOKE_SSH_CONNECT_TIMEOUT_SECS",
            defaults.ssh_connect_timeout.as_secs(),
        )?;
        let diagnostic_timeout = parse_secs(
            &lookup,
            "VMSMOKE_DIAGNOSTIC_TIMEOUT_SECS",
            defaults.diagnostic_timeout.as_secs(),
        )?;
        let attempt_history = parse_var(&lookup, "VMSMOKE_ATTEMPT_HISTORY", defaults.attempt_history)?;
        let deadline_slack = Duration::from_secs(parse_var(
            &lookup,
            "VMSMOKE_DEADLINE_SLACK_SECS",
            defaults.deadline_slack.as_secs(),
        )?);

        let provision_timeout = parse_secs(
            &lookup,
            "VMSMOKE_PROVISION_TIMEOUT_SECS",
            defaults.provision_timeout.as_secs(),
        )?;

        let log_filter = lookup("VMSMOKE_LOG")
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.log_filter);

        Ok(Self {
            work_dir,
            ssh_binary,
            ssh_connect_timeout,
            diagnostic_timeout,
            attempt_history,
            deadline_slack,
            provision_timeout,
            log_filter,
        })
    }

    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            binary: self.ssh_binary.clone(),
            connect_timeout: self.ssh_connect_timeout,
            ..SshConfig::default()
        }
    }

    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            attempt_history: self.attempt_history,
            diagnostic_timeout: self.diagnostic_timeout,
            ..SequencerConfig::default()
        }
    }
}
