//! Error handling and display for the CLI.

use std::path::PathBuf;

use colored::Colorize;
use thiserror::Error;
use vmsmoke_provisioner::keys::KeyError;
use vmsmoke_readiness::{ConfigError, TargetSpecError};

/// Exit status for usage and configuration errors.
pub const EXIT_USAGE: i32 = 3;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid target {}: {source}", path.display())]
    InvalidTarget {
        path: PathBuf,
        #[source]
        source: TargetSpecError,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to create session key: {0}")]
    SessionKey(#[from] KeyError),

    #[error("failed to create work directory {}: {source}", path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write report {}: {source}", path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::InvalidTarget { path, .. } => {
                eprintln!(
                    "\n{}",
                    format!("Hint: Run `vmsmoke validate {}` for details.", path.display()).yellow()
                );
            }
            CliError::Config(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: Check the VMSMOKE_* environment variables.".yellow()
                );
            }
            CliError::SessionKey(KeyError::Spawn { .. }) => {
                eprintln!(
                    "\n{}",
                    "Hint: Install openssh-client or set VMSMOKE_SSH_KEYGEN.".yellow()
                );
            }
            _ => {}
        }
    }
}
