//! CLI commands.

mod run;
mod validate;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use vmsmoke_readiness::{HarnessConfig, TargetSpec};

use crate::error::CliError;
use crate::output::OutputFormat;

/// vmsmoke - boot images and check they come up ready.
#[derive(Debug, Parser)]
#[command(name = "vmsmoke")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Log format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Boot each target and run its readiness phases.
    Run(run::RunCommand),

    /// Parse and validate target files without booting anything.
    Validate(validate::ValidateCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command and return the process exit status.
    pub async fn run(self, config: HarnessConfig) -> Result<i32> {
        let ctx = CommandContext {
            config,
            format: self.format,
        };

        match self.command {
            Commands::Run(cmd) => cmd.run(ctx).await,
            Commands::Validate(cmd) => cmd.run(ctx),
            Commands::Version => {
                println!("vmsmoke {}", env!("CARGO_PKG_VERSION"));
                Ok(0)
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: HarnessConfig,
    pub format: OutputFormat,
}

/// Load and validate target files, stopping at the first bad one.
fn load_targets(paths: &[PathBuf]) -> Result<Vec<TargetSpec>, CliError> {
    paths.iter().map(|path| load_target(path)).collect()
}

fn load_target(path: &Path) -> Result<TargetSpec, CliError> {
    TargetSpec::load(path).map_err(|source| CliError::InvalidTarget {
        path: path.to_path_buf(),
        source,
    })
}
