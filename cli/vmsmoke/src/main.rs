//! vmsmoke - boot virtual machine images and drive them through phased
//! readiness checks.
//!
//! Exit status: 0 all passed, 1 at least one session failed, 2 at least
//! one timed out and none failed, 3 usage or configuration error.

use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmsmoke_readiness::HarnessConfig;

mod commands;
mod error;
mod output;

use commands::{Cli, LogFormat};
use error::{CliError, EXIT_USAGE};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            // Printing to a closed stdout is not worth reporting.
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let config = match HarnessConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error::print_error(&CliError::Config(e).into());
            std::process::exit(EXIT_USAGE);
        }
    };

    init_tracing(cli.log_format, &config.log_filter);

    match cli.run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error::print_error(&e);
            std::process::exit(EXIT_USAGE);
        }
    }
}

/// Log to stderr so stdout stays machine-readable.
fn init_tracing(format: LogFormat, default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}
