//! Validate command.
//!
//! Operates purely on local target files (offline).

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use vmsmoke_readiness::TargetSpec;

use crate::error::EXIT_USAGE;
use crate::output::{print_info, print_single, print_success, print_warning, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct ValidateCommand {
    /// Target files (TOML).
    #[arg(required = true, value_name = "TARGET")]
    targets: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ValidationResult {
    path: PathBuf,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phases: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deadline_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ValidateCommand {
    pub fn run(self, ctx: CommandContext) -> Result<i32> {
        let results: Vec<ValidationResult> = self
            .targets
            .into_iter()
            .map(|path| match TargetSpec::load(&path) {
                Ok(spec) => ValidationResult {
                    valid: true,
                    name: Some(spec.name.clone()),
                    phases: Some(spec.phases.len()),
                    deadline_secs: Some(spec.deadline(ctx.config.deadline_slack).as_secs()),
                    reason_code: None,
                    error: None,
                    path,
                },
                Err(e) => ValidationResult {
                    valid: false,
                    name: None,
                    phases: None,
                    deadline_secs: None,
                    reason_code: Some(e.reason_code()),
                    error: Some(e.to_string()),
                    path,
                },
            })
            .collect();

        match ctx.format {
            OutputFormat::Json => print_single(&results),
            OutputFormat::Table => {
                for result in &results {
                    match &result.error {
                        None => {
                            print_success(&format!("Target is valid: {}", result.path.display()));
                            print_info(&format!(
                                "{}: {} phase(s), deadline {}s",
                                result.name.as_deref().unwrap_or("-"),
                                result.phases.unwrap_or_default(),
                                result.deadline_secs.unwrap_or_default()
                            ));
                        }
                        Some(error) => print_warning(&format!("{}: {}", result.path.display(), error)),
                    }
                }
            }
        }

        let invalid = results.iter().filter(|r| !r.valid).count();
        Ok(if invalid == 0 { 0 } else { EXIT_USAGE })
    }
}
