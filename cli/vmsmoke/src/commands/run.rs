//! Run command - boot every target and drive it through its phases.
//!
//! Each target file becomes one session with its own key pair, environment
//! and forwarded ports. Sessions run concurrently up to `--parallel`;
//! Ctrl-C aborts all of them and their environments are still released.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use vmsmoke_provisioner::{generate_keypair, QemuConfig, QemuProvisioner};
use vmsmoke_readiness::outcome::EXIT_FAILED;
use vmsmoke_readiness::{
    LifecycleManager, Orchestrator, RunSummary, Sequencer, SessionReport, SshExecutor,
};

use crate::error::CliError;
use crate::output::print_summary;

use super::{load_targets, CommandContext};

#[derive(Debug, Args)]
pub struct RunCommand {
    /// Target files (TOML).
    #[arg(required = true, value_name = "TARGET")]
    targets: Vec<PathBuf>,

    /// Maximum number of sessions running at once.
    #[arg(long, default_value = "1")]
    parallel: NonZeroUsize,

    /// Also write the JSON report to this path.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// ssh-keygen binary used for per-session keys.
    #[arg(long, env = "VMSMOKE_SSH_KEYGEN", default_value = "ssh-keygen")]
    ssh_keygen: PathBuf,
}

impl RunCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<i32> {
        let targets = load_targets(&self.targets)?;
        let qemu = QemuConfig::from_env().map_err(CliError::Config)?;
        let config = ctx.config;

        tokio::fs::create_dir_all(&config.work_dir)
            .await
            .map_err(|source| CliError::WorkDir {
                path: config.work_dir.clone(),
                source,
            })?;

        // Keys first: a missing ssh-keygen is a setup error, not a failed session.
        let mut sessions = Vec::with_capacity(targets.len());
        for target in targets {
            let key_dir = tempfile::Builder::new()
                .prefix("keys-")
                .tempdir_in(&config.work_dir)
                .map_err(|source| CliError::WorkDir {
                    path: config.work_dir.clone(),
                    source,
                })?;
            let keys = generate_keypair(
                &self.ssh_keygen,
                key_dir.path(),
                &format!("vmsmoke-{}", target.name),
            )
            .await
            .map_err(CliError::SessionKey)?;
            let credentials = keys.credentials(&target.principal);
            sessions.push((target, credentials, key_dir));
        }

        let provisioner = Arc::new(QemuProvisioner::new(qemu));
        let executor = Arc::new(SshExecutor::new(config.ssh_config()));
        let sequencer = Arc::new(Sequencer::new(executor, config.sequencer_config()));
        let orchestrator = Arc::new(Orchestrator::new(
            LifecycleManager::new(provisioner).with_provision_timeout(config.provision_timeout),
            sequencer,
            config.deadline_slack,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, aborting sessions");
                let _ = shutdown_tx.send(true);
            }
        });

        info!(
            sessions = sessions.len(),
            parallel = self.parallel.get(),
            "Starting run"
        );

        let semaphore = Arc::new(Semaphore::new(self.parallel.get()));
        let mut tasks = JoinSet::new();
        for (index, (target, credentials, key_dir)) in sessions.into_iter().enumerate() {
            let orchestrator = Arc::clone(&orchestrator);
            let semaphore = Arc::clone(&semaphore);
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let report = orchestrator.run(&target, credentials, shutdown).await;
                drop(key_dir);
                (index, report)
            });
        }

        let mut reports = Vec::new();
        let mut crashed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(error = %e, "Session task crashed");
                    crashed += 1;
                }
            }
        }
        signal.abort();

        let summary = RunSummary::new(in_input_order(reports));
        print_summary(&summary, ctx.format);

        if let Some(path) = &self.report {
            write_report(path, &summary)?;
            info!(path = %path.display(), "Report written");
        }

        Ok(if crashed > 0 { EXIT_FAILED } else { summary.exit_code })
    }
}

/// Sessions finish in any order; reports follow the command line.
fn in_input_order(mut reports: Vec<(usize, SessionReport)>) -> Vec<SessionReport> {
    reports.sort_by_key(|(index, _)| *index);
    reports.into_iter().map(|(_, report)| report).collect()
}

fn write_report(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json).map_err(|source| CliError::Report {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
