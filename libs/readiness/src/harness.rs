//! One target, end to end: acquire, sequence, release, report.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use vmsmoke_id::SessionId;

use crate::coordinates::CredentialRef;
use crate::error::ProvisionError;
use crate::lifecycle::{CredentialSeed, LifecycleManager, ProvisionRequest};
use crate::outcome::{FailureReason, Outcome};
use crate::report::SessionReport;
use crate::sequencer::Sequencer;
use crate::session::{PhaseRecord, Session};
use crate::target::TargetSpec;

/// Phase name reported when the environment could not be acquired.
pub const PROVISION_PHASE: &str = "provision";

/// Login material for one session.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Seeded into the guest at first boot.
    pub seed: CredentialSeed,
    /// Used by the harness to log in.
    pub credential: CredentialRef,
}

/// Runs targets as isolated sessions.
pub struct Orchestrator {
    lifecycle: LifecycleManager,
    sequencer: Arc<Sequencer>,
    deadline_slack: Duration,
}

impl Orchestrator {
    pub fn new(lifecycle: LifecycleManager, sequencer: Arc<Sequencer>, deadline_slack: Duration) -> Self {
        Self {
            lifecycle,
            sequencer,
            deadline_slack,
        }
    }

    /// Run one target to a terminal outcome.
    ///
    /// The environment is released on every path; a release failure is
    /// reported in `teardown` and leaves the outcome untouched.
    pub async fn run(
        &self,
        target: &TargetSpec,
        credentials: Credentials,
        shutdown: watch::Receiver<bool>,
    ) -> SessionReport {
        let session_id = SessionId::new();
        let span = info_span!("session", session_id = %session_id, target = %target.name);
        self.run_session(session_id, target, credentials, shutdown)
            .instrument(span)
            .await
    }

    async fn run_session(
        &self,
        session_id: SessionId,
        target: &TargetSpec,
        credentials: Credentials,
        shutdown: watch::Receiver<bool>,
    ) -> SessionReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let phases = target.phases();
        let budget = target.deadline(self.deadline_slack);

        let request = ProvisionRequest {
            session_id,
            name: target.name.clone(),
            image: target.image.clone(),
            seed: credentials.seed,
            credential: credentials.credential,
            guest_ports: target.guest_ports(),
            first_boot_commands: target.first_boot_commands.clone(),
        };

        info!(
            image = %target.image.display(),
            phases = phases.len(),
            budget_ms = budget.as_millis() as u64,
            "Starting session"
        );

        let sequencer = Arc::clone(&self.sequencer);
        let scoped = self
            .lifecycle
            .scoped(&request, shutdown.clone(), |environment| {
                let phases = phases.clone();
                async move {
                    let mut session = Session::new(
                        session_id,
                        target.name.clone(),
                        Arc::clone(&environment.coordinates),
                        phases,
                        budget,
                    );
                    if let Some(log) = &environment.console_log {
                        session = session.with_console_log(log);
                    }
                    let run = sequencer.run(&mut session, shutdown).await;
                    (environment.id, run, session)
                }
            })
            .await;

        let report = match scoped {
            Ok(scoped) => {
                let (environment_id, run, session) = scoped.value;
                let last_completed_phase = session.last_completed_phase().map(str::to_string);
                SessionReport {
                    session_id,
                    target: target.name.clone(),
                    environment_id: Some(environment_id),
                    started_at,
                    elapsed: clock.elapsed(),
                    reason_code: run.outcome.reason_code(),
                    outcome: run.outcome,
                    last_completed_phase,
                    phases: session.into_records(),
                    warnings: run.warnings,
                    diagnostics: run.diagnostics,
                    teardown: Some(scoped.teardown),
                }
            }
            Err(e) => {
                let reason = match e {
                    ProvisionError::Aborted => {
                        warn!("Shutdown before the environment came up, no phase ran");
                        FailureReason::Aborted
                    }
                    e => {
                        error!(error = %e, "Provisioning failed, no phase ran");
                        FailureReason::ProvisioningFailed {
                            message: e.to_string(),
                        }
                    }
                };
                let outcome = Outcome::Failed {
                    phase: PROVISION_PHASE.to_string(),
                    reason,
                };
                SessionReport {
                    session_id,
                    target: target.name.clone(),
                    environment_id: None,
                    started_at,
                    elapsed: clock.elapsed(),
                    reason_code: outcome.reason_code(),
                    outcome,
                    last_completed_phase: None,
                    phases: phases.iter().map(PhaseRecord::not_run).collect(),
                    warnings: Vec::new(),
                    diagnostics: None,
                    teardown: None,
                }
            }
        };

        info!(
            outcome = report.reason_code,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Session finished"
        );
        report
    }
}
