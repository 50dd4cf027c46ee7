//! Phase sequencer.
//!
//! Drives a [`Session`] through its phases in order:
//! - Each phase gets `min(phase timeout, time left to the session deadline)`
//! - Polled phases go through the [`Prober`]; command phases run exactly once
//! - A failing warning phase is annotated and the sequence continues,
//!   unless it ran into the session deadline
//! - A failing fatal phase ends the run, marks the rest not run and
//!   captures diagnostics
//! - A shutdown signal aborts the in-flight phase

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checks::{CheckFactory, Checks};
use crate::coordinates::Coordinates;
use crate::diagnostics::{
    CommandCapture, DiagnosticCollector, Diagnostics, DEFAULT_DIAGNOSTIC_COMMANDS,
};
use crate::error::{CheckError, ExecError};
use crate::executor::{tail, RemoteExecutor, MAX_CAPTURE_BYTES};
use crate::outcome::{FailureReason, Outcome, TimeoutCause};
use crate::phase::{Phase, PhaseAction};
use crate::probe::{Attempt, ProbeVerdict, Prober};
use crate::session::{PhaseRecord, PhaseStatus, Session};

/// Sequencer tuning.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Attempts retained per phase for diagnostics.
    pub attempt_history: usize,
    /// Upper bound for a single remote probe attempt.
    pub attempt_timeout: Duration,
    /// Sub-timeout for each diagnostic capture.
    pub diagnostic_timeout: Duration,
    pub diagnostic_commands: Vec<String>,
    pub console_tail_bytes: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            attempt_history: 10,
            attempt_timeout: Duration::from_secs(30),
            diagnostic_timeout: Duration::from_secs(10),
            diagnostic_commands: DEFAULT_DIAGNOSTIC_COMMANDS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            console_tail_bytes: 8 * 1024,
        }
    }
}

/// Result of driving a session to a terminal state.
#[derive(Debug, Clone)]
pub struct SessionRun {
    pub outcome: Outcome,
    /// Present for failed and timed-out runs.
    pub diagnostics: Option<Diagnostics>,
    /// One entry per failed warning phase.
    pub warnings: Vec<String>,
}

/// How a single phase ended.
enum Step {
    Passed,
    TimedOut {
        last_failure: Option<CheckError>,
    },
    Rejected(CheckError),
    CommandFailed(CommandCapture, i32),
    ExecFailed(ExecError),
}

struct PhaseResult {
    step: Step,
    attempts: u32,
    history: Vec<Attempt>,
}

impl PhaseResult {
    fn detail(&self) -> Option<String> {
        match &self.step {
            Step::Passed => None,
            Step::TimedOut {
                last_failure: Some(err),
            } => Some(format!("last failure {}", err)),
            Step::TimedOut { last_failure: None } => None,
            Step::Rejected(err) => Some(err.to_string()),
            Step::CommandFailed(capture, expected) => Some(format!(
                "exited with {} (expected {})",
                capture.exit_code, expected
            )),
            Step::ExecFailed(err) => Some(err.to_string()),
        }
    }
}

/// Runs phases for one session at a time; shareable across sessions.
pub struct Sequencer {
    executor: Arc<dyn RemoteExecutor>,
    checks: Arc<dyn CheckFactory>,
    prober: Prober,
    collector: DiagnosticCollector,
}

impl Sequencer {
    /// Create a sequencer with the production checks.
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: SequencerConfig) -> Self {
        let checks = Arc::new(Checks::new(Arc::clone(&executor), config.attempt_timeout));
        let collector = DiagnosticCollector::new(
            Arc::clone(&executor),
            config.diagnostic_commands,
            config.diagnostic_timeout,
            config.console_tail_bytes,
        );

        Self {
            executor,
            checks,
            prober: Prober::new(config.attempt_history),
            collector,
        }
    }

    /// Replace the check factory (used to script probes in tests).
    pub fn with_check_factory(mut self, checks: Arc<dyn CheckFactory>) -> Self {
        self.checks = checks;
        self
    }

    /// Drive `session` until it passes, fails, times out or is aborted.
    pub async fn run(&self, session: &mut Session, mut shutdown: watch::Receiver<bool>) -> SessionRun {
        let mut warnings = Vec::new();

        info!(
            session_id = %session.id(),
            target = %session.name(),
            phases = session.phases().len(),
            budget_ms = session.budget().as_millis() as u64,
            "Starting phase sequence"
        );

        while let Some(phase) = session.current_phase().cloned() {
            let remaining = session.remaining();
            let (budget, mut cause) = if phase.timeout < remaining {
                (phase.timeout, TimeoutCause::PhaseTimeout)
            } else {
                (remaining, TimeoutCause::SessionDeadline)
            };
            let started_at = session.elapsed();

            debug!(
                session_id = %session.id(),
                phase = %phase.name,
                kind = phase.action.kind(),
                budget_ms = budget.as_millis() as u64,
                "Entering phase"
            );

            let result = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => None,
                result = self.run_phase(session.coordinates(), &phase, budget) => Some(result),
            };

            let elapsed = session.elapsed().saturating_sub(started_at);
            let Some(result) = result else {
                warn!(session_id = %session.id(), phase = %phase.name, "Shutdown requested, aborting run");
                session.complete_phase(PhaseRecord {
                    name: phase.name.clone(),
                    kind: phase.action.kind(),
                    severity: phase.severity,
                    status: PhaseStatus::Failed,
                    started_at,
                    elapsed,
                    attempts: 0,
                    reason_code: Some(FailureReason::Aborted.code()),
                    detail: None,
                });
                session.skip_remaining();
                return SessionRun {
                    outcome: Outcome::Failed {
                        phase: phase.name,
                        reason: FailureReason::Aborted,
                    },
                    diagnostics: None,
                    warnings,
                };
            };

            let mut record = PhaseRecord {
                name: phase.name.clone(),
                kind: phase.action.kind(),
                severity: phase.severity,
                status: PhaseStatus::Passed,
                started_at,
                elapsed,
                attempts: result.attempts,
                reason_code: None,
                detail: result.detail(),
            };

            if let Step::Passed = result.step {
                info!(
                    session_id = %session.id(),
                    phase = %phase.name,
                    attempts = result.attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Phase passed"
                );
                session.complete_phase(record);
                continue;
            }

            // Running out the session deadline ends the run even in a warning phase.
            let deadline_hit = matches!(result.step, Step::TimedOut { .. })
                && (cause == TimeoutCause::SessionDeadline || session.remaining().is_zero());
            if deadline_hit {
                cause = TimeoutCause::SessionDeadline;
            }

            if !phase.is_fatal() && !deadline_hit {
                let detail = record.detail.clone().unwrap_or_else(|| "timed out".to_string());
                warn!(
                    session_id = %session.id(),
                    phase = %phase.name,
                    attempts = result.attempts,
                    detail = %detail,
                    "Warning phase failed, continuing"
                );
                warnings.push(format!("{}: {}", phase.name, detail));
                record.status = PhaseStatus::Warned;
                record.reason_code = Some(step_code(&result.step, cause));
                session.complete_phase(record);
                continue;
            }

            let outcome = fatal_outcome(&phase.name, &result.step, budget, cause);

            record.status = if outcome.is_timed_out() {
                PhaseStatus::TimedOut
            } else {
                PhaseStatus::Failed
            };
            record.reason_code = Some(step_code(&result.step, cause));

            error!(
                session_id = %session.id(),
                phase = %phase.name,
                attempts = result.attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                reason = record.reason_code.unwrap_or_default(),
                last_completed = session.last_completed_phase().unwrap_or("none"),
                "Fatal phase failed"
            );

            session.complete_phase(record);
            session.skip_remaining();

            let command_output = match result.step {
                Step::CommandFailed(capture, _) => Some(capture),
                _ => None,
            };
            let (remote_logs, console_tail) = self
                .collector
                .collect(session.coordinates(), session.console_log())
                .await;

            return SessionRun {
                outcome,
                diagnostics: Some(Diagnostics {
                    command_output,
                    attempts: result.history,
                    remote_logs,
                    console_tail,
                }),
                warnings,
            };
        }

        info!(
            session_id = %session.id(),
            elapsed_ms = session.elapsed().as_millis() as u64,
            warnings = warnings.len(),
            "All phases passed"
        );

        SessionRun {
            outcome: Outcome::Passed,
            diagnostics: None,
            warnings,
        }
    }

    async fn run_phase(&self, target: &Coordinates, phase: &Phase, budget: Duration) -> PhaseResult {
        if let PhaseAction::Command {
            command,
            expect_exit,
        } = &phase.action
        {
            return self.run_command(target, command, *expect_exit, budget).await;
        }

        let Some(check) = self.checks.build(phase) else {
            return PhaseResult {
                step: Step::Rejected(CheckError::configuration(format!(
                    "no check available for {} phase",
                    phase.action.kind()
                ))),
                attempts: 0,
                history: Vec::new(),
            };
        };

        let outcome = self
            .prober
            .probe(target, check.as_ref(), budget, phase.interval)
            .await;
        let step = match outcome.verdict {
            ProbeVerdict::Ready => Step::Passed,
            ProbeVerdict::Rejected(err) => Step::Rejected(err),
            ProbeVerdict::TimedOut { last_failure } => Step::TimedOut { last_failure },
        };

        PhaseResult {
            step,
            attempts: outcome.attempt_count,
            history: outcome.attempts,
        }
    }

    /// Run a one-shot command. Never retried.
    async fn run_command(
        &self,
        target: &Coordinates,
        command: &str,
        expect_exit: i32,
        budget: Duration,
    ) -> PhaseResult {
        if budget.is_zero() {
            return PhaseResult {
                step: Step::TimedOut { last_failure: None },
                attempts: 0,
                history: Vec::new(),
            };
        }

        let run = self.executor.execute(target, command, budget);
        let step = match tokio::time::timeout(budget, run).await {
            Ok(Ok(output)) if output.exit_code == expect_exit => Step::Passed,
            Ok(Ok(output)) => Step::CommandFailed(
                CommandCapture {
                    command: command.to_string(),
                    exit_code: output.exit_code,
                    stdout: tail(&output.stdout, MAX_CAPTURE_BYTES),
                    stderr: tail(&output.stderr, MAX_CAPTURE_BYTES),
                },
                expect_exit,
            ),
            Ok(Err(ExecError::Timeout(_))) | Err(_) => Step::TimedOut { last_failure: None },
            Ok(Err(err)) => Step::ExecFailed(err),
        };

        PhaseResult {
            step,
            attempts: 1,
            history: Vec::new(),
        }
    }
}

fn fatal_outcome(phase: &str, step: &Step, budget: Duration, cause: TimeoutCause) -> Outcome {
    let phase = phase.to_string();
    match step {
        Step::Passed => Outcome::Passed,
        Step::TimedOut { last_failure } => Outcome::TimedOut {
            phase,
            budget,
            cause,
            last_failure: last_failure.clone(),
        },
        Step::Rejected(err) => Outcome::Failed {
            phase,
            reason: FailureReason::Rejected {
                class: err.class,
                message: err.message.clone(),
            },
        },
        Step::CommandFailed(capture, expected) => Outcome::Failed {
            phase,
            reason: FailureReason::CommandFailed {
                exit_code: capture.exit_code,
                expected: *expected,
            },
        },
        Step::ExecFailed(err) => Outcome::Failed {
            phase,
            reason: FailureReason::ExecFailed {
                class: err.class(),
                message: err.to_string(),
            },
        },
    }
}

fn step_code(step: &Step, cause: TimeoutCause) -> &'static str {
    match step {
        Step::Passed => "passed",
        Step::TimedOut { .. } => cause.reason_code(),
        Step::Rejected(_) => "rejected",
        Step::CommandFailed(..) => "command_failed",
        Step::ExecFailed(_) => "exec_failed",
    }
}

/// Resolves once the shutdown flag is set. Never resolves if the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
