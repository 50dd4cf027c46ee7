//! End-to-end session scenarios.
//!
//! Drives the orchestrator through acquire, sequence and release with the
//! in-memory provisioner, scripted checks and a scripted remote shell. Time
//! is paused, so multi-minute scenarios run instantly.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p vmsmoke-e2e --test sessions
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rstest::rstest;
use tokio::sync::watch;
use vmsmoke_readiness::{
    Check, CheckError, CheckFactory, Coordinates, CredentialRef, CredentialSeed, Credentials,
    FailureReason, LifecycleManager, Orchestrator, Outcome, Phase, PhaseStatus, Sequencer,
    SequencerConfig, SessionReport, TargetSpec, TeardownStatus, TimeoutCause,
};
use vmsmoke_testing::{FakeProvisioner, Reply, ScriptedChecks, ScriptedExecutor};

const DEPLOY_COMMAND: &str = "sudo systemctl start app";

/// Boot, log in, wait for cloud-init, deploy, check health.
const NOBLE: &str = r#"
name = "noble"
image = "/images/noble.qcow2"
forward_ports = [22, 80]

[[phases]]
name = "port-open"
kind = "transport"
port = 22
timeout_secs = 120
interval_secs = 2

[[phases]]
name = "shell-ready"
kind = "shell-roundtrip"
timeout_secs = 300
interval_secs = 5

[[phases]]
name = "cloud-init-done"
kind = "file-exists"
path = "/var/lib/cloud/instance/boot-finished"
timeout_secs = 600
interval_secs = 5

[[phases]]
name = "deploy"
kind = "command"
command = "sudo systemctl start app"
timeout_secs = 120

[[phases]]
name = "health"
kind = "http-check"
port = 80
timeout_secs = 300
interval_secs = 5
"#;

const PHASES: [&str; 5] = ["port-open", "shell-ready", "cloud-init-done", "deploy", "health"];

fn noble() -> TargetSpec {
    TargetSpec::from_toml_str(NOBLE).unwrap()
}

fn credentials() -> Credentials {
    Credentials {
        seed: CredentialSeed {
            principal: "ubuntu".to_string(),
            authorized_key: "ssh-ed25519 AAAAC3Nza vmsmoke-e2e".to_string(),
        },
        credential: CredentialRef::Agent,
    }
}

fn idle() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn orchestrator(
    provisioner: &Arc<FakeProvisioner>,
    executor: &Arc<ScriptedExecutor>,
    checks: Arc<dyn CheckFactory>,
) -> Orchestrator {
    let sequencer = Sequencer::new(executor.clone(), SequencerConfig::default())
        .with_check_factory(checks);
    Orchestrator::new(
        LifecycleManager::new(provisioner.clone()),
        Arc::new(sequencer),
        Duration::from_secs(60),
    )
}

fn statuses(report: &SessionReport) -> Vec<PhaseStatus> {
    report.phases.iter().map(|p| p.status).collect()
}

fn assert_released_once(provisioner: &FakeProvisioner) {
    assert_eq!(provisioner.provisioned(), 1);
    assert_eq!(provisioner.terminated(), 1);
    assert_eq!(provisioner.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn port_never_opens_times_out_after_budget() {
    let provisioner = FakeProvisioner::new().shared();
    let executor = Arc::new(ScriptedExecutor::new());
    let checks = Arc::new(ScriptedChecks::new().never("port-open"));
    let orchestrator = orchestrator(&provisioner, &executor, checks.clone());

    let report = orchestrator.run(&noble(), credentials(), idle()).await;

    match &report.outcome {
        Outcome::TimedOut {
            phase,
            budget,
            cause,
            last_failure,
        } => {
            assert_eq!(phase, "port-open");
            assert_eq!(*budget, Duration::from_secs(120));
            assert_eq!(*cause, TimeoutCause::PhaseTimeout);
            assert!(last_failure.is_some());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(report.reason_code, "timed_out");
    assert_eq!(report.exit_code(), 2);
    assert!(report.elapsed >= Duration::from_secs(120));
    assert!(report.elapsed < Duration::from_secs(125));
    assert_eq!(checks.attempts("port-open"), 60);
    assert_eq!(report.last_completed_phase, None);
    assert_eq!(
        statuses(&report),
        vec![
            PhaseStatus::TimedOut,
            PhaseStatus::NotRun,
            PhaseStatus::NotRun,
            PhaseStatus::NotRun,
            PhaseStatus::NotRun,
        ]
    );

    let diagnostics = report.diagnostics.as_ref().unwrap();
    assert_eq!(diagnostics.attempts.len(), 10);
    assert_eq!(diagnostics.remote_logs.len(), 2);
    assert_eq!(executor.count(DEPLOY_COMMAND), 0);
    assert_released_once(&provisioner);
}

#[tokio::test(start_paused = true)]
async fn slow_boot_passes_with_phase_timings() {
    let provisioner = FakeProvisioner::new().shared();
    let executor = Arc::new(ScriptedExecutor::new().on(DEPLOY_COMMAND, Reply::ok("started")));
    let checks = Arc::new(
        ScriptedChecks::new()
            .ready_at("port-open", Duration::from_secs(5))
            .ready_at("shell-ready", Duration::from_secs(40)),
    );
    let orchestrator = orchestrator(&provisioner, &executor, checks.clone());

    let report = orchestrator.run(&noble(), credentials(), idle()).await;

    assert_eq!(report.outcome, Outcome::Passed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.last_completed_phase.as_deref(), Some("health"));
    assert!(report.diagnostics.is_none());
    assert!(statuses(&report).iter().all(|s| *s == PhaseStatus::Passed));

    let port_open = &report.phases[0];
    let port_done = port_open.started_at + port_open.elapsed;
    assert!(port_done >= Duration::from_secs(5) && port_done <= Duration::from_secs(7));
    assert_eq!(port_open.attempts, 4);

    let shell = &report.phases[1];
    let shell_done = shell.started_at + shell.elapsed;
    assert!(shell_done >= Duration::from_secs(40) && shell_done <= Duration::from_secs(46));
    assert_eq!(shell.started_at, port_done);

    assert_eq!(executor.count(DEPLOY_COMMAND), 1);
    assert_eq!(report.teardown, Some(TeardownStatus::Released));
    assert_released_once(&provisioner);
}

#[tokio::test(start_paused = true)]
async fn failing_deploy_reports_output_without_retry() {
    let provisioner = FakeProvisioner::new().shared();
    let executor = Arc::new(ScriptedExecutor::new().on(
        DEPLOY_COMMAND,
        Reply::exit_with(5, "starting app", "Unit app.service not found."),
    ));
    let orchestrator = orchestrator(&provisioner, &executor, Arc::new(ScriptedChecks::new()));

    let report = orchestrator.run(&noble(), credentials(), idle()).await;

    assert_eq!(
        report.outcome,
        Outcome::Failed {
            phase: "deploy".to_string(),
            reason: FailureReason::CommandFailed {
                exit_code: 5,
                expected: 0,
            },
        }
    );
    assert_eq!(report.reason_code, "command_failed");
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.last_completed_phase.as_deref(), Some("cloud-init-done"));
    assert_eq!(executor.count(DEPLOY_COMMAND), 1);

    let capture = report
        .diagnostics
        .as_ref()
        .and_then(|d| d.command_output.as_ref())
        .unwrap();
    assert_eq!(capture.stdout, "starting app");
    assert_eq!(capture.stderr, "Unit app.service not found.");
    assert_eq!(report.phases[4].status, PhaseStatus::NotRun);
    assert_released_once(&provisioner);
}

#[tokio::test(start_paused = true)]
async fn warning_phase_is_reported_and_run_continues() {
    let target = TargetSpec::from_toml_str(&format!(
        "{}\n{}",
        NOBLE,
        r#"
[[phases]]
name = "motd"
kind = "file-contains"
path = "/etc/motd"
needle = "vmsmoke"
timeout_secs = 10
severity = "warning"
"#
    ))
    .unwrap();

    let provisioner = FakeProvisioner::new().shared();
    let executor = Arc::new(ScriptedExecutor::new());
    let checks = Arc::new(ScriptedChecks::new().reject("motd", "grep: /etc/motd: Is a directory"));
    let orchestrator = orchestrator(&provisioner, &executor, checks);

    let report = orchestrator.run(&target, credentials(), idle()).await;

    assert_eq!(report.outcome, Outcome::Passed);
    assert_eq!(report.phases[5].status, PhaseStatus::Warned);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].starts_with("motd"));
    assert_released_once(&provisioner);
}

#[tokio::test(start_paused = true)]
async fn session_deadline_cuts_late_phase_short() {
    let target = TargetSpec::from_toml_str(
        r#"
name = "tight"
image = "/images/noble.qcow2"
deadline_secs = 300

[[phases]]
name = "port-open"
kind = "transport"
port = 22
timeout_secs = 120

[[phases]]
name = "shell-ready"
kind = "shell-roundtrip"
timeout_secs = 300
interval_secs = 5
"#,
    )
    .unwrap();

    let provisioner = FakeProvisioner::new().shared();
    let executor = Arc::new(ScriptedExecutor::new());
    let checks = Arc::new(
        ScriptedChecks::new()
            .ready_at("port-open", Duration::from_secs(100))
            .never("shell-ready"),
    );
    let orchestrator = orchestrator(&provisioner, &executor, checks);

    let report = orchestrator.run(&target, credentials(), idle()).await;

    match &report.outcome {
        Outcome::TimedOut { phase, cause, budget, .. } => {
            assert_eq!(phase, "shell-ready");
            assert_eq!(*cause, TimeoutCause::SessionDeadline);
            assert!(*budget < Duration::from_secs(300));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(report.reason_code, "deadline_exceeded");
    assert_eq!(report.phases[1].reason_code, Some("deadline_exceeded"));
    assert!(report.elapsed >= Duration::from_secs(300));
    assert!(report.elapsed <= Duration::from_secs(302));
    assert_released_once(&provisioner);
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_session_and_releases() {
    let provisioner = FakeProvisioner::new().shared();
    let executor = Arc::new(ScriptedExecutor::new());
    let checks = Arc::new(ScriptedChecks::new().never("port-open"));
    let orchestrator = orchestrator(&provisioner, &executor, checks);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let target = noble();

    let (report, ()) = tokio::join!(
        orchestrator.run(&target, credentials(), shutdown_rx),
        async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            shutdown_tx.send(true).unwrap();
        }
    );

    assert_eq!(
        report.outcome,
        Outcome::Failed {
            phase: "port-open".to_string(),
            reason: FailureReason::Aborted,
        }
    );
    assert_eq!(report.reason_code, "aborted");
    assert!(report.elapsed < Duration::from_secs(31));
    assert_eq!(report.phases[0].status, PhaseStatus::Failed);
    assert_released_once(&provisioner);
}

#[tokio::test(start_paused = true)]
async fn provisioning_failure_runs_no_phase() {
    let provisioner = FakeProvisioner::failing("could not access KVM kernel module").shared();
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = orchestrator(&provisioner, &executor, Arc::new(ScriptedChecks::new()));

    let report = orchestrator.run(&noble(), credentials(), idle()).await;

    match &report.outcome {
        Outcome::Failed {
            phase,
            reason: FailureReason::ProvisioningFailed { message },
        } => {
            assert_eq!(phase, "provision");
            assert!(message.contains("KVM"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(report.exit_code(), 1);
    assert!(report.environment_id.is_none());
    assert!(report.teardown.is_none());
    assert!(statuses(&report).iter().all(|s| *s == PhaseStatus::NotRun));
    assert!(executor.calls().is_empty());
    assert_eq!(provisioner.terminated(), 0);
}

fn slow_boot_orchestrator(provisioner: &Arc<FakeProvisioner>, provision_timeout: Duration) -> Orchestrator {
    let sequencer = Sequencer::new(Arc::new(ScriptedExecutor::new()), SequencerConfig::default())
        .with_check_factory(Arc::new(ScriptedChecks::new()));
    Orchestrator::new(
        LifecycleManager::new(provisioner.clone()).with_provision_timeout(provision_timeout),
        Arc::new(sequencer),
        Duration::from_secs(60),
    )
}

#[tokio::test(start_paused = true)]
async fn hung_provisioning_is_bounded() {
    let provisioner = FakeProvisioner::new()
        .with_delay(Duration::from_secs(3600))
        .shared();
    let orchestrator = slow_boot_orchestrator(&provisioner, Duration::from_secs(300));

    let report = orchestrator.run(&noble(), credentials(), idle()).await;

    match &report.outcome {
        Outcome::Failed {
            phase,
            reason: FailureReason::ProvisioningFailed { message },
        } => {
            assert_eq!(phase, "provision");
            assert!(message.contains("300s"), "{}", message);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(report.elapsed >= Duration::from_secs(300));
    assert!(report.elapsed < Duration::from_secs(301));
    assert_eq!(provisioner.provisioned(), 0);
    assert_eq!(provisioner.terminated(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_provisioning_aborts() {
    let provisioner = FakeProvisioner::new()
        .with_delay(Duration::from_secs(120))
        .shared();
    let orchestrator = slow_boot_orchestrator(&provisioner, Duration::from_secs(300));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let target = noble();

    let (report, ()) = tokio::join!(
        orchestrator.run(&target, credentials(), shutdown_rx),
        async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            shutdown_tx.send(true).unwrap();
        }
    );

    assert_eq!(
        report.outcome,
        Outcome::Failed {
            phase: "provision".to_string(),
            reason: FailureReason::Aborted,
        }
    );
    assert_eq!(report.exit_code(), 1);
    assert!(report.elapsed < Duration::from_secs(11));
    assert!(statuses(&report).iter().all(|s| *s == PhaseStatus::NotRun));
    assert_eq!(provisioner.provisioned(), 0);
}

#[tokio::test(start_paused = true)]
async fn queued_session_after_shutdown_never_boots() {
    let provisioner = FakeProvisioner::new()
        .with_delay(Duration::from_secs(60))
        .shared();
    let orchestrator = slow_boot_orchestrator(&provisioner, Duration::from_secs(300));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown_tx.send(true).unwrap();

    let report = orchestrator.run(&noble(), credentials(), shutdown_rx).await;

    assert_eq!(report.reason_code, "aborted");
    assert!(report.elapsed < Duration::from_secs(1));
    assert_eq!(provisioner.provisioned(), 0);
    assert_eq!(provisioner.terminated(), 0);
}

#[tokio::test(start_paused = true)]
async fn teardown_failure_does_not_change_outcome() {
    let provisioner = FakeProvisioner::new().with_failing_teardown().shared();
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = orchestrator(&provisioner, &executor, Arc::new(ScriptedChecks::new()));

    let report = orchestrator.run(&noble(), credentials(), idle()).await;

    assert_eq!(report.outcome, Outcome::Passed);
    assert_eq!(report.exit_code(), 0);
    assert!(matches!(report.teardown, Some(TeardownStatus::Failed { .. })));
    assert_eq!(provisioner.terminated(), 1);
}

/// Failure injected at every phase boundary releases the environment once.
#[rstest]
#[case::port_open(0)]
#[case::shell_ready(1)]
#[case::cloud_init_done(2)]
#[case::deploy(3)]
#[case::health(4)]
#[tokio::test(start_paused = true)]
async fn failure_at_any_phase_releases_once(#[case] failing: usize) {
    let provisioner = FakeProvisioner::new().shared();
    let phase = PHASES[failing];
    let (executor, checks) = if phase == "deploy" {
        (
            ScriptedExecutor::new().on(DEPLOY_COMMAND, Reply::exit(1)),
            ScriptedChecks::new(),
        )
    } else {
        (
            ScriptedExecutor::new(),
            ScriptedChecks::new().reject(phase, "protocol mismatch"),
        )
    };
    let executor = Arc::new(executor);
    let orchestrator = orchestrator(&provisioner, &executor, Arc::new(checks));

    let report = orchestrator.run(&noble(), credentials(), idle()).await;

    assert_eq!(report.outcome.phase(), Some(phase));
    assert_eq!(
        report.last_completed_phase.as_deref(),
        failing.checked_sub(1).map(|i| PHASES[i])
    );
    assert!(report.phases[failing + 1..]
        .iter()
        .all(|p| p.status == PhaseStatus::NotRun));
    assert_released_once(&provisioner);
}

/// Check factory whose checks panic.
struct Exploding;

struct ExplodingCheck;

impl CheckFactory for Exploding {
    fn build(&self, phase: &Phase) -> Option<Box<dyn Check>> {
        (!phase.action.is_one_shot()).then(|| Box::new(ExplodingCheck) as Box<dyn Check>)
    }
}

#[async_trait]
impl Check for ExplodingCheck {
    fn describe(&self) -> String {
        "exploding".to_string()
    }

    async fn check(&self, _target: &Coordinates) -> Result<(), CheckError> {
        panic!("check blew up");
    }
}

#[tokio::test(start_paused = true)]
async fn panic_inside_session_still_releases() {
    let provisioner = FakeProvisioner::new().shared();
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = Arc::new(orchestrator(&provisioner, &executor, Arc::new(Exploding)));

    let task = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.run(&noble(), credentials(), idle()).await }
    });

    let err = task.await.unwrap_err();
    assert!(err.is_panic());
    assert_released_once(&provisioner);
}

#[tokio::test(start_paused = true)]
async fn concurrent_sessions_are_independent() {
    let fast = TargetSpec::from_toml_str(
        r#"
name = "fast"
image = "/images/fast.qcow2"

[[phases]]
name = "fast-port"
kind = "transport"
port = 22
timeout_secs = 60
"#,
    )
    .unwrap();
    let stuck = TargetSpec::from_toml_str(
        r#"
name = "stuck"
image = "/images/stuck.qcow2"

[[phases]]
name = "stuck-port"
kind = "transport"
port = 22
timeout_secs = 60
"#,
    )
    .unwrap();

    let provisioner = FakeProvisioner::new().shared();
    let executor = Arc::new(ScriptedExecutor::new());
    let checks = Arc::new(
        ScriptedChecks::new()
            .ready_at("fast-port", Duration::from_secs(10))
            .never("stuck-port"),
    );
    let orchestrator = orchestrator(&provisioner, &executor, checks);

    let (fast_report, stuck_report) = tokio::join!(
        orchestrator.run(&fast, credentials(), idle()),
        orchestrator.run(&stuck, credentials(), idle()),
    );

    assert_eq!(fast_report.outcome, Outcome::Passed);
    assert!(fast_report.elapsed < Duration::from_secs(15));
    assert!(stuck_report.outcome.is_timed_out());
    assert_ne!(fast_report.session_id, stuck_report.session_id);
    assert_ne!(fast_report.environment_id, stuck_report.environment_id);

    assert_eq!(provisioner.provisioned(), 2);
    assert_eq!(provisioner.terminated(), 2);
    let ids = provisioner.terminated_ids();
    assert_ne!(ids[0], ids[1]);
}

#[tokio::test(start_paused = true)]
async fn report_serializes_phase_trace() {
    let provisioner = FakeProvisioner::new().shared();
    let executor = Arc::new(ScriptedExecutor::new());
    let checks = Arc::new(ScriptedChecks::new().ready_at("port-open", Duration::from_secs(5)));
    let orchestrator = orchestrator(&provisioner, &executor, checks);

    let report = orchestrator.run(&noble(), credentials(), idle()).await;
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["outcome"]["verdict"], "passed");
    assert_eq!(json["reason_code"], "passed");
    assert_eq!(json["phases"].as_array().unwrap().len(), 5);
    assert_eq!(json["phases"][0]["name"], "port-open");
    assert_eq!(json["phases"][0]["status"], "passed");
    assert_eq!(json["phases"][0]["elapsed_ms"], 6_000);
    assert!(json["session_id"].as_str().unwrap().starts_with("ses_"));
    assert!(json["environment_id"].as_str().unwrap().starts_with("env_"));
}
