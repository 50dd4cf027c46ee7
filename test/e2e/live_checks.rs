//! Readiness checks against real local services.
//!
//! A TCP listener stands in for the guest's ssh daemon and a mock HTTP
//! server for the deployed service's health endpoint. These tests use real
//! time and real sockets.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p vmsmoke-e2e --test live_checks
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use vmsmoke_readiness::checks::HttpCheck;
use vmsmoke_readiness::{
    Coordinates, CredentialRef, CredentialSeed, Credentials, FailureClass, LifecycleManager,
    Orchestrator, Outcome, PortForward, ProbeVerdict, Prober, Sequencer, SequencerConfig,
    TargetSpec,
};
use vmsmoke_testing::{FakeProvisioner, ScriptedExecutor};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BANNER: &[u8] = b"SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13\r\n";

/// Accept connections forever, greeting each with an ssh banner.
async fn fake_sshd() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(BANNER).await;
        }
    });
    port
}

async fn health_server(status: u16, body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(&server)
        .await;
    server
}

fn coordinates(http_port: u16) -> Coordinates {
    Coordinates {
        host: "127.0.0.1".to_string(),
        principal: "ubuntu".to_string(),
        credential: CredentialRef::Agent,
        forwards: vec![PortForward {
            guest: 80,
            host: http_port,
        }],
    }
}

fn health_check() -> HttpCheck {
    HttpCheck::new(
        reqwest::Client::new(),
        80,
        "/health".to_string(),
        200,
        Some("healthy".to_string()),
    )
}

#[tokio::test]
async fn full_stack_passes_against_local_services() {
    let ssh_port = fake_sshd().await;
    let server = health_server(200, r#"{"status": "healthy"}"#).await;

    let provisioner = FakeProvisioner::new()
        .with_port(22, ssh_port)
        .with_port(80, server.address().port())
        .shared();
    let executor = Arc::new(ScriptedExecutor::new());
    let sequencer = Sequencer::new(executor.clone(), SequencerConfig::default());
    let orchestrator = Orchestrator::new(
        LifecycleManager::new(provisioner.clone()),
        Arc::new(sequencer),
        Duration::from_secs(10),
    );

    let target = TargetSpec::from_toml_str(
        r#"
name = "local"
image = "/images/local.qcow2"
forward_ports = [22, 80]

[[phases]]
name = "port-open"
kind = "transport"
port = 22
expect_banner = true
timeout_secs = 5
interval_secs = 1

[[phases]]
name = "shell-ready"
kind = "shell-roundtrip"
timeout_secs = 5
interval_secs = 1

[[phases]]
name = "cloud-init-done"
kind = "file-exists"
path = "/var/lib/cloud/instance/boot-finished"
timeout_secs = 5
interval_secs = 1

[[phases]]
name = "health"
kind = "http-check"
port = 80
timeout_secs = 5
interval_secs = 1
"#,
    )
    .unwrap();

    let credentials = Credentials {
        seed: CredentialSeed {
            principal: "ubuntu".to_string(),
            authorized_key: "ssh-ed25519 AAAAC3Nza vmsmoke-e2e".to_string(),
        },
        credential: CredentialRef::Agent,
    };
    let report = orchestrator
        .run(&target, credentials, watch::channel(false).1)
        .await;

    assert_eq!(report.outcome, Outcome::Passed, "{:?}", report.phases);
    assert!(report.phases.iter().all(|p| p.attempts == 1));
    assert_eq!(executor.calls().len(), 2);
    assert_eq!(provisioner.terminated(), 1);
}

#[tokio::test]
async fn health_with_wrong_body_is_rejected_at_once() {
    let server = health_server(200, "<h1>It works!</h1>").await;
    let target = coordinates(server.address().port());

    let outcome = Prober::new(10)
        .probe(
            &target,
            &health_check(),
            Duration::from_secs(5),
            Duration::from_millis(100),
        )
        .await;

    match outcome.verdict {
        ProbeVerdict::Rejected(err) => {
            assert_eq!(err.class, FailureClass::ProtocolOrConfiguration);
            assert!(err.message.contains("healthy"));
        }
        other => panic!("unexpected verdict {:?}", other),
    }
    assert_eq!(outcome.attempt_count, 1);
}

#[tokio::test]
async fn health_recovers_after_service_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("healthy"))
        .mount(&server)
        .await;
    let target = coordinates(server.address().port());

    let outcome = Prober::new(10)
        .probe(
            &target,
            &health_check(),
            Duration::from_secs(5),
            Duration::from_millis(100),
        )
        .await;

    assert_eq!(outcome.verdict, ProbeVerdict::Ready);
    assert_eq!(outcome.attempt_count, 3);
    assert_eq!(outcome.attempts.len(), 3);
}

#[tokio::test]
async fn closed_port_times_out_as_transient() {
    // Bind then drop, so the port is very likely closed.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let target = coordinates(port);

    let outcome = Prober::new(3)
        .probe(
            &target,
            &health_check(),
            Duration::from_millis(500),
            Duration::from_millis(100),
        )
        .await;

    match outcome.verdict {
        ProbeVerdict::TimedOut { last_failure } => {
            assert_eq!(
                last_failure.map(|e| e.class),
                Some(FailureClass::TransientUnready)
            );
        }
        other => panic!("unexpected verdict {:?}", other),
    }
    assert!(outcome.attempts.len() <= 3);
    assert!(outcome.elapsed < Duration::from_secs(2));
}
