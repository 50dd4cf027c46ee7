//! Readiness checks.
//!
//! A check performs one attempt and classifies its failure. Polling,
//! timeouts and attempt bookkeeping belong to the [`Prober`](crate::Prober).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::coordinates::Coordinates;
use crate::error::CheckError;
use crate::executor::{shell_quote, tail, RemoteExecutor};
use crate::phase::{Phase, PhaseAction};

/// How long a banner-expecting transport check waits for the first byte.
const BANNER_WAIT: Duration = Duration::from_secs(3);

/// Command used for the shell round trip.
const ROUNDTRIP_COMMAND: &str = "true";

/// One readiness attempt.
#[async_trait]
pub trait Check: Send + Sync {
    /// Short human description used in logs.
    fn describe(&self) -> String;

    /// Perform a single attempt.
    async fn check(&self, target: &Coordinates) -> Result<(), CheckError>;
}

/// Builds the check for a polled phase.
pub trait CheckFactory: Send + Sync {
    /// Returns `None` for one-shot phases.
    fn build(&self, phase: &Phase) -> Option<Box<dyn Check>>;
}

// =============================================================================
// Transport
// =============================================================================

/// TCP connect to a forwarded guest port.
pub struct TransportCheck {
    guest_port: u16,
    expect_banner: bool,
}

impl TransportCheck {
    pub fn new(guest_port: u16, expect_banner: bool) -> Self {
        Self {
            guest_port,
            expect_banner,
        }
    }
}

#[async_trait]
impl Check for TransportCheck {
    fn describe(&self) -> String {
        format!("tcp guest port {}", self.guest_port)
    }

    async fn check(&self, target: &Coordinates) -> Result<(), CheckError> {
        let port = target.host_port(self.guest_port).ok_or_else(|| {
            CheckError::configuration(format!("guest port {} is not forwarded", self.guest_port))
        })?;

        // Resolution failure will not heal with time.
        let addrs: Vec<_> = tokio::net::lookup_host((target.host.as_str(), port))
            .await
            .map_err(|e| {
                CheckError::configuration(format!("cannot resolve {}: {}", target.host, e))
            })?
            .collect();

        let mut stream = TcpStream::connect(addrs.as_slice())
            .await
            .map_err(|e| CheckError::transient(format!("connect to {}:{}: {}", target.host, port, e)))?;

        if !self.expect_banner {
            return Ok(());
        }

        let mut byte = [0u8; 1];
        match tokio::time::timeout(BANNER_WAIT, stream.read(&mut byte)).await {
            Ok(Ok(n)) if n > 0 => Ok(()),
            Ok(Ok(_)) => Err(CheckError::transient(
                "connection closed before the service sent a banner",
            )),
            Ok(Err(e)) => Err(CheckError::transient(format!("banner read failed: {}", e))),
            Err(_) => Err(CheckError::transient("no banner received")),
        }
    }
}

// =============================================================================
// Shell
// =============================================================================

/// Remote shell round trip.
pub struct ShellCheck {
    executor: Arc<dyn RemoteExecutor>,
    attempt_timeout: Duration,
}

impl ShellCheck {
    pub fn new(executor: Arc<dyn RemoteExecutor>, attempt_timeout: Duration) -> Self {
        Self {
            executor,
            attempt_timeout,
        }
    }
}

#[async_trait]
impl Check for ShellCheck {
    fn describe(&self) -> String {
        "shell round trip".to_string()
    }

    async fn check(&self, target: &Coordinates) -> Result<(), CheckError> {
        let output = self
            .executor
            .execute(target, ROUNDTRIP_COMMAND, self.attempt_timeout)
            .await?;

        if output.success() {
            Ok(())
        } else {
            Err(CheckError::configuration(format!(
                "`{}` exited with {}: {}",
                ROUNDTRIP_COMMAND,
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }
}

/// Presence (and optionally content) of a guest file.
pub struct FileCheck {
    executor: Arc<dyn RemoteExecutor>,
    path: String,
    needle: Option<String>,
    attempt_timeout: Duration,
}

impl FileCheck {
    pub fn exists(executor: Arc<dyn RemoteExecutor>, path: String, attempt_timeout: Duration) -> Self {
        Self {
            executor,
            path,
            needle: None,
            attempt_timeout,
        }
    }

    pub fn contains(
        executor: Arc<dyn RemoteExecutor>,
        path: String,
        needle: String,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            path,
            needle: Some(needle),
            attempt_timeout,
        }
    }

    fn command(&self) -> String {
        match &self.needle {
            None => format!("test -e {}", shell_quote(&self.path)),
            Some(needle) => format!(
                "grep -qF -- {} {}",
                shell_quote(needle),
                shell_quote(&self.path)
            ),
        }
    }
}

#[async_trait]
impl Check for FileCheck {
    fn describe(&self) -> String {
        match &self.needle {
            None => format!("file {} exists", self.path),
            Some(needle) => format!("file {} contains {:?}", self.path, needle),
        }
    }

    async fn check(&self, target: &Coordinates) -> Result<(), CheckError> {
        let output = self
            .executor
            .execute(target, &self.command(), self.attempt_timeout)
            .await?;

        // test: 1 = absent. grep: 1 = no match, 2 = unreadable/absent.
        match (output.exit_code, self.needle.is_some()) {
            (0, _) => Ok(()),
            (1, false) => Err(CheckError::transient(format!("{} not present yet", self.path))),
            (1, true) => Err(CheckError::transient(format!(
                "{} present without the expected content",
                self.path
            ))),
            (2, true) => Err(CheckError::transient(format!("{} not readable yet", self.path))),
            (code, _) => Err(CheckError::configuration(format!(
                "file check on {} exited with {}: {}",
                self.path,
                code,
                output.stderr.trim()
            ))),
        }
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// HTTP GET against a forwarded guest port.
pub struct HttpCheck {
    client: reqwest::Client,
    guest_port: u16,
    path: String,
    expect_status: u16,
    expect_body: Option<String>,
}

impl HttpCheck {
    pub fn new(
        client: reqwest::Client,
        guest_port: u16,
        path: String,
        expect_status: u16,
        expect_body: Option<String>,
    ) -> Self {
        Self {
            client,
            guest_port,
            path,
            expect_status,
            expect_body,
        }
    }
}

#[async_trait]
impl Check for HttpCheck {
    fn describe(&self) -> String {
        format!("GET guest port {}{}", self.guest_port, self.path)
    }

    async fn check(&self, target: &Coordinates) -> Result<(), CheckError> {
        let port = target.host_port(self.guest_port).ok_or_else(|| {
            CheckError::configuration(format!("guest port {} is not forwarded", self.guest_port))
        })?;
        let url = format!("http://{}:{}{}", target.host, port, self.path);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Err(CheckError::configuration(format!("invalid url {}: {}", url, e)))
            }
            Err(e) => return Err(CheckError::transient(format!("GET {}: {}", url, e))),
        };

        let status = response.status().as_u16();
        if status != self.expect_status {
            // Proxies and half-started services answer 502/503 for a while.
            return Err(CheckError::transient(format!(
                "GET {} returned {}, waiting for {}",
                url, status, self.expect_status
            )));
        }

        let Some(expected) = &self.expect_body else {
            return Ok(());
        };

        let body = response
            .text()
            .await
            .map_err(|e| CheckError::transient(format!("reading body of {}: {}", url, e)))?;

        if body.contains(expected.as_str()) {
            Ok(())
        } else {
            // Right status, wrong content: something else is answering.
            debug!(url = %url, "Health body mismatch");
            Err(CheckError::configuration(format!(
                "GET {} returned {} without {:?} in the body: {}",
                url,
                status,
                expected,
                tail(body.trim(), 200)
            )))
        }
    }
}

// =============================================================================
// Default Factory
// =============================================================================

/// Builds the production check for each probe kind.
pub struct Checks {
    executor: Arc<dyn RemoteExecutor>,
    client: reqwest::Client,
    attempt_timeout: Duration,
}

impl Checks {
    pub fn new(executor: Arc<dyn RemoteExecutor>, attempt_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(attempt_timeout)
            .timeout(attempt_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            executor,
            client,
            attempt_timeout,
        }
    }
}

impl CheckFactory for Checks {
    fn build(&self, phase: &Phase) -> Option<Box<dyn Check>> {
        let executor = Arc::clone(&self.executor);
        let check: Box<dyn Check> = match &phase.action {
            PhaseAction::Transport {
                port,
                expect_banner,
            } => Box::new(TransportCheck::new(*port, *expect_banner)),
            PhaseAction::ShellRoundtrip => {
                Box::new(ShellCheck::new(executor, self.attempt_timeout))
            }
            PhaseAction::HttpCheck {
                port,
                path,
                expect_status,
                expect_body,
            } => Box::new(HttpCheck::new(
                self.client.clone(),
                *port,
                path.clone(),
                *expect_status,
                expect_body.clone(),
            )),
            PhaseAction::FileExists { path } => Box::new(FileCheck::exists(
                executor,
                path.clone(),
                self.attempt_timeout,
            )),
            PhaseAction::FileContains { path, needle } => Box::new(FileCheck::contains(
                executor,
                path.clone(),
                needle.clone(),
                self.attempt_timeout,
            )),
            PhaseAction::Command { .. } => return None,
        };
        Some(check)
    }
}
