use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use vmsmoke_id::EnvironmentId;
use vmsmoke_readiness::{
    Coordinates, Environment, PortForward, ProvisionError, ProvisionRequest, Provisioner,
    TeardownError,
};

/// First host port handed out.
const FIRST_HOST_PORT: u16 = 40_000;

/// In-memory provisioner.
///
/// Every environment gets distinct host ports. Terminating an environment
/// that is not live (never provisioned, or already terminated) is an error,
/// which makes double releases visible.
pub struct FakeProvisioner {
    host: String,
    next_port: AtomicU16,
    port_map: HashMap<u16, u16>,
    provision_delay: Duration,
    fail_provision: Option<String>,
    fail_teardown: bool,
    console_log: Option<PathBuf>,
    provisioned: AtomicU32,
    terminated: AtomicU32,
    live: Mutex<HashSet<EnvironmentId>>,
    terminated_ids: Mutex<Vec<EnvironmentId>>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            next_port: AtomicU16::new(FIRST_HOST_PORT),
            port_map: HashMap::new(),
            provision_delay: Duration::ZERO,
            fail_provision: None,
            fail_teardown: false,
            console_log: None,
            provisioned: AtomicU32::new(0),
            terminated: AtomicU32::new(0),
            live: Mutex::new(HashSet::new()),
            terminated_ids: Mutex::new(Vec::new()),
        }
    }

    /// Provisioner whose every provision fails.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_provision: Some(message.into()),
            ..Self::new()
        }
    }

    /// Releases are counted but reported as failed.
    pub fn with_failing_teardown(mut self) -> Self {
        self.fail_teardown = true;
        self
    }

    /// Forward `guest` to a fixed host port (e.g. a local test server).
    pub fn with_port(mut self, guest: u16, host: u16) -> Self {
        self.port_map.insert(guest, host);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.provision_delay = delay;
        self
    }

    pub fn with_console_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.console_log = Some(path.into());
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn provisioned(&self) -> u32 {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> u32 {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Environments provisioned and not yet terminated.
    pub fn live(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or_default()
    }

    pub fn terminated_ids(&self) -> Vec<EnvironmentId> {
        self.terminated_ids
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Environment, ProvisionError> {
        if !self.provision_delay.is_zero() {
            tokio::time::sleep(self.provision_delay).await;
        }
        if let Some(message) = &self.fail_provision {
            return Err(ProvisionError::Launch(message.clone()));
        }

        let forwards = request
            .guest_ports
            .iter()
            .map(|&guest| PortForward {
                guest,
                host: self
                    .port_map
                    .get(&guest)
                    .copied()
                    .unwrap_or_else(|| self.next_port.fetch_add(1, Ordering::SeqCst)),
            })
            .collect();

        let environment = Environment {
            id: EnvironmentId::new(),
            coordinates: Arc::new(Coordinates {
                host: self.host.clone(),
                principal: request.seed.principal.clone(),
                credential: request.credential.clone(),
                forwards,
            }),
            console_log: self.console_log.clone(),
        };

        self.provisioned.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut live) = self.live.lock() {
            live.insert(environment.id);
        }
        info!(
            session_id = %request.session_id,
            environment_id = %environment.id,
            "[FAKE] Environment provisioned"
        );
        Ok(environment)
    }

    async fn terminate(&self, environment: &Environment) -> Result<(), TeardownError> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut ids) = self.terminated_ids.lock() {
            ids.push(environment.id);
        }

        let was_live = self
            .live
            .lock()
            .map(|mut live| live.remove(&environment.id))
            .unwrap_or(false);
        if !was_live {
            return Err(TeardownError::UnknownEnvironment(environment.id));
        }

        info!(environment_id = %environment.id, "[FAKE] Environment terminated");
        if self.fail_teardown {
            return Err(TeardownError::Cleanup("scripted teardown failure".to_string()));
        }
        Ok(())
    }
}
