//! Environment lifecycle.
//!
//! The [`Provisioner`] trait abstracts where environments come from (a local
//! hypervisor, a fake in tests). The [`LifecycleManager`] guarantees that
//! every acquired environment is released exactly once:
//! - [`LifecycleManager::release`] consumes the [`Lease`], so a second
//!   release does not type-check
//! - [`LifecycleManager::scoped`] releases after the body finishes or panics
//! - Provisioning is bounded by a timeout and gives up on shutdown
//! - A lease dropped without release (e.g. a cancelled task) schedules the
//!   release on the runtime

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vmsmoke_id::{EnvironmentId, SessionId};

use crate::coordinates::{Coordinates, CredentialRef};
use crate::error::{ProvisionError, TeardownError};
use crate::sequencer::shutdown_requested;

/// Time allowed for one environment to come up.
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(300);

/// Public key embedded in first-boot configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSeed {
    pub principal: String,
    /// OpenSSH `authorized_keys` line.
    pub authorized_key: String,
}

/// Everything a provisioner needs to boot one environment.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub session_id: SessionId,
    pub name: String,
    pub image: PathBuf,
    pub seed: CredentialSeed,
    /// Credential the harness will use to log in.
    pub credential: CredentialRef,
    /// Guest ports that need a host-side forward.
    pub guest_ports: Vec<u16>,
    /// Commands run once by the guest's first-boot agent.
    pub first_boot_commands: Vec<String>,
}

/// A running environment.
#[derive(Debug, Clone)]
pub struct Environment {
    pub id: EnvironmentId,
    pub coordinates: Arc<Coordinates>,
    /// Serial console capture, if the provisioner has one.
    pub console_log: Option<PathBuf>,
}

/// Source of environments.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Boot an environment and return its connection coordinates.
    async fn provision(&self, request: &ProvisionRequest) -> Result<Environment, ProvisionError>;

    /// Destroy an environment and its resources.
    async fn terminate(&self, environment: &Environment) -> Result<(), TeardownError>;
}

/// How the release of an environment went. Never affects the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TeardownStatus {
    Released,
    Failed { error: String },
}

impl TeardownStatus {
    pub fn is_released(&self) -> bool {
        matches!(self, TeardownStatus::Released)
    }
}

/// An acquired environment that must be released.
pub struct Lease {
    environment: Environment,
    provisioner: Arc<dyn Provisioner>,
    released: bool,
}

impl Lease {
    pub fn environment(&self) -> &Environment {
        &self.environment
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let environment = self.environment.clone();
        let provisioner = Arc::clone(&self.provisioner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    environment_id = %environment.id,
                    "Lease dropped without release, releasing in background"
                );
                handle.spawn(async move {
                    if let Err(e) = provisioner.terminate(&environment).await {
                        warn!(environment_id = %environment.id, error = %e, "Background release failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    environment_id = %environment.id,
                    "Lease dropped outside a runtime, environment leaked"
                );
            }
        }
    }
}

/// Result of a scoped acquisition.
#[derive(Debug)]
pub struct Scoped<T> {
    pub value: T,
    pub teardown: TeardownStatus,
}

/// Acquires and releases environments.
#[derive(Clone)]
pub struct LifecycleManager {
    provisioner: Arc<dyn Provisioner>,
    provision_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    /// Provision an environment for `request`.
    ///
    /// Nothing is provisioned once `shutdown` is set; an in-flight
    /// provision is dropped on shutdown or after the provision timeout.
    pub async fn acquire(
        &self,
        request: &ProvisionRequest,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Lease, ProvisionError> {
        debug!(session_id = %request.session_id, image = %request.image.display(), "Acquiring environment");

        let provision =
            tokio::time::timeout(self.provision_timeout, self.provisioner.provision(request));
        let environment = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                warn!(session_id = %request.session_id, "Shutdown requested, not provisioning");
                return Err(ProvisionError::Aborted);
            }
            result = provision => match result {
                Ok(result) => result?,
                Err(_) => return Err(ProvisionError::TimedOut(self.provision_timeout)),
            },
        };
        info!(
            session_id = %request.session_id,
            environment_id = %environment.id,
            host = %environment.coordinates.host,
            ssh_port = environment.coordinates.ssh_port(),
            "Environment acquired"
        );

        Ok(Lease {
            environment,
            provisioner: Arc::clone(&self.provisioner),
            released: false,
        })
    }

    /// Release an environment. Failures are logged and returned, never raised.
    pub async fn release(&self, mut lease: Lease) -> TeardownStatus {
        lease.released = true;
        let environment = &lease.environment;

        match lease.provisioner.terminate(environment).await {
            Ok(()) => {
                info!(environment_id = %environment.id, "Environment released");
                TeardownStatus::Released
            }
            Err(e) => {
                warn!(environment_id = %environment.id, error = %e, "Environment release failed");
                TeardownStatus::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Acquire, run `body`, then release, whatever the body does.
    ///
    /// A panic in the body is resumed after the release.
    pub async fn scoped<T, F, Fut>(
        &self,
        request: &ProvisionRequest,
        shutdown: watch::Receiver<bool>,
        body: F,
    ) -> Result<Scoped<T>, ProvisionError>
    where
        F: FnOnce(Environment) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.acquire(request, shutdown).await?;
        let result = AssertUnwindSafe(body(lease.environment().clone()))
            .catch_unwind()
            .await;
        let teardown = self.release(lease).await;

        match result {
            Ok(value) => Ok(Scoped { value, teardown }),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
