//! QEMU provisioner implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use vmsmoke_id::EnvironmentId;
use vmsmoke_readiness::executor::tail;
use vmsmoke_readiness::{
    Coordinates, Environment, PortForward, ProvisionError, ProvisionRequest, Provisioner,
    TeardownError,
};

use super::config::QemuConfig;
use crate::ports::allocate_ports;
use crate::seed::{render_meta_data, render_user_data, write_seed};

/// Host address the forwards bind to.
const LOOPBACK: &str = "127.0.0.1";

const OVERLAY_FILE: &str = "disk.qcow2";
const CONSOLE_FILE: &str = "console.log";
const STDERR_FILE: &str = "qemu.stderr";

/// A running emulator.
struct Instance {
    process: Child,
    work_dir: PathBuf,
}

/// Everything the emulator command line depends on.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub name: String,
    pub overlay: PathBuf,
    pub seed: PathBuf,
    pub console_log: PathBuf,
    pub forwards: Vec<PortForward>,
}

/// Build the emulator arguments for `plan`.
pub fn build_qemu_args(config: &QemuConfig, plan: &LaunchPlan) -> Vec<String> {
    let mut netdev = String::from("user,id=net0");
    for forward in &plan.forwards {
        netdev.push_str(&format!(
            ",hostfwd=tcp:{}:{}-:{}",
            LOOPBACK, forward.host, forward.guest
        ));
    }

    vec![
        "-name".to_string(),
        plan.name.clone(),
        "-machine".to_string(),
        format!("q35,accel={}", config.accel),
        "-cpu".to_string(),
        "max".to_string(),
        "-smp".to_string(),
        config.cpus.max(1).to_string(),
        "-m".to_string(),
        config.memory_mb.to_string(),
        "-display".to_string(),
        "none".to_string(),
        "-serial".to_string(),
        format!("file:{}", plan.console_log.display()),
        "-drive".to_string(),
        format!("file={},if=virtio,format=qcow2", plan.overlay.display()),
        "-drive".to_string(),
        format!("file={},if=virtio,format=raw", plan.seed.display()),
        "-netdev".to_string(),
        netdev,
        "-device".to_string(),
        "virtio-net-pci,netdev=net0".to_string(),
    ]
}

/// Provisioner booting cloud images under QEMU.
pub struct QemuProvisioner {
    config: QemuConfig,
    instances: RwLock<HashMap<EnvironmentId, Instance>>,
}

impl QemuProvisioner {
    pub fn new(config: QemuConfig) -> Self {
        Self {
            config,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Get the directory holding an environment's disk, seed and logs.
    fn instance_dir(&self, id: &EnvironmentId) -> PathBuf {
        self.config.work_dir.join("environments").join(id.to_string())
    }

    /// Create a copy-on-write overlay on top of the base image.
    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<(), ProvisionError> {
        let base = tokio::fs::canonicalize(base).await.map_err(|e| {
            ProvisionError::InvalidRequest(format!("image {}: {}", base.display(), e))
        })?;

        let output = Command::new(&self.config.qemu_img)
            .args(["create", "-q", "-f", "qcow2", "-F", &self.config.base_format, "-b"])
            .arg(&base)
            .arg(overlay)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ProvisionError::Prepare(format!(
                    "failed to run {}: {}",
                    self.config.qemu_img.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(ProvisionError::Prepare(format!(
                "qemu-img exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Launch the emulator and make sure it survives the startup grace.
    async fn launch(&self, dir: &Path, plan: &LaunchPlan) -> Result<Child, ProvisionError> {
        let stderr_path = dir.join(STDERR_FILE);
        let stderr = std::fs::File::create(&stderr_path)?;
        let args = build_qemu_args(&self.config, plan);
        debug!(binary = %self.config.qemu_binary.display(), args = ?args, "Launching emulator");

        let mut process = Command::new(&self.config.qemu_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProvisionError::Launch(format!(
                    "failed to run {}: {}",
                    self.config.qemu_binary.display(),
                    e
                ))
            })?;

        match tokio::time::timeout(self.config.startup_grace, process.wait()).await {
            Err(_) => Ok(process),
            Ok(status) => {
                let stderr = tokio::fs::read_to_string(&stderr_path)
                    .await
                    .unwrap_or_default();
                let status = status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| e.to_string());
                Err(ProvisionError::Launch(format!(
                    "emulator exited during startup ({}): {}",
                    status,
                    tail(stderr.trim(), 2048)
                )))
            }
        }
    }

    async fn prepare_and_launch(
        &self,
        id: &EnvironmentId,
        dir: &Path,
        request: &ProvisionRequest,
    ) -> Result<(Child, Vec<PortForward>, PathBuf), ProvisionError> {
        let hostname = format!("vmsmoke-{}", id.short());

        let overlay = dir.join(OVERLAY_FILE);
        self.create_overlay(&request.image, &overlay).await?;

        let user_data = render_user_data(&request.seed, &hostname, &request.first_boot_commands)
            .map_err(|e| ProvisionError::Prepare(format!("user-data: {}", e)))?;
        let meta_data = render_meta_data(&id.to_string(), &hostname)
            .map_err(|e| ProvisionError::Prepare(format!("meta-data: {}", e)))?;
        let seed = write_seed(&self.config.cloud_localds, dir, &user_data, &meta_data).await?;

        let ports = allocate_ports(request.guest_ports.len())?;
        let forwards: Vec<PortForward> = request
            .guest_ports
            .iter()
            .zip(ports)
            .map(|(&guest, host)| PortForward { guest, host })
            .collect();

        let console_log = dir.join(CONSOLE_FILE);
        let plan = LaunchPlan {
            name: hostname,
            overlay,
            seed,
            console_log: console_log.clone(),
            forwards: forwards.clone(),
        };
        let process = self.launch(dir, &plan).await?;

        Ok((process, forwards, console_log))
    }

    /// Stop the emulator: SIGTERM, then SIGKILL after the stop grace.
    async fn stop(&self, id: &EnvironmentId, process: &mut Child) -> Result<(), TeardownError> {
        if let Some(pid) = process.id() {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(environment_id = %id, "SIGTERM failed, will force kill");
            }
        }

        match tokio::time::timeout(self.config.stop_grace, process.wait()).await {
            Ok(Ok(status)) => {
                debug!(environment_id = %id, %status, "Emulator exited");
                return Ok(());
            }
            Ok(Err(e)) => warn!(environment_id = %id, error = %e, "Waiting for emulator failed"),
            Err(_) => warn!(environment_id = %id, "Emulator ignored SIGTERM, killing"),
        }

        process
            .kill()
            .await
            .map_err(|e| TeardownError::ProcessStillRunning(format!("{}: {}", id, e)))
    }
}

#[async_trait]
impl Provisioner for QemuProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Environment, ProvisionError> {
        if request.guest_ports.is_empty() {
            return Err(ProvisionError::InvalidRequest(
                "no guest ports to forward".to_string(),
            ));
        }

        let id = EnvironmentId::new();
        let dir = self.instance_dir(&id);
        info!(
            session_id = %request.session_id,
            environment_id = %id,
            image = %request.image.display(),
            "Provisioning QEMU environment"
        );

        tokio::fs::create_dir_all(&dir).await?;

        let (process, forwards, console_log) =
            match self.prepare_and_launch(&id, &dir, request).await {
                Ok(launched) => launched,
                Err(e) => {
                    error!(environment_id = %id, error = %e, "Provisioning failed");
                    if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                        warn!(environment_id = %id, error = %cleanup, "Failed to remove work directory");
                    }
                    return Err(e);
                }
            };

        info!(
            environment_id = %id,
            pid = process.id(),
            forwards = ?forwards,
            "Emulator running"
        );

        self.instances.write().await.insert(
            id,
            Instance {
                process,
                work_dir: dir,
            },
        );

        Ok(Environment {
            id,
            coordinates: Arc::new(Coordinates {
                host: LOOPBACK.to_string(),
                principal: request.seed.principal.clone(),
                credential: request.credential.clone(),
                forwards,
            }),
            console_log: Some(console_log),
        })
    }

    async fn terminate(&self, environment: &Environment) -> Result<(), TeardownError> {
        let id = environment.id;
        info!(environment_id = %id, "Terminating QEMU environment");

        let mut instance = self
            .instances
            .write()
            .await
            .remove(&id)
            .ok_or(TeardownError::UnknownEnvironment(id))?;

        let stopped = self.stop(&id, &mut instance.process).await;

        let cleaned = match tokio::fs::remove_dir_all(&instance.work_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TeardownError::Cleanup(format!(
                "{}: {}",
                instance.work_dir.display(),
                e
            ))),
        };

        stopped.and(cleaned)
    }
}
