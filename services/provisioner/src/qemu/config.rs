//! QEMU provisioner configuration.

use std::path::PathBuf;
use std::time::Duration;

use vmsmoke_readiness::config::{parse_var, ConfigError};

/// Configuration for [`QemuProvisioner`](super::QemuProvisioner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuConfig {
    /// Path to the system emulator.
    pub qemu_binary: PathBuf,
    /// Path to `qemu-img`.
    pub qemu_img: PathBuf,
    /// Path to `cloud-localds`.
    pub cloud_localds: PathBuf,
    /// Base directory for environment data.
    pub work_dir: PathBuf,
    /// Format of base images.
    pub base_format: String,
    pub memory_mb: u32,
    pub cpus: u32,
    /// Accelerators for `-machine accel=`, first available wins.
    pub accel: String,
    /// The emulator must survive this long after launch.
    pub startup_grace: Duration,
    /// Time between SIGTERM and SIGKILL on terminate.
    pub stop_grace: Duration,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            qemu_binary: PathBuf::from("qemu-system-x86_64"),
            qemu_img: PathBuf::from("qemu-img"),
            cloud_localds: PathBuf::from("cloud-localds"),
            work_dir: std::env::temp_dir().join("vmsmoke"),
            base_format: "qcow2".to_string(),
            memory_mb: 2048,
            cpus: 2,
            accel: "kvm:tcg".to_string(),
            startup_grace: Duration::from_secs(2),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl QemuConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let path = |key: &str, default: PathBuf| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(default)
        };

        Ok(Self {
            qemu_binary: path("VMSMOKE_QEMU_BINARY", defaults.qemu_binary),
            qemu_img: path("VMSMOKE_QEMU_IMG", defaults.qemu_img),
            cloud_localds: path("VMSMOKE_CLOUD_LOCALDS", defaults.cloud_localds),
            work_dir: path("VMSMOKE_WORK_DIR", defaults.work_dir),
            memory_mb: parse_var(&lookup, "VMSMOKE_VM_MEMORY_MB", defaults.memory_mb)?,
            cpus: parse_var(&lookup, "VMSMOKE_VM_CPUS", defaults.cpus)?,
            accel: lookup("VMSMOKE_QEMU_ACCEL")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.accel),
            ..defaults
        })
    }
}
