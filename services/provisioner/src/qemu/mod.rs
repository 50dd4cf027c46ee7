//! QEMU-backed environments.
//!
//! Each environment gets its own directory under the work dir holding the
//! disk overlay, the cloud-init seed, the serial console log and the
//! emulator's stderr. Terminating removes the directory.

mod config;
mod runtime;

pub use config::QemuConfig;
pub use runtime::{build_qemu_args, LaunchPlan, QemuProvisioner};
