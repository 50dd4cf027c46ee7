//! Local virtual machine provisioning for vmsmoke.
//!
//! Boots cloud images under QEMU with user-mode networking:
//! - a copy-on-write overlay per environment, so the base image stays clean
//! - a cloud-init NoCloud seed carrying the login key and first-boot commands
//! - loopback port forwards for every guest port a target needs
//! - the serial console captured to a file for failure diagnostics

pub mod keys;
pub mod ports;
pub mod qemu;
pub mod seed;

pub use keys::{generate_keypair, KeyPair};
pub use ports::allocate_ports;
pub use qemu::{QemuConfig, QemuProvisioner};
