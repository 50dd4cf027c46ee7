//! Connection coordinates of an acquired environment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Guest port of the remote shell.
pub const SSH_GUEST_PORT: u16 = 22;

/// A guest port exposed on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub guest: u16,
    pub host: u16,
}

/// How the orchestrator authenticates to the remote shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialRef {
    /// Private key file whose public half was seeded into the guest.
    IdentityFile { path: PathBuf },
    /// Whatever the local ssh agent offers.
    Agent,
}

/// Where and as whom a session reaches its environment.
///
/// Supplied once by the lifecycle manager; a session never changes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    pub host: String,
    pub principal: String,
    pub credential: CredentialRef,
    pub forwards: Vec<PortForward>,
}

impl Coordinates {
    /// Host-side port for a guest port, if forwarded.
    pub fn host_port(&self, guest: u16) -> Option<u16> {
        self.forwards
            .iter()
            .find(|forward| forward.guest == guest)
            .map(|forward| forward.host)
    }

    pub fn ssh_port(&self) -> Option<u16> {
        self.host_port(SSH_GUEST_PORT)
    }
}
