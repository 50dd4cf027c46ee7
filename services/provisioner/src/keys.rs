//! Per-session SSH key pairs.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use vmsmoke_readiness::{CredentialRef, CredentialSeed, Credentials};

/// Key file name inside the session directory.
const KEY_FILE: &str = "id_ed25519";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ssh-keygen exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("failed to read public key: {0}")]
    Read(#[from] std::io::Error),
}

/// A generated key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: PathBuf,
    /// `authorized_keys` line.
    pub public_key: String,
}

impl KeyPair {
    /// Seed the public half for `principal` and log in with the private half.
    pub fn credentials(&self, principal: &str) -> Credentials {
        Credentials {
            seed: CredentialSeed {
                principal: principal.to_string(),
                authorized_key: self.public_key.clone(),
            },
            credential: CredentialRef::IdentityFile {
                path: self.private_key.clone(),
            },
        }
    }
}

/// Generate an unencrypted ed25519 key pair in `dir` with `ssh-keygen`.
pub async fn generate_keypair(ssh_keygen: &Path, dir: &Path, comment: &str) -> Result<KeyPair, KeyError> {
    let private_key = dir.join(KEY_FILE);

    let output = Command::new(ssh_keygen)
        .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
        .arg(&private_key)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| KeyError::Spawn {
            binary: ssh_keygen.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(KeyError::Failed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let public_key = tokio::fs::read_to_string(private_key.with_extension("pub"))
        .await?
        .trim()
        .to_string();
    debug!(path = %private_key.display(), "Generated session key");

    Ok(KeyPair {
        private_key,
        public_key,
    })
}
