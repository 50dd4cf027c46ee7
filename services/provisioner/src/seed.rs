//! cloud-init NoCloud seed.
//!
//! `user-data` is a `#cloud-config` document and `meta-data` a plain
//! mapping. Both are rendered as JSON, which cloud-init reads as YAML.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;
use vmsmoke_readiness::{CredentialSeed, ProvisionError};

#[derive(Debug, Serialize)]
struct UserData<'a> {
    hostname: &'a str,
    users: Vec<User<'a>>,
    ssh_pwauth: bool,
    disable_root: bool,
    #[serde(skip_serializing_if = "no_commands")]
    runcmd: &'a [String],
}

fn no_commands(commands: &&[String]) -> bool {
    commands.is_empty()
}

#[derive(Debug, Serialize)]
struct User<'a> {
    name: &'a str,
    sudo: &'a str,
    shell: &'a str,
    lock_passwd: bool,
    ssh_authorized_keys: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct MetaData<'a> {
    #[serde(rename = "instance-id")]
    instance_id: &'a str,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
}

/// Render `user-data` creating the login principal with the seeded key.
pub fn render_user_data(
    seed: &CredentialSeed,
    hostname: &str,
    first_boot_commands: &[String],
) -> Result<String, serde_json::Error> {
    let document = UserData {
        hostname,
        users: vec![User {
            name: &seed.principal,
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            shell: "/bin/bash",
            lock_passwd: true,
            ssh_authorized_keys: vec![seed.authorized_key.as_str()],
        }],
        ssh_pwauth: false,
        disable_root: true,
        runcmd: first_boot_commands,
    };
    Ok(format!(
        "#cloud-config\n{}\n",
        serde_json::to_string_pretty(&document)?
    ))
}

/// Render `meta-data`. A fresh instance id makes cloud-init run again.
pub fn render_meta_data(instance_id: &str, hostname: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&MetaData {
        instance_id,
        local_hostname: hostname,
    })
}

/// Write both documents to `dir` and pack them into `seed.img`.
pub async fn write_seed(
    cloud_localds: &Path,
    dir: &Path,
    user_data: &str,
    meta_data: &str,
) -> Result<PathBuf, ProvisionError> {
    let user_path = dir.join("user-data");
    let meta_path = dir.join("meta-data");
    let image = dir.join("seed.img");

    tokio::fs::write(&user_path, user_data).await?;
    tokio::fs::write(&meta_path, meta_data).await?;

    let output = Command::new(cloud_localds)
        .arg(&image)
        .arg(&user_path)
        .arg(&meta_path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            ProvisionError::Prepare(format!("failed to run {}: {}", cloud_localds.display(), e))
        })?;

    if !output.status.success() {
        return Err(ProvisionError::Prepare(format!(
            "cloud-localds exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    debug!(path = %image.display(), "Wrote cloud-init seed");
    Ok(image)
}
