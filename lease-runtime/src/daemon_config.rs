//! Container daemon storage sizing.
//!
//! Administrative side channel: writes the devicemapper base size into the
//! daemon configuration file and restarts the daemon so it takes effect.

use blueprint_sdk::info;
use serde::Serialize;
use serde_json::json;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{LeaseError, Result};

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub config_path: PathBuf,
    /// Program and arguments used to restart the daemon.
    pub restart_command: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/docker/daemon.json"),
            restart_command: vec![
                "systemctl".to_string(),
                "restart".to_string(),
                "docker".to_string(),
            ],
        }
    }
}

impl DaemonConfig {
    /// `DOCKER_DAEMON_CONFIG` overrides the file, `DOCKER_RESTART_COMMAND`
    /// (whitespace separated) overrides the restart command.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config_path: env::var("DOCKER_DAEMON_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            restart_command: env::var("DOCKER_RESTART_COMMAND")
                .ok()
                .map(|v| v.split_whitespace().map(str::to_string).collect::<Vec<_>>())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.restart_command),
        }
    }
}

/// Render the daemon configuration with 4-space indentation.
pub fn render_base_size_config(base_size: &str) -> Result<String> {
    let value = json!({
        "storage-driver": "devicemapper",
        "storage-opts": [format!("dm.basesize={base_size}")],
    });
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|err| LeaseError::Validation(format!("daemon config: {err}")))?;
    String::from_utf8(out).map_err(|err| LeaseError::Validation(format!("daemon config: {err}")))
}

pub async fn write_base_size(path: &Path, base_size: &str) -> Result<()> {
    if base_size.trim().is_empty() {
        return Err(LeaseError::Validation("base size is required".into()));
    }
    let body = render_base_size_config(base_size.trim())?;
    tokio::fs::write(path, body).await.map_err(|err| {
        LeaseError::Persistence(format!("Failed to write {}: {err}", path.display()))
    })
}

pub async fn restart_daemon(command: &[String]) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| LeaseError::Validation("restart command is empty".into()))?;
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|err| LeaseError::RuntimeAccess(format!("Failed to run {program}: {err}")))?;
    if !status.success() {
        return Err(LeaseError::RuntimeAccess(format!(
            "{} exited with {status}",
            command.join(" ")
        )));
    }
    Ok(())
}

/// Write the base size directive, then restart the daemon.
pub async fn set_docker_base_size(config: &DaemonConfig, base_size: &str) -> Result<()> {
    write_base_size(&config.config_path, base_size).await?;
    info!(
        "daemon: wrote base size {base_size} to {}, restarting",
        config.config_path.display()
    );
    restart_daemon(&config.restart_command).await
}
