//! rustup-backed toolchain provisioning

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{ProvisionError, Provisioner, Result, ToolchainSpec};

/// Installs toolchains with `rustup toolchain install`.
#[derive(Debug, Clone)]
pub struct RustupProvisioner {
    binary: String,
    timeout: Option<Duration>,
}

impl Default for RustupProvisioner {
    fn default() -> Self {
        Self {
            binary: "rustup".to_string(),
            timeout: Some(Duration::from_secs(900)),
        }
    }
}

impl RustupProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different rustup executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Bound the install time; `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Arguments passed to rustup for `spec`.
    pub fn install_args(spec: &ToolchainSpec) -> Vec<String> {
        let mut args = vec![
            "toolchain".to_string(),
            "install".to_string(),
            spec.channel.clone(),
            "--profile".to_string(),
            "minimal".to_string(),
            "--no-self-update".to_string(),
        ];
        if !spec.components.is_empty() {
            args.push("--component".to_string());
            args.push(spec.components.join(","));
        }
        if !spec.targets.is_empty() {
            args.push("--target".to_string());
            args.push(spec.targets.join(","));
        }
        args
    }
}

#[async_trait]
impl Provisioner for RustupProvisioner {
    async fn ensure(&self, spec: &ToolchainSpec) -> Result<()> {
        spec.validate()?;

        let args = Self::install_args(spec);
        debug!(binary = %self.binary, ?args, "Provisioning toolchain");

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ProvisionError::ToolNotFound {
                        tool: self.binary.clone(),
                    }
                } else {
                    ProvisionError::Spawn {
                        message: e.to_string(),
                    }
                }
            })?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ProvisionError::Timeout {
                    toolchain: spec.to_string(),
                    secs: limit.as_secs(),
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| ProvisionError::Spawn {
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(ProvisionError::InstallFailed {
                toolchain: spec.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(toolchain = %spec, "Toolchain ready");
        Ok(())
    }
}

/// Check if rustup is on PATH.
pub async fn is_rustup_available() -> bool {
    Command::new("rustup")
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Active toolchain for `dir` as reported by `rustup show active-toolchain`.
pub async fn active_toolchain(dir: &Path) -> Result<String> {
    let output = Command::new("rustup")
        .args(["show", "active-toolchain"])
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProvisionError::ToolNotFound {
                    tool: "rustup".to_string(),
                }
            } else {
                ProvisionError::Spawn {
                    message: e.to_string(),
                }
            }
        })?;

    if !output.status.success() {
        return Err(ProvisionError::Spawn {
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
