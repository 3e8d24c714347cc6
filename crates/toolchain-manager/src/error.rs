//! Error types for toolchain-manager

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while provisioning a toolchain.
///
/// Payloads are plain strings so the error can be recorded in pipeline
/// results and cloned across tasks.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisionError {
    /// Provisioning tool not found
    #[error("{tool} is not installed or not in PATH")]
    ToolNotFound { tool: String },

    /// Toolchain install command exited non-zero
    #[error("installing toolchain {toolchain} failed: {stderr}")]
    InstallFailed { toolchain: String, stderr: String },

    /// Provisioning process could not be started or awaited
    #[error("failed to run provisioner: {message}")]
    Spawn { message: String },

    /// Provisioning did not finish in time
    #[error("provisioning {toolchain} timed out after {secs}s")]
    Timeout { toolchain: String, secs: u64 },

    /// Toolchain spec is malformed
    #[error("invalid toolchain spec: {message}")]
    InvalidSpec { message: String },
}
