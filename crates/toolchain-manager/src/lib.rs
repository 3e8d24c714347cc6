//! Toolchain-Manager: toolchain provisioning for buildgate pipelines
//!
//! A pipeline declares the toolchain it needs as a [`ToolchainSpec`]; before
//! its first stage runs, the orchestrator asks a [`Provisioner`] to make sure
//! that toolchain is installed.
//!
//! ## Provisioners
//!
//! - [`RustupProvisioner`]: installs channels, components and targets via `rustup`
//! - [`NoopProvisioner`]: trusts whatever toolchain is already on `PATH`

mod error;
pub mod rustup;

pub use error::ProvisionError;
pub use rustup::{active_toolchain, is_rustup_available, RustupProvisioner};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Result type for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Toolchain a pipeline needs before its first stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainSpec {
    /// Channel or explicit version (e.g. "stable", "nightly-2024-05-01", "1.79.0").
    pub channel: String,

    /// Extra components (e.g. "rustfmt", "clippy").
    #[serde(default)]
    pub components: Vec<String>,

    /// Extra compilation targets.
    #[serde(default)]
    pub targets: Vec<String>,
}

impl ToolchainSpec {
    /// Spec for the given channel with no extra components.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            components: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// The stable channel.
    pub fn stable() -> Self {
        Self::new("stable")
    }

    /// Add a component.
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.components.push(component.into());
        self
    }

    /// Add a compilation target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// Reject channel/component names that would not survive as a single argv word.
    pub fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(ProvisionError::InvalidSpec {
                message: "channel must not be empty".to_string(),
            });
        }
        let names = std::iter::once(&self.channel)
            .chain(&self.components)
            .chain(&self.targets);
        for name in names {
            if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == ',') {
                return Err(ProvisionError::InvalidSpec {
                    message: format!("invalid toolchain name: {name:?}"),
                });
            }
        }
        Ok(())
    }

    /// Deterministic SHA-256 fingerprint of the spec.
    ///
    /// Component and target order does not affect the fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut components = self.components.clone();
        components.sort();
        let mut targets = self.targets.clone();
        targets.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.channel.as_bytes());
        hasher.update(b"\0");
        for component in &components {
            hasher.update(component.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"\x01");
        for target in &targets {
            hasher.update(target.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for ToolchainSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.channel)?;
        if !self.components.is_empty() {
            write!(f, " +{}", self.components.join(","))?;
        }
        if !self.targets.is_empty() {
            write!(f, " @{}", self.targets.join(","))?;
        }
        Ok(())
    }
}

/// Makes a toolchain available before a pipeline's first stage.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Ensure the toolchain is installed. Idempotent.
    async fn ensure(&self, spec: &ToolchainSpec) -> Result<()>;
}

/// Provisioner that assumes the toolchain is already present.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn ensure(&self, spec: &ToolchainSpec) -> Result<()> {
        spec.validate()?;
        tracing::debug!(toolchain = %spec, "Skipping toolchain provisioning");
        Ok(())
    }
}
