//! Provisioning inputs and outputs.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Opaque identifier of a live instance, as returned by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceHandle(String);

impl InstanceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource limits requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

/// Everything the provisioner needs to boot an instance that runs one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPayload {
    /// DNS-safe instance name, deterministic per step invocation.
    pub instance_name: String,
    /// Container image reference.
    pub image: String,
    /// Requested resources, copied from the instance spec.
    pub resources: ResourceLimits,
    /// Full environment of the step container (built-in entries plus spec env).
    pub environment: IndexMap<String, String>,
    /// Base64-encoded bootstrap script.
    pub encoded_script: String,
    /// docker-compose document embedding the environment and the script.
    pub compose_file: String,
}

/// Lifecycle status reported by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Raw status string, e.g. `running` or `stopped`.
    pub status: String,
}

impl InstanceStatus {
    /// Returns true when the instance entered a failure state.
    pub fn is_failure(&self) -> bool {
        matches!(self.status.to_ascii_lowercase().as_str(), "error" | "failed" | "terminated")
    }

    /// Returns true when the instance will not run the step any further.
    pub fn is_terminal(&self) -> bool {
        self.is_failure() || matches!(self.status.to_ascii_lowercase().as_str(), "stopped" | "exited")
    }
}
