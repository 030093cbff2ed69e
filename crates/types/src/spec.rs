use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Declarative shape of the remote instance for one step invocation.
///
/// Produced by configuration resolution (explicit value, then environment
/// variable, then built-in default) and treated as immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Container image reference run inside the instance.
    pub image: String,
    /// Number of vCPUs.
    pub cpu: u32,
    /// Memory in MB.
    pub memory_mb: u32,
    /// Disk size in GB.
    pub disk_gb: u32,
    /// Client-side completion budget in seconds.
    pub timeout_s: u64,
    /// Environment injected verbatim into the step container.
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

impl InstanceSpec {
    pub fn resources(&self) -> crate::ResourceLimits {
        crate::ResourceLimits {
            cpu: self.cpu,
            memory_mb: self.memory_mb,
            disk_gb: self.disk_gb,
        }
    }
}
