use serde::{Deserialize, Serialize};

/// A code package staged in shared storage for a workflow run.
///
/// Created once per run by the stager and referenced, never owned, by every
/// step invocation of that run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunArtifact {
    /// Workflow run the package belongs to.
    pub run_id: String,
    /// Storage key the package was written to.
    pub storage_key: String,
    /// Lowercase hex SHA-256 of the package bytes.
    pub content_hash: String,
}
