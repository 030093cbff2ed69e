//! Uploads the run's code package to shared storage exactly once.
//!
//! Concurrent step invocations of the same run serialize on a per-run async
//! mutex. The first holder writes the package with a conditional put; later
//! holders reuse the cached [`RunArtifact`] without touching storage.
//! Separate processes staging the same run rely on the conditional put alone.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use cvmstep_storage::{ObjectStore, StorageError, package_key};
use cvmstep_types::RunArtifact;
use cvmstep_util::{RetryPolicy, retry_with_backoff};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

type RunSlot = Arc<tokio::sync::Mutex<Option<RunArtifact>>>;

#[derive(Debug)]
pub struct ArtifactStager {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    runs: Mutex<HashMap<String, RunSlot>>,
}

impl ArtifactStager {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Stage `package` for `run_id`, uploading only if no object exists yet.
    ///
    /// The existence check and the upload are one atomic storage call.
    ///
    /// Storage failures are retried with exponential backoff; the last error
    /// is returned once the policy's ceiling is reached.
    pub async fn stage(&self, run_id: &str, package: &[u8]) -> Result<RunArtifact, StorageError> {
        let storage_key = package_key(run_id)?;
        let content_hash = content_hash(package);
        let slot = self.slot_for(run_id);
        let mut staged = slot.lock().await;

        if let Some(artifact) = staged.as_ref() {
            if artifact.content_hash != content_hash {
                warn!(
                    run_id,
                    staged_hash = %artifact.content_hash,
                    offered_hash = %content_hash,
                    "package differs from the one staged for this run; reusing the staged package"
                );
            }
            return Ok(artifact.clone());
        }

        let uploaded = retry_with_backoff(&self.retry, "package upload", StorageError::is_transient, |_| {
            self.store.put_if_absent(&storage_key, package.to_vec())
        })
        .await?;

        if uploaded {
            info!(run_id, storage_key = %storage_key, size = package.len(), %content_hash, "code package staged");
        } else {
            info!(run_id, storage_key = %storage_key, "code package already staged; skipping upload");
        }

        let artifact = RunArtifact {
            run_id: run_id.to_string(),
            storage_key,
            content_hash,
        };
        *staged = Some(artifact.clone());
        Ok(artifact)
    }

    fn slot_for(&self, run_id: &str) -> RunSlot {
        let mut runs = self.runs.lock().expect("stager lock poisoned");
        Arc::clone(runs.entry(run_id.to_string()).or_default())
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
