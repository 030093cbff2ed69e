//! Shared durable storage used to hand code packages to remote instances and
//! to receive their completion sentinels.
//!
//! The dispatcher never talks to a remote instance directly. Everything it
//! needs to observe travels through an [`ObjectStore`]:
//!
//! - the staged code package, written once per run
//! - the sentinel object each instance writes when its step exits
//!
//! Backends are selected from the datastore sysroot via [`open_store`].

mod error;
mod http;
pub mod keys;
mod local;
mod location;
mod memory;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

pub use error::StorageError;
pub use http::HttpObjectStore;
pub use keys::{package_key, sentinel_key};
pub use local::LocalObjectStore;
pub use location::{SYSROOT_ENV, StorageLocation};
pub use memory::MemoryObjectStore;

/// Minimal key/value interface over durable object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync + Debug {
    /// Write `bytes` at `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Write `bytes` at `key` only when nothing is stored there yet.
    ///
    /// The check and the write are a single atomic step on the backend, so
    /// independent processes racing on one key produce exactly one write.
    /// Returns `false` when an object was already present.
    async fn put_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<bool, StorageError>;

    /// Read the object at `key`; `None` when it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// URL a remote instance uses to reach `key` (download or upload).
    fn object_url(&self, key: &str) -> String;
}

/// Open the backend matching a parsed sysroot.
pub fn open_store(location: &StorageLocation) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match location {
        StorageLocation::Local { root } => Ok(Arc::new(LocalObjectStore::new(root.clone()))),
        remote => {
            let base = remote
                .http_base()
                .ok_or_else(|| StorageError::invalid_location(format!("{remote:?}"), "no HTTP endpoint"))?;
            Ok(Arc::new(HttpObjectStore::new(base)?))
        }
    }
}
