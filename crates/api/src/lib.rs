//! Confidential VM provisioning API client.
//!
//! This crate provides the [`InstanceProvisioner`] seam the dispatcher drives
//! and a `reqwest`-backed implementation of it. It focuses on:
//!
//! - Discovering credentials from `PHALA_API_KEY`, `CVMSTEP_API_KEY` or the OS keyring
//! - Validating `CVMSTEP_API_BASE` for safety
//! - Translating HTTP responses into typed [`ApiError`]s that separate
//!   provisioning rejections from transient infrastructure failures
//!
//! # Example
//!
//! ```ignore
//! use cvmstep_api::{CvmApiClient, InstanceProvisioner};
//! use cvmstep_types::InstanceHandle;
//!
//! async fn cleanup(id: &str) -> Result<(), cvmstep_api::ApiError> {
//!     let client = CvmApiClient::from_env()?;
//!     client.destroy(&InstanceHandle::new(id)).await
//! }
//! ```

mod client;
mod config;
mod error;

use async_trait::async_trait;
use cvmstep_types::{BootstrapPayload, InstanceHandle, InstanceSpec, InstanceStatus};

pub use client::CvmApiClient;
pub use config::{API_BASE_ENV, API_KEY_ENV_VARS, ApiConfig, DEFAULT_API_BASE, validate_base_url};
pub use error::ApiError;

/// Lifecycle operations against the remote compute API.
///
/// Implementations issue exactly one request per call; retry policy belongs
/// to the caller.
#[async_trait]
pub trait InstanceProvisioner: Send + Sync {
    /// Create an instance booting `payload`. Returns the API's instance id.
    async fn create(&self, spec: &InstanceSpec, payload: &BootstrapPayload) -> Result<InstanceHandle, ApiError>;

    async fn start(&self, handle: &InstanceHandle) -> Result<(), ApiError>;

    /// Destroy an instance. An already-destroyed instance counts as success.
    async fn destroy(&self, handle: &InstanceHandle) -> Result<(), ApiError>;

    /// Current lifecycle status, for operators. The dispatcher never polls it.
    async fn status(&self, handle: &InstanceHandle) -> Result<InstanceStatus, ApiError>;
}
