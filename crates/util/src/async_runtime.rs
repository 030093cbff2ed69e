//! Async runtime helpers for blocking callers.
//!
//! The host workflow engine invokes step execution synchronously, while the
//! dispatcher is async. This module bridges the two, reusing the current
//! Tokio runtime when one is available.

use anyhow::anyhow;
use std::future::Future;
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    task,
};

/// Execute an async future from synchronous code.
///
/// # Notes
/// - Reuses the current runtime when it is multi-threaded.
/// - Falls back to a dedicated multi-threaded runtime for call sites outside
///   Tokio, so background cleanup tasks spawned by the future keep running.
/// - Calling from inside a current-thread runtime is an error; blocking it
///   would deadlock the future being awaited.
pub fn block_on_future<F, T>(future: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(anyhow!("cannot block inside a current-thread Tokio runtime; await the future instead"));
        }
        task::block_in_place(|| handle.block_on(future))
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|error| anyhow!(error))?
            .block_on(future)
    }
}
