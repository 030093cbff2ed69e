//! # cvmstep engine
//!
//! Dispatches a single workflow step to an ephemeral confidential VM and
//! reports how it ended.
//!
//! ## Flow
//!
//! 1. **Stage**: the run's code package is uploaded once per `run_id`.
//! 2. **Compose**: a compose document with an embedded bootstrap script is
//!    rendered for the step.
//! 3. **Provision**: the instance is created and started.
//! 4. **Poll**: shared storage is checked until the step's sentinel appears
//!    or the timeout budget runs out.
//! 5. **Finalize**: the instance is destroyed on every path.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use cvmstep_engine::{DispatchContext, DispatchSettings, RemoteExecutor};
//!
//! let context = DispatchContext::new(store, provisioner, DispatchSettings::default());
//! let executor = RemoteExecutor::new(context, Arc::new(package_bytes));
//! let outcome = executor.execute(step, spec);
//! std::process::exit(outcome.process_exit_code());
//! ```
//!
//! ## Architecture
//!
//! - **`config`**: spec resolution (`explicit > env > builtin`) and dispatch tunables
//! - **`stager`**: once-per-run package upload
//! - **`bootstrap`**: instance naming, bootstrap script and compose rendering
//! - **`poller`**: cancellable sentinel wait
//! - **`dispatcher`**: the per-invocation state machine
//! - **`adapter`**: `prepare`/`run` capability and the blocking `execute` entry point

pub mod adapter;
pub mod bootstrap;
pub mod config;
pub mod dispatcher;
mod error;
pub mod poller;
pub mod stager;

pub use adapter::{RemoteExecutor, RemoteStepAdapter};
pub use bootstrap::{BootstrapComposer, instance_name};
pub use config::{BuiltinDefaults, ConfigError, DispatchSettings, EnvSnapshot, StepOptions, resolve_spec};
pub use dispatcher::{DispatchContext, DispatchReport, DispatchState, Dispatcher};
pub use error::DispatchError;
pub use poller::{CompletionPoller, PollOutcome};
pub use stager::{ArtifactStager, content_hash};
