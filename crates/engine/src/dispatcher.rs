//! Per-invocation state machine driving one step through a remote instance.
//!
//! ```text
//! Staging -> Provisioning -> Starting -> Polling -> Finalizing -> Succeeded | Failed | TimedOut
//!    \            \              \           \            \
//!     `------------`--------------`-----------`------------`--> Errored
//! ```
//!
//! Once `create` returns a handle, the instance is destroyed before the
//! dispatcher reaches any terminal state. If the dispatch future itself is
//! dropped mid-flight, a guard spawns the destroy on the ambient runtime.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use cvmstep_api::{ApiError, InstanceProvisioner};
use cvmstep_storage::{ObjectStore, StorageError, sentinel_key};
use cvmstep_types::{InstanceHandle, InstanceSpec, RunArtifact, StepDescriptor, StepOutcome};
use cvmstep_util::{RetryPolicy, retry_with_backoff};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    bootstrap::BootstrapComposer,
    config::DispatchSettings,
    poller::{CompletionPoller, PollOutcome},
    stager::ArtifactStager,
};

/// Lifecycle position of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Staging,
    Provisioning,
    Starting,
    Polling,
    Finalizing,
    Succeeded,
    Failed,
    TimedOut,
    Errored,
}

impl DispatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut | Self::Errored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Polling => "polling",
            Self::Finalizing => "finalizing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared collaborators for every dispatch in a process.
#[derive(Clone)]
pub struct DispatchContext {
    pub store: Arc<dyn ObjectStore>,
    pub provisioner: Arc<dyn InstanceProvisioner>,
    pub stager: Arc<ArtifactStager>,
    pub settings: DispatchSettings,
}

impl fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("store", &self.store)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DispatchContext {
    pub fn new(store: Arc<dyn ObjectStore>, provisioner: Arc<dyn InstanceProvisioner>, settings: DispatchSettings) -> Self {
        let stager = Arc::new(ArtifactStager::new(Arc::clone(&store), settings.storage_retry));
        Self {
            store,
            provisioner,
            stager,
            settings,
        }
    }
}

/// Everything observed while running one dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub outcome: StepOutcome,
    pub final_state: DispatchState,
    /// Every state entered, in order, starting with `Staging`.
    pub transitions: Vec<DispatchState>,
    pub artifact: Option<RunArtifact>,
    pub instance: Option<InstanceHandle>,
    pub destroy_attempts: u32,
    /// False when an instance was created and every destroy attempt failed.
    pub destroyed: bool,
}

/// Drives one step invocation. Consumed by [`Dispatcher::run`].
pub struct Dispatcher {
    context: DispatchContext,
    step: StepDescriptor,
    spec: InstanceSpec,
    package: Arc<Vec<u8>>,
    cancel: CancellationToken,
    state: DispatchState,
    transitions: Vec<DispatchState>,
    artifact: Option<RunArtifact>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("run_id", &self.step.run_id)
            .field("invocation", &self.step.invocation_id())
            .field("state", &self.state)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(context: DispatchContext, step: StepDescriptor, spec: InstanceSpec, package: Arc<Vec<u8>>) -> Self {
        Self {
            context,
            step,
            spec,
            package,
            cancel: CancellationToken::new(),
            state: DispatchState::Staging,
            transitions: Vec::new(),
            artifact: None,
        }
    }

    /// Observe `token` for cancellation (e.g. SIGINT/SIGTERM).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Run the full lifecycle and return the report. Never panics on remote
    /// failures; every failure is folded into the outcome.
    pub async fn run(mut self) -> DispatchReport {
        self.transition(DispatchState::Staging);

        let sentinel_key = match sentinel_key(&self.step.run_id, &self.step.invocation_id()) {
            Ok(key) => key,
            Err(error) => {
                return self
                    .finish(DispatchState::Errored, StepOutcome::ProvisioningError { message: error.to_string() }, None)
                    .await;
            }
        };

        let artifact = match self.context.stager.stage(&self.step.run_id, &self.package).await {
            Ok(artifact) => artifact,
            Err(error) => {
                error!(run_id = %self.step.run_id, error = %error, "staging failed");
                return self
                    .finish(DispatchState::Errored, StepOutcome::InfrastructureError { message: error.to_string() }, None)
                    .await;
            }
        };
        self.artifact = Some(artifact.clone());
        if let Some(report) = self.finish_if_cancelled(None).await {
            return report;
        }

        let store = Arc::clone(&self.context.store);
        let leftover = retry_with_backoff(&self.context.settings.storage_retry, "sentinel check", StorageError::is_transient, |_| {
            store.exists(&sentinel_key)
        })
        .await;
        match leftover {
            Ok(false) => {}
            Ok(true) => {
                error!(run_id = %self.step.run_id, sentinel_key = %sentinel_key, "sentinel already present before provisioning");
                let message = format!("stale sentinel at {sentinel_key}; this invocation was already dispatched");
                return self.finish(DispatchState::Errored, StepOutcome::ProvisioningError { message }, None).await;
            }
            Err(error) => {
                let message = format!("sentinel check failed: {error}");
                return self.finish(DispatchState::Errored, StepOutcome::InfrastructureError { message }, None).await;
            }
        }

        self.transition(DispatchState::Provisioning);
        let composer = BootstrapComposer::new(Arc::clone(&self.context.store));
        let payload = match composer.compose(&self.spec, &artifact, &sentinel_key, &self.step) {
            Ok(payload) => payload,
            Err(error) => return self.finish(DispatchState::Errored, error.into_outcome(), None).await,
        };

        let provisioner = Arc::clone(&self.context.provisioner);
        let created = retry_with_backoff(&self.context.settings.provision_retry, "instance create", ApiError::is_transient, |_| {
            provisioner.create(&self.spec, &payload)
        })
        .await;
        let handle = match created {
            Ok(handle) => handle,
            Err(error) => return self.finish(DispatchState::Errored, api_outcome(error), None).await,
        };
        let mut guard = DestroyGuard::new(
            handle.clone(),
            Arc::clone(&self.context.provisioner),
            self.context.settings.destroy_retry,
        );
        if let Some(report) = self.finish_if_cancelled(Some(&mut guard)).await {
            return report;
        }

        self.transition(DispatchState::Starting);
        let started = retry_with_backoff(&self.context.settings.provision_retry, "instance start", ApiError::is_transient, |_| {
            provisioner.start(&handle)
        })
        .await;
        if let Err(error) = started {
            return self.finish(DispatchState::Errored, api_outcome(error), Some(&mut guard)).await;
        }
        if let Some(report) = self.finish_if_cancelled(Some(&mut guard)).await {
            return report;
        }

        self.transition(DispatchState::Polling);
        let poller = CompletionPoller::new(
            Arc::clone(&self.context.store),
            self.context.settings.poll_interval,
            self.context.settings.max_poll_errors,
        );
        let timeout = Duration::from_secs(self.spec.timeout_s);
        let polled = poller.wait_for(&sentinel_key, timeout, &self.cancel).await;

        self.transition(DispatchState::Finalizing);
        let (terminal, outcome) = match polled {
            Ok(PollOutcome::Found(record)) => {
                let outcome = StepOutcome::from_exit_code(record.exit_code);
                let state = if outcome.is_success() {
                    DispatchState::Succeeded
                } else {
                    DispatchState::Failed
                };
                (state, outcome)
            }
            Ok(PollOutcome::TimedOut { waited }) => (
                DispatchState::TimedOut,
                StepOutcome::Timeout {
                    waited_s: waited.as_secs(),
                },
            ),
            Ok(PollOutcome::Cancelled) => (
                DispatchState::Errored,
                StepOutcome::InfrastructureError {
                    message: "dispatch cancelled while waiting for the step".to_string(),
                },
            ),
            Err(error) => (
                DispatchState::Errored,
                StepOutcome::InfrastructureError {
                    message: format!("sentinel polling failed: {error}"),
                },
            ),
        };
        self.finish(terminal, outcome, Some(&mut guard)).await
    }

    async fn finish_if_cancelled(&mut self, guard: Option<&mut DestroyGuard>) -> Option<DispatchReport> {
        if !self.cancel.is_cancelled() {
            return None;
        }
        warn!(run_id = %self.step.run_id, state = %self.state, "dispatch cancelled");
        let outcome = StepOutcome::InfrastructureError {
            message: format!("dispatch cancelled during {}", self.state),
        };
        Some(self.finish(DispatchState::Errored, outcome, guard).await)
    }

    /// Destroy the instance (when one exists) in `Finalizing`, then enter `terminal`.
    async fn finish(&mut self, terminal: DispatchState, outcome: StepOutcome, guard: Option<&mut DestroyGuard>) -> DispatchReport {
        let (instance, destroy_attempts, destroyed) = match guard {
            Some(guard) => {
                if self.state != DispatchState::Finalizing {
                    self.transition(DispatchState::Finalizing);
                }
                let (attempts, destroyed) = guard.destroy_now().await;
                (Some(guard.handle.clone()), attempts, destroyed)
            }
            None => (None, 0, true),
        };

        self.transition(terminal);
        match &outcome {
            StepOutcome::Success { .. } => info!(run_id = %self.step.run_id, outcome = ?outcome, "dispatch finished"),
            _ => warn!(run_id = %self.step.run_id, outcome = ?outcome, "dispatch finished"),
        }

        DispatchReport {
            outcome,
            final_state: terminal,
            transitions: std::mem::take(&mut self.transitions),
            artifact: self.artifact.clone(),
            instance,
            destroy_attempts,
            destroyed,
        }
    }

    fn transition(&mut self, next: DispatchState) {
        if self.state.is_terminal() {
            warn!(state = %self.state, next = %next, "ignoring transition out of a terminal state");
            return;
        }
        info!(
            run_id = %self.step.run_id,
            invocation = %self.step.invocation_id(),
            from = %self.state,
            to = %next,
            "dispatch state changed"
        );
        self.state = next;
        self.transitions.push(next);
    }
}

fn api_outcome(error: ApiError) -> StepOutcome {
    let message = error.to_string();
    if error.is_transient() {
        StepOutcome::InfrastructureError { message }
    } else {
        StepOutcome::ProvisioningError { message }
    }
}

/// Owns a live instance handle until it has been destroyed.
struct DestroyGuard {
    handle: InstanceHandle,
    provisioner: Arc<dyn InstanceProvisioner>,
    policy: RetryPolicy,
    armed: bool,
}

impl DestroyGuard {
    fn new(handle: InstanceHandle, provisioner: Arc<dyn InstanceProvisioner>, policy: RetryPolicy) -> Self {
        Self {
            handle,
            provisioner,
            policy,
            armed: true,
        }
    }

    /// Destroy with retries up to the policy ceiling. Returns the attempt
    /// count and whether the instance is known to be gone.
    async fn destroy_now(&mut self) -> (u32, bool) {
        let (attempts, destroyed) = destroy_with_retry(&self.provisioner, &self.handle, &self.policy).await;
        self.armed = false;
        (attempts, destroyed)
    }
}

impl Drop for DestroyGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let handle = self.handle.clone();
        let provisioner = Arc::clone(&self.provisioner);
        let policy = self.policy;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(instance_id = %handle, "dispatch dropped before cleanup; destroying instance in the background");
                runtime.spawn(async move {
                    destroy_with_retry(&provisioner, &handle, &policy).await;
                });
            }
            Err(_) => {
                error!(instance_id = %handle, leaked_instance = true, "no runtime available to destroy instance");
            }
        }
    }
}

async fn destroy_with_retry(provisioner: &Arc<dyn InstanceProvisioner>, handle: &InstanceHandle, policy: &RetryPolicy) -> (u32, bool) {
    let attempts = AtomicU32::new(0);
    let result = retry_with_backoff(policy, "instance destroy", |_: &ApiError| true, |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        provisioner.destroy(handle)
    })
    .await;
    let attempts = attempts.load(Ordering::SeqCst);
    match result {
        Ok(()) => (attempts, true),
        Err(error) => {
            error!(
                instance_id = %handle,
                attempts,
                leaked_instance = true,
                error = %error,
                "failed to destroy instance; it may still be running"
            );
            (attempts, false)
        }
    }
}
