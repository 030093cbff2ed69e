//! Host-engine facing surface.
//!
//! [`RemoteStepAdapter`] wraps a step as a capability with two operations:
//! `prepare` fixes the resolved [`InstanceSpec`], `run` dispatches it and
//! yields the [`StepOutcome`]. [`RemoteExecutor::execute`] offers the same
//! through a blocking call for hosts that are not async.

use std::sync::Arc;

use cvmstep_types::{InstanceSpec, StepDescriptor, StepOutcome};
use cvmstep_util::block_on_future;
use tokio_util::sync::CancellationToken;

use crate::{
    DispatchError,
    dispatcher::{DispatchContext, DispatchReport, Dispatcher},
};

#[derive(Debug)]
pub struct RemoteStepAdapter {
    context: DispatchContext,
    step: StepDescriptor,
    package: Arc<Vec<u8>>,
    spec: Option<InstanceSpec>,
    cancel: CancellationToken,
}

impl RemoteStepAdapter {
    pub fn new(context: DispatchContext, step: StepDescriptor, package: Arc<Vec<u8>>) -> Self {
        Self {
            context,
            step,
            package,
            spec: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fix the instance shape this step runs with.
    pub fn prepare(&mut self, spec: InstanceSpec) -> &mut Self {
        self.spec = Some(spec);
        self
    }

    pub fn is_prepared(&self) -> bool {
        self.spec.is_some()
    }

    /// Dispatch the prepared step and return its outcome.
    ///
    /// The adapter is consumed, so one prepared step provisions at most one
    /// instance:
    ///
    /// ```compile_fail
    /// # async fn twice(adapter: cvmstep_engine::RemoteStepAdapter) {
    /// adapter.run().await;
    /// adapter.run().await;
    /// # }
    /// ```
    pub async fn run(self) -> StepOutcome {
        match self.run_with_report().await {
            Ok(report) => report.outcome,
            Err(error) => error.into_outcome(),
        }
    }

    /// Dispatch the prepared step and return the full report.
    pub async fn run_with_report(self) -> Result<DispatchReport, DispatchError> {
        let spec = self.spec.ok_or(DispatchError::NotPrepared)?;
        let dispatcher = Dispatcher::new(self.context, self.step, spec, self.package).with_cancellation(self.cancel);
        Ok(dispatcher.run().await)
    }
}

/// Blocking entry point for synchronous host engines.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    context: DispatchContext,
    package: Arc<Vec<u8>>,
    cancel: CancellationToken,
}

impl RemoteExecutor {
    pub fn new(context: DispatchContext, package: Arc<Vec<u8>>) -> Self {
        Self {
            context,
            package,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run `step` remotely with `spec`, blocking until the outcome is known
    /// and the instance has been destroyed.
    pub fn execute(&self, step: StepDescriptor, spec: InstanceSpec) -> StepOutcome {
        let mut adapter = RemoteStepAdapter::new(self.context.clone(), step, Arc::clone(&self.package))
            .with_cancellation(self.cancel.clone());
        adapter.prepare(spec);

        match block_on_future(async move { Ok(adapter.run().await) }) {
            Ok(outcome) => outcome,
            Err(error) => DispatchError::Runtime(error).into_outcome(),
        }
    }
}
