//! Shared data model for dispatching a workflow step to a confidential VM.
//!
//! Every crate in the workspace speaks in terms of these types:
//!
//! - [`InstanceSpec`]: the resolved shape of the remote instance
//! - [`RunArtifact`]: a code package staged once per workflow run
//! - [`StepDescriptor`]: the step invocation being redirected to remote execution
//! - [`InstanceHandle`] and [`BootstrapPayload`]: provisioning inputs and outputs
//! - [`SentinelRecord`]: the completion marker written by the remote instance
//! - [`StepOutcome`]: the terminal result returned to the host workflow engine

pub mod artifact;
pub mod instance;
pub mod outcome;
pub mod sentinel;
pub mod spec;
pub mod step;

pub use artifact::RunArtifact;
pub use instance::{BootstrapPayload, InstanceHandle, InstanceStatus, ResourceLimits};
pub use outcome::StepOutcome;
pub use sentinel::SentinelRecord;
pub use spec::InstanceSpec;
pub use step::StepDescriptor;
