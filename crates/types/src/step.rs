use serde::{Deserialize, Serialize};

/// Identifies the workflow step being redirected to a remote instance and
/// describes how to run it once the code package is unpacked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Name of the flow the step belongs to.
    pub flow_name: String,
    /// Step name inside the flow.
    pub step_name: String,
    /// Workflow run identifier shared by every step of the run.
    pub run_id: String,
    /// Task identifier assigned by the host engine.
    pub task_id: String,
    /// Retry attempt number, starting at zero.
    #[serde(default)]
    pub attempt: u32,
    /// Commands that install the step's declared dependencies.
    #[serde(default)]
    pub setup_commands: Vec<String>,
    /// Shell command executing the step itself.
    pub command: String,
}

impl StepDescriptor {
    /// Identifier unique to this invocation within its run.
    ///
    /// Used to namespace the sentinel key so concurrent branches of the same
    /// run never observe each other's completion markers.
    pub fn invocation_id(&self) -> String {
        format!("{}/{}/{}", self.step_name, self.task_id, self.attempt)
    }
}
