use serde::{Deserialize, Serialize};

/// Process exit code reported when the step timed out (matches coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Process exit code reported for rejected provisioning requests (`EX_CONFIG`).
pub const PROVISIONING_EXIT_CODE: i32 = 78;
/// Process exit code reported for transport/storage failures (`EX_UNAVAILABLE`).
pub const INFRASTRUCTURE_EXIT_CODE: i32 = 69;

/// Terminal result of dispatching one step.
///
/// Constructed once by the dispatcher and handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step exited with code zero; its artifacts are visible in the datastore.
    Success { exit_code: i32 },
    /// The step exited with a non-zero code.
    Failure { exit_code: i32 },
    /// No sentinel appeared within the timeout budget.
    Timeout { waited_s: u64 },
    /// The cloud API rejected the request; retrying will not help.
    ProvisioningError { message: String },
    /// Network, server-side or storage failure after retries were exhausted.
    InfrastructureError { message: String },
}

impl StepOutcome {
    /// Map a sentinel exit code onto `Success` or `Failure`.
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Self::Success { exit_code }
        } else {
            Self::Failure { exit_code }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Exit code reported by the remote step, when one was observed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Success { exit_code } | Self::Failure { exit_code } => Some(*exit_code),
            _ => None,
        }
    }

    /// Exit code a local process should terminate with to mirror this outcome.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::Success { .. } => 0,
            Self::Failure { exit_code } => *exit_code,
            Self::Timeout { .. } => TIMEOUT_EXIT_CODE,
            Self::ProvisioningError { .. } => PROVISIONING_EXIT_CODE,
            Self::InfrastructureError { .. } => INFRASTRUCTURE_EXIT_CODE,
        }
    }
}
