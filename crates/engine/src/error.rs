use cvmstep_api::ApiError;
use cvmstep_storage::StorageError;
use cvmstep_types::StepOutcome;
use thiserror::Error;

use crate::config::ConfigError;

/// Failures that prevent a dispatch from producing an outcome on its own.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("failed to render compose document: {0}")]
    Compose(#[from] serde_yaml::Error),
    #[error("remote step adapter ran before prepare()")]
    NotPrepared,
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl DispatchError {
    /// Fold the error into the outcome reported to the host engine.
    pub fn into_outcome(self) -> StepOutcome {
        let message = self.to_string();
        match self {
            Self::Api(error) if !error.is_transient() => StepOutcome::ProvisioningError { message },
            Self::Config(_) | Self::Compose(_) | Self::NotPrepared => StepOutcome::ProvisioningError { message },
            Self::Storage(_) | Self::Api(_) | Self::Runtime(_) => StepOutcome::InfrastructureError { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_provisioning_errors() {
        let outcome = DispatchError::from(ConfigError::EmptyImage).into_outcome();
        assert!(matches!(outcome, StepOutcome::ProvisioningError { .. }));
    }

    #[test]
    fn transient_api_errors_are_infrastructure_errors() {
        let outcome = DispatchError::from(ApiError::from_status("create", 502, "bad gateway")).into_outcome();
        assert!(matches!(outcome, StepOutcome::InfrastructureError { .. }));

        let outcome = DispatchError::from(ApiError::from_status("create", 400, "bad image")).into_outcome();
        assert!(matches!(outcome, StepOutcome::ProvisioningError { .. }));
    }
}
