//! Rollout error types.

use thiserror::Error;

use crate::provider::{ProviderError, extract_operation_id};

/// Errors that can occur while resolving targets or driving a deployment.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no targets configured for {repository} in {environment}")]
    NoTargets {
        repository: String,
        environment: String,
    },

    /// The provider is busy or throttling; the caller should back off and retry.
    #[error("retryable: {message}")]
    Retryable {
        message: String,
        operation_id: Option<String>,
    },

    #[error("parameter error: {0}")]
    Parameters(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("state store error: {0}")]
    State(#[from] stackline_state::StateError),
}

impl RolloutError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RolloutError::Retryable { .. })
    }

    /// Classify a provider error. Busy units and throttling become
    /// [`RolloutError::Retryable`], carrying the in-progress operation id
    /// when the message names one.
    pub fn from_provider(err: ProviderError) -> Self {
        match err {
            ProviderError::OperationInProgress(message) => {
                let operation_id = extract_operation_id(&message);
                RolloutError::Retryable {
                    message,
                    operation_id,
                }
            }
            ProviderError::Throttled(message) => RolloutError::Retryable {
                message,
                operation_id: None,
            },
            other => RolloutError::Provider(other),
        }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;

/// Fail with [`RolloutError::InvalidInput`] when a required field is blank.
pub(crate) fn require(fields: &[(&str, &str)]) -> RolloutResult<()> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RolloutError::InvalidInput(format!(
            "missing required field(s): {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_unit_is_retryable_with_operation_id() {
        let err = RolloutError::from_provider(ProviderError::OperationInProgress(
            "Another operation is in progress: op-20240101-abcdef".to_string(),
        ));
        match err {
            RolloutError::Retryable { operation_id, .. } => {
                assert_eq!(operation_id.as_deref(), Some("op-20240101-abcdef"));
            }
            other => panic!("expected retryable, got {other:?}"),
        }
    }

    #[test]
    fn other_provider_errors_pass_through() {
        let err = RolloutError::from_provider(ProviderError::Other("access denied".into()));
        assert!(!err.is_retryable());
        assert!(RolloutError::from_provider(ProviderError::Throttled("slow down".into())).is_retryable());
    }

    #[test]
    fn require_lists_missing_fields() {
        let err = require(&[("env", "dev"), ("repo", " "), ("buildId", "")]).unwrap_err();
        assert_eq!(err.to_string(), "invalid input: missing required field(s): repo, buildId");
    }
}
