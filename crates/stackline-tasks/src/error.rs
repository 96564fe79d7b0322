//! Task error types.
//!
//! Every error carries an `error_type` string the workflow engine's retry
//! policy matches on.

use serde::{Deserialize, Serialize};
use stackline_rollout::RolloutError;
use stackline_state::StateError;
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Missing or malformed input. Never retried.
    #[error("{0}")]
    Validation(String),

    /// Transient condition; the engine should back off and re-invoke.
    #[error("{message}")]
    Retryable {
        message: String,
        operation_id: Option<String>,
    },

    #[error("lock for {environment}/{repository} not acquired after {attempts} attempts")]
    LockTimeout {
        environment: String,
        repository: String,
        attempts: u32,
    },

    #[error("{0}")]
    NotHolder(String),

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn error_type(&self) -> &'static str {
        match self {
            TaskError::Validation(_) => "ValidationError",
            TaskError::Retryable { .. } => "RetryableError",
            TaskError::LockTimeout { .. } => "LockTimeoutError",
            TaskError::NotHolder(_) => "NotHolderError",
            TaskError::Failed(_) => "TaskError",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable { .. })
    }

    pub fn to_output(&self) -> ErrorOutput {
        ErrorOutput {
            error_type: self.error_type().to_string(),
            error_message: self.to_string(),
        }
    }
}

/// Error document returned to the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOutput {
    pub error_type: String,
    pub error_message: String,
}

impl From<StateError> for TaskError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::InvalidInput(_) | StateError::NotFound(_) => {
                TaskError::Validation(err.to_string())
            }
            StateError::NotHolder { .. } => TaskError::NotHolder(err.to_string()),
            other => TaskError::Failed(other.to_string()),
        }
    }
}

impl From<RolloutError> for TaskError {
    fn from(err: RolloutError) -> Self {
        match err {
            RolloutError::Retryable {
                message,
                operation_id,
            } => TaskError::Retryable {
                message,
                operation_id,
            },
            RolloutError::InvalidInput(_)
            | RolloutError::NoTargets { .. }
            | RolloutError::Parameters(_) => TaskError::Validation(err.to_string()),
            RolloutError::State(state) => state.into(),
            RolloutError::Provider(provider) => TaskError::Failed(provider.to_string()),
        }
    }
}

impl From<EngineError> for TaskError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Throttled(message) => TaskError::Retryable {
                message,
                operation_id: None,
            },
            other => TaskError::Failed(other.to_string()),
        }
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_types() {
        assert_eq!(TaskError::Validation("x".into()).error_type(), "ValidationError");
        assert_eq!(TaskError::NotHolder("x".into()).error_type(), "NotHolderError");
        assert_eq!(TaskError::Failed("x".into()).error_type(), "TaskError");
        let timeout = TaskError::LockTimeout {
            environment: "dev".into(),
            repository: "infra".into(),
            attempts: 10,
        };
        assert_eq!(timeout.error_type(), "LockTimeoutError");
    }

    #[test]
    fn rollout_errors_map_to_task_errors() {
        let retry: TaskError = RolloutError::Retryable {
            message: "busy".into(),
            operation_id: Some("op-1".into()),
        }
        .into();
        assert_eq!(retry.error_type(), "RetryableError");

        let missing: TaskError = RolloutError::NoTargets {
            repository: "infra".into(),
            environment: "prd".into(),
        }
        .into();
        assert_eq!(missing.error_type(), "ValidationError");

        let not_holder: TaskError = RolloutError::State(StateError::NotHolder {
            lock: "dev|infra".into(),
            holder: "b1".into(),
            requested: "b2".into(),
        })
        .into();
        assert_eq!(not_holder.error_type(), "NotHolderError");
    }

    #[test]
    fn error_output_is_camel_case() {
        let output = TaskError::Validation("missing required field(s): env".into()).to_output();
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["errorType"], "ValidationError");
        assert_eq!(json["errorMessage"], "missing required field(s): env");
    }
}
