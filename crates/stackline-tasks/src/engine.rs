//! Workflow engine seam: the external system that sequences steps.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("throttled: {0}")]
    Throttled(String),

    /// An execution with this name already exists with different input.
    #[error("execution {0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Rejected(String),
}

/// Starts workflow executions.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Start `state_machine` under a unique `name` with `input` (JSON).
    /// Returns the execution handle.
    async fn start_execution(
        &self,
        state_machine: &str,
        name: &str,
        input: &str,
    ) -> Result<String, EngineError>;
}

/// An execution recorded by [`LocalEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct LocalExecution {
    pub handle: String,
    pub state_machine: String,
    pub input: String,
}

/// In-memory engine that records executions instead of running them.
///
/// Starting the same name with the same input returns the existing handle,
/// the way hosted engines deduplicate starts.
#[derive(Debug, Default)]
pub struct LocalEngine {
    executions: Mutex<BTreeMap<String, LocalExecution>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn execution(&self, name: &str) -> Option<LocalExecution> {
        self.executions.lock().await.get(name).cloned()
    }

    pub async fn execution_count(&self) -> usize {
        self.executions.lock().await.len()
    }
}

#[async_trait]
impl WorkflowEngine for LocalEngine {
    async fn start_execution(
        &self,
        state_machine: &str,
        name: &str,
        input: &str,
    ) -> Result<String, EngineError> {
        let mut executions = self.executions.lock().await;
        if let Some(existing) = executions.get(name) {
            if existing.input == input && existing.state_machine == state_machine {
                debug!(execution = %name, "execution already started");
                return Ok(existing.handle.clone());
            }
            return Err(EngineError::AlreadyExists(name.to_string()));
        }
        let handle = format!("local:{state_machine}:{name}");
        executions.insert(
            name.to_string(),
            LocalExecution {
                handle: handle.clone(),
                state_machine: state_machine.to_string(),
                input: input.to_string(),
            },
        );
        info!(execution = %name, %handle, "execution started");
        Ok(handle)
    }
}
