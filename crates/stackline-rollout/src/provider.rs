//! Deployment unit provider seam.
//!
//! A deployment unit is the multi-account construct created once per
//! repository/environment and fanned out to (account, region) instances.
//! The provider owns the unit; Stackline only drives it through this trait.

use std::fmt;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use stackline_core::Target;
use thiserror::Error;

/// Errors reported by a provider.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An update was requested but nothing differs from the current unit.
    #[error("no updates are to be performed")]
    NoChanges,

    /// Another operation on the same unit has not finished yet.
    #[error("{0}")]
    OperationInProgress(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Transient errors the workflow engine should back off and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::OperationInProgress(_) | ProviderError::Throttled(_)
        )
    }
}

/// Pull the in-progress operation identifier out of a provider message.
///
/// Providers report conflicts as free text, e.g. `Another Operation on
/// StackSet infra-dev is in progress: 7c1e...`.
pub fn extract_operation_id(message: &str) -> Option<String> {
    let patterns = [
        r"(?i)in progress:?\s*([A-Za-z0-9][A-Za-z0-9-]{7,})",
        r"(?i)operation(?:\s+id)?\s*[:=]\s*([A-Za-z0-9][A-Za-z0-9-]{7,})",
    ];
    for pattern in patterns {
        let re = Regex::new(pattern).ok()?;
        if let Some(id) = re.captures(message).and_then(|c| c.get(1)) {
            return Some(id.as_str().to_string());
        }
    }
    None
}

/// Desired definition of a deployment unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub name: String,
    /// Location of the template inside the build artifact.
    pub template_location: String,
    pub parameters: std::collections::BTreeMap<String, String>,
    pub description: String,
}

/// A unit as the provider knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub name: String,
    pub unit_id: String,
}

/// Status of a unit-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Stopping,
    Stopped,
}

impl OperationStatus {
    /// SUCCEEDED, FAILED and STOPPED end an operation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Queued => "QUEUED",
            OperationStatus::Running => "RUNNING",
            OperationStatus::Succeeded => "SUCCEEDED",
            OperationStatus::Failed => "FAILED",
            OperationStatus::Stopping => "STOPPING",
            OperationStatus::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an instance matches the unit's current definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Current,
    Outdated,
    Inoperable,
}

/// Progress of the most recent operation on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetailedStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Inoperable,
    SkippedSuspendedAccount,
}

impl DetailedStatus {
    /// Only PENDING and RUNNING are still moving.
    pub fn is_terminal(self) -> bool {
        !matches!(self, DetailedStatus::Pending | DetailedStatus::Running)
    }
}

/// Provider view of one (account, region) instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub target: Target,
    pub status: InstanceStatus,
    pub detailed_status: DetailedStatus,
    pub status_reason: Option<String>,
    pub stack_id: Option<String>,
}

/// Operations Stackline needs from a deployment unit provider.
#[async_trait]
pub trait UnitProvider: Send + Sync {
    /// Look up a unit by name. `Ok(None)` when it does not exist.
    async fn describe_unit(&self, name: &str) -> Result<Option<UnitSummary>, ProviderError>;

    async fn create_unit(&self, spec: &UnitSpec) -> Result<UnitSummary, ProviderError>;

    /// Update a unit's definition, returning the operation it started, if any.
    ///
    /// A changed definition must reach every existing instance through that
    /// operation; provisioning only creates instances the unit lacks.
    async fn update_unit(&self, spec: &UnitSpec) -> Result<Option<String>, ProviderError>;

    /// (account, region) pairs the unit is already materialized in.
    async fn list_instances(&self, unit: &str) -> Result<Vec<Target>, ProviderError>;

    /// Materialize the unit in new targets. Returns the operation id.
    async fn create_instances(&self, unit: &str, targets: &[Target])
    -> Result<String, ProviderError>;

    /// Re-apply the unit's definition to existing targets. Returns the operation id.
    async fn update_instances(&self, unit: &str, targets: &[Target])
    -> Result<String, ProviderError>;

    async fn describe_operation(
        &self,
        unit: &str,
        operation_id: &str,
    ) -> Result<OperationStatus, ProviderError>;

    async fn describe_instance(
        &self,
        unit: &str,
        target: &Target,
    ) -> Result<InstanceSummary, ProviderError>;

    /// Most recent failed-resource events for an instance, newest first.
    async fn failed_events(
        &self,
        unit: &str,
        target: &Target,
        limit: usize,
    ) -> Result<Vec<String>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_operation_id_from_conflict_message() {
        let message = "Another Operation on StackSet arn:aws:cloudformation:us-east-1:111:stackset/infra-dev:abc \
                       is in progress: 2bc4d1b0-8c1f-4a3c-9d3e-5f0a1b2c3d4e";
        assert_eq!(
            extract_operation_id(message).as_deref(),
            Some("2bc4d1b0-8c1f-4a3c-9d3e-5f0a1b2c3d4e")
        );
    }

    #[test]
    fn extracts_operation_id_from_labelled_message() {
        let message = "Unit busy (operation id: op-12345678)";
        assert_eq!(extract_operation_id(message).as_deref(), Some("op-12345678"));
    }

    #[test]
    fn no_operation_id_in_unrelated_text() {
        assert_eq!(extract_operation_id("Rate exceeded"), None);
    }

    #[test]
    fn terminal_sets() {
        assert!(OperationStatus::Stopped.is_terminal());
        assert!(!OperationStatus::Stopping.is_terminal());
        assert!(DetailedStatus::SkippedSuspendedAccount.is_terminal());
        assert!(DetailedStatus::Cancelled.is_terminal());
        assert!(!DetailedStatus::Running.is_terminal());
    }

    #[test]
    fn transient_errors() {
        assert!(ProviderError::Throttled("rate".into()).is_transient());
        assert!(!ProviderError::NoChanges.is_transient());
    }
}
