//! JSON contracts exchanged with the workflow engine, one input/output pair
//! per step. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use stackline_core::{BuildStatus, DeploymentStatus, Target};
use stackline_rollout::provider::{DetailedStatus, OperationStatus};
use stackline_rollout::{DeploymentSummary, UnitOperation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireLockInput {
    pub env: String,
    pub repo: String,
    pub build_id: String,
    pub execution_handle: String,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireLockOutput {
    pub lock_acquired: bool,
    pub retry_count: u32,
    pub should_retry: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrUpdateUnitInput {
    pub env: String,
    pub repo: String,
    pub build_id: String,
    pub artifact_location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrUpdateUnitOutput {
    pub unit_name: String,
    pub operation: UnitOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionInstancesInput {
    pub unit_name: String,
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionInstancesOutput {
    pub operation_id: String,
    pub account_ids: Vec<String>,
    pub regions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStatusInput {
    pub env: String,
    pub repo: String,
    pub unit_name: String,
    pub operation_id: String,
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentState {
    pub account_id: String,
    pub region: String,
    pub status: DeploymentStatus,
    pub detailed_status: Option<DetailedStatus>,
    pub status_reason: Option<String>,
    pub stack_id: Option<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStatusOutput {
    pub operation_status: OperationStatus,
    pub deployments: Vec<DeploymentState>,
    pub is_complete: bool,
    pub has_failures: bool,
}

/// Input shared by steps keyed on a single build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRef {
    pub env: String,
    pub repo: String,
    pub build_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResultsOutput {
    pub build_status: BuildStatus,
    pub partial_success: bool,
    pub failed_deployments: Vec<String>,
    pub summary: DeploymentSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseLockOutput {
    pub released: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTargetsInput {
    pub env: String,
    pub repo: String,
    /// When present, PENDING deployment records are seeded for this build.
    #[serde(default)]
    pub build_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTargetsOutput {
    pub targets: Vec<Target>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionInput {
    pub repo: String,
    pub env: String,
    pub build_id: String,
    /// Everything else is passed through to the execution untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionOutput {
    pub execution_name: String,
    pub execution_handle: String,
}
