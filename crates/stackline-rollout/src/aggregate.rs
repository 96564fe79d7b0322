//! Result aggregation: reduces per-target records into a build verdict.

use serde::{Deserialize, Serialize};
use stackline_core::{BuildStatus, DeploymentStatus};
use stackline_state::{BuildKey, BuildTransition, DeploymentRecord};
use tracing::info;

use crate::driver::DeploymentDriver;
use crate::error::{RolloutResult, require};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Build-level verdict over a set of deployment records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub build_status: BuildStatus,
    /// Some, but not all, targets failed.
    pub partial_success: bool,
    /// `account/region` of every failed target, sorted.
    pub failed_deployments: Vec<String>,
    pub summary: DeploymentSummary,
}

/// Reduce deployment records to a verdict.
///
/// Every target failed: FAILED. Some failed: FAILED with `partial_success`.
/// No failures: SUCCESS. A build without any record is FAILED.
pub fn summarize(records: &[DeploymentRecord]) -> Verdict {
    let mut summary = DeploymentSummary {
        total: records.len(),
        ..Default::default()
    };
    let mut failed_deployments = Vec::new();
    for record in records {
        match record.status {
            DeploymentStatus::Success => summary.succeeded += 1,
            DeploymentStatus::Failed => {
                summary.failed += 1;
                failed_deployments.push(record.target().to_string());
            }
            DeploymentStatus::Pending | DeploymentStatus::InProgress => {}
        }
    }
    failed_deployments.sort();

    let build_status = if summary.total == 0 || summary.failed > 0 {
        BuildStatus::Failed
    } else {
        BuildStatus::Success
    };
    Verdict {
        build_status,
        partial_success: summary.failed > 0 && summary.failed < summary.total,
        failed_deployments,
        summary,
    }
}

fn error_message(verdict: &Verdict) -> Option<String> {
    let summary = verdict.summary;
    if summary.total == 0 {
        Some("no deployment records".to_string())
    } else if summary.failed == summary.total {
        Some(format!("all {} deployments failed", summary.total))
    } else if summary.failed > 0 {
        Some(format!(
            "{} of {} deployments failed: {}",
            summary.failed,
            summary.total,
            verdict.failed_deployments.join(", ")
        ))
    } else {
        None
    }
}

impl DeploymentDriver {
    /// Aggregate the build's deployment records and write the verdict to the
    /// build ledger.
    pub async fn aggregate(
        &self,
        environment: &str,
        repository: &str,
        build_id: &str,
    ) -> RolloutResult<Verdict> {
        require(&[("env", environment), ("repo", repository), ("buildId", build_id)])?;

        let records = self
            .store
            .query_deployments_by_build(environment, repository, build_id)?;
        let verdict = summarize(&records);

        let mut transition = BuildTransition::to(verdict.build_status).with_failed_targets(
            verdict.partial_success,
            verdict.failed_deployments.clone(),
        );
        if let Some(message) = error_message(&verdict) {
            transition = transition.with_error(message);
        }
        self.store
            .update_build_status(&BuildKey::new(repository, environment, build_id), &transition)?;

        info!(
            env = %environment,
            repo = %repository,
            build = %build_id,
            status = %verdict.build_status,
            total = verdict.summary.total,
            succeeded = verdict.summary.succeeded,
            failed = verdict.summary.failed,
            partial = verdict.partial_success,
            "build aggregated"
        );
        Ok(verdict)
    }
}
