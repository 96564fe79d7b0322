//! Status polling: one unit-level operation check plus a bounded fan-out of
//! per-target instance checks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stackline_core::{DeploymentStatus, Target};
use stackline_state::{DeploymentUpdate, MAX_DIAGNOSTIC_EVENTS, StateError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::driver::DeploymentDriver;
use crate::error::{RolloutError, RolloutResult, require};
use crate::provider::{DetailedStatus, InstanceSummary, OperationStatus, ProviderError};
use crate::status;

/// Observed state of one target after a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetReport {
    pub target: Target,
    pub status: DeploymentStatus,
    /// `None` when the provider could not be asked about this target.
    pub detailed_status: Option<DetailedStatus>,
    pub status_reason: Option<String>,
    pub stack_id: Option<String>,
    pub events: Vec<String>,
}

/// Result of one PollStatus invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollReport {
    pub operation_status: OperationStatus,
    pub deployments: Vec<TargetReport>,
    pub is_complete: bool,
    pub has_failures: bool,
}

type InstanceCheck = Result<(InstanceSummary, Vec<String>), ProviderError>;

impl DeploymentDriver {
    /// Poll the unit operation and every target, recording what was observed.
    pub async fn poll_status(
        &self,
        environment: &str,
        repository: &str,
        unit_name: &str,
        operation_id: &str,
        targets: &[Target],
    ) -> RolloutResult<PollReport> {
        require(&[
            ("env", environment),
            ("repo", repository),
            ("unitName", unit_name),
            ("operationId", operation_id),
        ])?;

        let operation_status = match self
            .provider
            .describe_operation(unit_name, operation_id)
            .await
        {
            Ok(status) => status,
            Err(e) if e.is_transient() => return Err(RolloutError::from_provider(e)),
            Err(e) => {
                warn!(
                    unit = %unit_name,
                    operation = %operation_id,
                    error = %e,
                    "operation status unknown, assuming running"
                );
                OperationStatus::Running
            }
        };

        let checks = self.check_instances(unit_name, targets).await;

        let mut deployments = Vec::with_capacity(targets.len());
        for (target, check) in targets.iter().zip(checks) {
            let report = match check {
                Some(Ok((summary, events))) => self.record_instance(
                    environment,
                    repository,
                    unit_name,
                    operation_id,
                    summary,
                    events,
                )?,
                Some(Err(e)) => {
                    warn!(instance = %target, error = %e, "instance status unavailable");
                    pending_report(target)
                }
                None => pending_report(target),
            };
            deployments.push(report);
        }

        let detailed: Vec<Option<DetailedStatus>> =
            deployments.iter().map(|d| d.detailed_status).collect();
        let is_complete = status::is_complete(operation_status, &detailed);
        let has_failures = deployments
            .iter()
            .any(|d| d.status == DeploymentStatus::Failed);

        info!(
            env = %environment,
            repo = %repository,
            unit = %unit_name,
            operation = %operation_status,
            targets = deployments.len(),
            is_complete,
            has_failures,
            "status polled"
        );
        Ok(PollReport {
            operation_status,
            deployments,
            is_complete,
            has_failures,
        })
    }

    /// Describe every target concurrently, at most `poll_parallelism` at a time.
    /// Results come back in target order; `None` marks a check that never finished.
    async fn check_instances(
        &self,
        unit_name: &str,
        targets: &[Target],
    ) -> Vec<Option<InstanceCheck>> {
        let semaphore = Arc::new(Semaphore::new(self.settings.poll_parallelism));
        let mut set = JoinSet::new();

        for (index, target) in targets.iter().cloned().enumerate() {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            let unit = unit_name.to_string();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, Err(ProviderError::Other("poll pool closed".to_string())));
                };
                let summary = match provider.describe_instance(&unit, &target).await {
                    Ok(summary) => summary,
                    Err(e) => return (index, Err(e)),
                };
                let events = if status::deployment_status(summary.status, summary.detailed_status)
                    == DeploymentStatus::Failed
                {
                    provider
                        .failed_events(&unit, &target, MAX_DIAGNOSTIC_EVENTS)
                        .await
                        .unwrap_or_else(|e| {
                            debug!(instance = %target, error = %e, "failed events unavailable");
                            Vec::new()
                        })
                } else {
                    Vec::new()
                };
                (index, Ok((summary, events)))
            });
        }

        let mut results: Vec<Option<InstanceCheck>> = vec![None; targets.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, check)) => results[index] = Some(check),
                Err(e) => warn!(unit = %unit_name, error = %e, "instance check task failed"),
            }
        }
        results
    }

    fn record_instance(
        &self,
        environment: &str,
        repository: &str,
        unit_name: &str,
        operation_id: &str,
        summary: InstanceSummary,
        events: Vec<String>,
    ) -> RolloutResult<TargetReport> {
        let observed = status::deployment_status(summary.status, summary.detailed_status);
        let update = DeploymentUpdate {
            status: Some(observed),
            unit_id: Some(unit_name.to_string()),
            operation_id: Some(operation_id.to_string()),
            stack_id: summary.stack_id.clone(),
            status_reason: summary.status_reason.clone(),
            error_message: (observed == DeploymentStatus::Failed)
                .then(|| summary.status_reason.clone())
                .flatten(),
            events: (!events.is_empty()).then(|| events.clone()),
        };

        let status = match self.store.update_deployment_status(
            environment,
            repository,
            &summary.target,
            &update,
        ) {
            Ok(record) => record.status,
            Err(StateError::NotFound(key)) => {
                warn!(deployment = %key, "no deployment record for polled target");
                observed
            }
            Err(e) => return Err(e.into()),
        };

        Ok(TargetReport {
            target: summary.target,
            status,
            detailed_status: Some(summary.detailed_status),
            status_reason: summary.status_reason,
            stack_id: summary.stack_id,
            events: events.into_iter().take(MAX_DIAGNOSTIC_EVENTS).collect(),
        })
    }
}

fn pending_report(target: &Target) -> TargetReport {
    TargetReport {
        target: target.clone(),
        status: DeploymentStatus::InProgress,
        detailed_status: None,
        status_reason: None,
        stack_id: None,
        events: Vec::new(),
    }
}
