//! Status reduction: maps provider status dimensions onto ledger statuses.

use stackline_core::DeploymentStatus;

use crate::provider::{DetailedStatus, InstanceStatus, OperationStatus};

/// Combine the two per-instance dimensions into one deployment status.
///
/// The detailed status describes the most recent operation and wins while
/// that operation is moving or has failed. Once it settled, the instance
/// status says whether the target matches the unit.
pub fn deployment_status(instance: InstanceStatus, detailed: DetailedStatus) -> DeploymentStatus {
    match (instance, detailed) {
        (_, DetailedStatus::Pending | DetailedStatus::Running) => DeploymentStatus::InProgress,
        (_, DetailedStatus::Failed | DetailedStatus::Cancelled | DetailedStatus::Inoperable) => {
            DeploymentStatus::Failed
        }
        (InstanceStatus::Current, _) => DeploymentStatus::Success,
        (InstanceStatus::Outdated | InstanceStatus::Inoperable, _) => DeploymentStatus::Failed,
    }
}

/// A poll is complete once the unit operation and every instance settled.
pub fn is_complete(operation: OperationStatus, instances: &[Option<DetailedStatus>]) -> bool {
    operation.is_terminal()
        && instances
            .iter()
            .all(|status| status.is_some_and(DetailedStatus::is_terminal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combination_table() {
        use DeploymentStatus::*;
        let cases = [
            (InstanceStatus::Current, DetailedStatus::Succeeded, Success),
            (InstanceStatus::Current, DetailedStatus::SkippedSuspendedAccount, Success),
            (InstanceStatus::Outdated, DetailedStatus::Running, InProgress),
            (InstanceStatus::Outdated, DetailedStatus::Pending, InProgress),
            (InstanceStatus::Outdated, DetailedStatus::Succeeded, Failed),
            (InstanceStatus::Outdated, DetailedStatus::SkippedSuspendedAccount, Failed),
            (InstanceStatus::Current, DetailedStatus::Failed, Failed),
            (InstanceStatus::Current, DetailedStatus::Cancelled, Failed),
            (InstanceStatus::Inoperable, DetailedStatus::Inoperable, Failed),
        ];
        for (instance, detailed, expected) in cases {
            assert_eq!(
                deployment_status(instance, detailed),
                expected,
                "{instance:?} + {detailed:?}"
            );
        }
    }

    #[test]
    fn complete_when_everything_settled() {
        let instances = [
            Some(DetailedStatus::Succeeded),
            Some(DetailedStatus::Failed),
            Some(DetailedStatus::Cancelled),
        ];
        assert!(is_complete(OperationStatus::Succeeded, &instances));
    }

    #[test]
    fn incomplete_while_any_instance_moves() {
        let instances = [Some(DetailedStatus::Succeeded), Some(DetailedStatus::Running)];
        assert!(!is_complete(OperationStatus::Succeeded, &instances));

        let instances = [Some(DetailedStatus::Pending)];
        assert!(!is_complete(OperationStatus::Failed, &instances));
    }

    #[test]
    fn incomplete_while_operation_runs() {
        let instances = [Some(DetailedStatus::Succeeded)];
        assert!(!is_complete(OperationStatus::Running, &instances));
        assert!(!is_complete(OperationStatus::Stopping, &instances));
    }

    #[test]
    fn missing_result_counts_as_in_progress() {
        let instances = [Some(DetailedStatus::Succeeded), None];
        assert!(!is_complete(OperationStatus::Succeeded, &instances));
    }
}
