//! In-memory deployment unit provider.
//!
//! Simulates a unit and its instances deterministically: every operation
//! settles after a fixed number of status checks, and targets can be marked
//! to fail. Used by tests and by the CLI's local mode.

use std::collections::BTreeMap;

use async_trait::async_trait;
use stackline_core::Target;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::provider::{
    DetailedStatus, InstanceStatus, InstanceSummary, OperationStatus, ProviderError, UnitProvider,
    UnitSpec, UnitSummary,
};

#[derive(Debug)]
struct LocalInstance {
    status: InstanceStatus,
    detailed: DetailedStatus,
    reason: Option<String>,
    stack_id: String,
    events: Vec<String>,
}

#[derive(Debug)]
struct LocalOperation {
    targets: Vec<Target>,
    remaining_checks: u32,
    status: OperationStatus,
}

#[derive(Debug)]
struct LocalUnit {
    unit_id: String,
    spec: UnitSpec,
    instances: BTreeMap<Target, LocalInstance>,
    operations: BTreeMap<String, LocalOperation>,
}

impl LocalUnit {
    fn running_operation(&self) -> Option<&str> {
        self.operations
            .iter()
            .find(|(_, op)| !op.status.is_terminal())
            .map(|(id, _)| id.as_str())
    }

    /// Reject callers while an operation runs. Each rejected call counts as
    /// one status check of the running operation.
    fn ensure_idle(&mut self, failures: &BTreeMap<Target, String>) -> Result<(), ProviderError> {
        let Some(id) = self.running_operation().map(str::to_string) else {
            return Ok(());
        };
        if self.check(&id, failures).is_terminal() {
            return Ok(());
        }
        Err(ProviderError::OperationInProgress(format!(
            "Another operation on unit {} is in progress: {id}",
            self.spec.name
        )))
    }

    /// Count one status check against an operation, settling it on the last.
    fn check(&mut self, operation_id: &str, failures: &BTreeMap<Target, String>) -> OperationStatus {
        let Some(operation) = self.operations.get_mut(operation_id) else {
            return OperationStatus::Failed;
        };
        if operation.status.is_terminal() {
            return operation.status;
        }
        operation.remaining_checks = operation.remaining_checks.saturating_sub(1);
        if operation.remaining_checks > 0 {
            return operation.status;
        }

        let mut failed = 0usize;
        for target in &operation.targets {
            let Some(instance) = self.instances.get_mut(target) else {
                continue;
            };
            match failures.get(target) {
                Some(reason) => {
                    failed += 1;
                    instance.status = InstanceStatus::Outdated;
                    instance.detailed = DetailedStatus::Failed;
                    instance.reason = Some(reason.clone());
                    instance.events = vec![
                        format!("{target} CREATE_FAILED: {reason}"),
                        format!("{target} ROLLBACK_COMPLETE"),
                    ];
                }
                None => {
                    instance.status = InstanceStatus::Current;
                    instance.detailed = DetailedStatus::Succeeded;
                    instance.reason = None;
                    instance.events.clear();
                }
            }
        }
        operation.status = if failed == 0 {
            OperationStatus::Succeeded
        } else {
            OperationStatus::Failed
        };
        debug!(unit = %self.spec.name, operation = %operation_id, failed, "local operation settled");
        operation.status
    }

    /// Start an operation touching `targets`, marking their instances as moving.
    fn start_operation(&mut self, targets: Vec<Target>, checks: u32) -> String {
        let id = Uuid::new_v4().to_string();
        for target in &targets {
            if let Some(instance) = self.instances.get_mut(target) {
                instance.status = InstanceStatus::Outdated;
                instance.detailed = DetailedStatus::Running;
                instance.reason = None;
                instance.events.clear();
            }
        }
        self.operations.insert(
            id.clone(),
            LocalOperation {
                targets,
                remaining_checks: checks,
                status: OperationStatus::Running,
            },
        );
        id
    }
}

#[derive(Debug, Default)]
struct LocalState {
    units: BTreeMap<String, LocalUnit>,
    /// Targets whose operations fail, with the reported reason.
    failures: BTreeMap<Target, String>,
}

impl LocalState {
    fn unit(&self, name: &str) -> Result<&LocalUnit, ProviderError> {
        self.units
            .get(name)
            .ok_or_else(|| ProviderError::NotFound(format!("unit {name}")))
    }

    /// A unit together with the injected failures, borrowed side by side.
    fn unit_mut(
        &mut self,
        name: &str,
    ) -> Result<(&mut LocalUnit, &BTreeMap<Target, String>), ProviderError> {
        match self.units.get_mut(name) {
            Some(unit) => Ok((unit, &self.failures)),
            None => Err(ProviderError::NotFound(format!("unit {name}"))),
        }
    }
}

/// Deterministic in-memory [`UnitProvider`].
#[derive(Debug)]
pub struct LocalProvider {
    state: Mutex<LocalState>,
    checks_to_settle: u32,
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new(1)
    }
}

impl LocalProvider {
    /// Operations settle on the `checks_to_settle`-th status check.
    pub fn new(checks_to_settle: u32) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            checks_to_settle: checks_to_settle.max(1),
        }
    }

    /// Make operations touching `target` fail with `reason`.
    pub async fn fail_target(&self, target: Target, reason: impl Into<String>) {
        self.state.lock().await.failures.insert(target, reason.into());
    }

    /// Current definition of a unit.
    pub async fn unit_spec(&self, name: &str) -> Option<UnitSpec> {
        self.state
            .lock()
            .await
            .units
            .get(name)
            .map(|unit| unit.spec.clone())
    }
}

#[async_trait]
impl UnitProvider for LocalProvider {
    async fn describe_unit(&self, name: &str) -> Result<Option<UnitSummary>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state.units.get(name).map(|unit| UnitSummary {
            name: name.to_string(),
            unit_id: unit.unit_id.clone(),
        }))
    }

    async fn create_unit(&self, spec: &UnitSpec) -> Result<UnitSummary, ProviderError> {
        let mut state = self.state.lock().await;
        if state.units.contains_key(&spec.name) {
            return Err(ProviderError::AlreadyExists(format!("unit {}", spec.name)));
        }
        let unit_id = format!("{}:{}", spec.name, Uuid::new_v4());
        state.units.insert(
            spec.name.clone(),
            LocalUnit {
                unit_id: unit_id.clone(),
                spec: spec.clone(),
                instances: BTreeMap::new(),
                operations: BTreeMap::new(),
            },
        );
        Ok(UnitSummary {
            name: spec.name.clone(),
            unit_id,
        })
    }

    /// A changed definition is rolled out to every existing instance in one
    /// operation. A unit without instances changes without an operation.
    async fn update_unit(&self, spec: &UnitSpec) -> Result<Option<String>, ProviderError> {
        let checks = self.checks_to_settle;
        let mut state = self.state.lock().await;
        let (unit, failures) = state.unit_mut(&spec.name)?;
        if unit.spec == *spec {
            return Err(ProviderError::NoChanges);
        }
        unit.ensure_idle(failures)?;
        unit.spec = spec.clone();
        if unit.instances.is_empty() {
            return Ok(None);
        }
        let targets = unit.instances.keys().cloned().collect();
        Ok(Some(unit.start_operation(targets, checks)))
    }

    async fn list_instances(&self, unit: &str) -> Result<Vec<Target>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state.unit(unit)?.instances.keys().cloned().collect())
    }

    async fn create_instances(
        &self,
        unit: &str,
        targets: &[Target],
    ) -> Result<String, ProviderError> {
        let checks = self.checks_to_settle;
        let mut state = self.state.lock().await;
        let (local, failures) = state.unit_mut(unit)?;
        local.ensure_idle(failures)?;
        for target in targets {
            local
                .instances
                .entry(target.clone())
                .or_insert_with(|| LocalInstance {
                    status: InstanceStatus::Outdated,
                    detailed: DetailedStatus::Pending,
                    reason: None,
                    stack_id: format!("local:{}:{}:{unit}", target.account_id, target.region),
                    events: Vec::new(),
                });
        }
        Ok(local.start_operation(targets.to_vec(), checks))
    }

    async fn update_instances(
        &self,
        unit: &str,
        targets: &[Target],
    ) -> Result<String, ProviderError> {
        let checks = self.checks_to_settle;
        let mut state = self.state.lock().await;
        let (local, failures) = state.unit_mut(unit)?;
        local.ensure_idle(failures)?;
        if let Some(missing) = targets.iter().find(|t| !local.instances.contains_key(*t)) {
            return Err(ProviderError::NotFound(format!("instance {missing} of unit {unit}")));
        }
        Ok(local.start_operation(targets.to_vec(), checks))
    }

    async fn describe_operation(
        &self,
        unit: &str,
        operation_id: &str,
    ) -> Result<OperationStatus, ProviderError> {
        let mut state = self.state.lock().await;
        let (local, failures) = state.unit_mut(unit)?;
        if !local.operations.contains_key(operation_id) {
            return Err(ProviderError::NotFound(format!("operation {operation_id}")));
        }
        Ok(local.check(operation_id, failures))
    }

    async fn describe_instance(
        &self,
        unit: &str,
        target: &Target,
    ) -> Result<InstanceSummary, ProviderError> {
        let state = self.state.lock().await;
        let instance = state
            .unit(unit)?
            .instances
            .get(target)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {target} of unit {unit}")))?;
        Ok(InstanceSummary {
            target: target.clone(),
            status: instance.status,
            detailed_status: instance.detailed,
            status_reason: instance.reason.clone(),
            stack_id: Some(instance.stack_id.clone()),
        })
    }

    async fn failed_events(
        &self,
        unit: &str,
        target: &Target,
        limit: usize,
    ) -> Result<Vec<String>, ProviderError> {
        let state = self.state.lock().await;
        let instance = state
            .unit(unit)?
            .instances
            .get(target)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {target} of unit {unit}")))?;
        Ok(instance.events.iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> UnitSpec {
        UnitSpec {
            name: name.to_string(),
            template_location: "/artifacts/b1/template.yaml".to_string(),
            parameters: BTreeMap::new(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn operation_settles_after_configured_checks() {
        let provider = LocalProvider::new(2);
        provider.create_unit(&spec("infra-dev")).await.unwrap();
        let target = Target::new("111111111111", "us-east-1");
        let op = provider
            .create_instances("infra-dev", std::slice::from_ref(&target))
            .await
            .unwrap();

        assert_eq!(
            provider.describe_operation("infra-dev", &op).await.unwrap(),
            OperationStatus::Running
        );
        assert_eq!(
            provider.describe_operation("infra-dev", &op).await.unwrap(),
            OperationStatus::Succeeded
        );
        let instance = provider.describe_instance("infra-dev", &target).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Current);
    }

    #[tokio::test]
    async fn busy_unit_rejects_second_operation() {
        let provider = LocalProvider::new(2);
        provider.create_unit(&spec("infra-dev")).await.unwrap();
        let targets = [Target::new("111111111111", "us-east-1")];
        let op = provider.create_instances("infra-dev", &targets).await.unwrap();

        let err = provider.update_instances("infra-dev", &targets).await.unwrap_err();
        match err {
            ProviderError::OperationInProgress(message) => assert!(message.contains(&op)),
            other => panic!("expected in-progress error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn changed_definition_rolls_out_to_existing_instances() {
        let provider = LocalProvider::new(2);
        provider.create_unit(&spec("infra-dev")).await.unwrap();
        let target = Target::new("111111111111", "us-east-1");
        let op = provider
            .create_instances("infra-dev", std::slice::from_ref(&target))
            .await
            .unwrap();
        provider.describe_operation("infra-dev", &op).await.unwrap();
        provider.describe_operation("infra-dev", &op).await.unwrap();

        let mut changed = spec("infra-dev");
        changed.template_location = "/artifacts/b2/template.yaml".to_string();
        let update = provider.update_unit(&changed).await.unwrap().unwrap();
        let instance = provider.describe_instance("infra-dev", &target).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Outdated);
        assert_eq!(instance.detailed_status, DetailedStatus::Running);

        assert_eq!(
            provider.describe_operation("infra-dev", &update).await.unwrap(),
            OperationStatus::Running
        );
        assert_eq!(
            provider.describe_operation("infra-dev", &update).await.unwrap(),
            OperationStatus::Succeeded
        );
        let instance = provider.describe_instance("infra-dev", &target).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Current);
    }

    #[tokio::test]
    async fn unchanged_update_reports_no_changes() {
        let provider = LocalProvider::default();
        provider.create_unit(&spec("infra-dev")).await.unwrap();
        assert_eq!(
            provider.update_unit(&spec("infra-dev")).await,
            Err(ProviderError::NoChanges)
        );
        assert!(matches!(
            provider.create_unit(&spec("infra-dev")).await,
            Err(ProviderError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn injected_failure_reports_events() {
        let provider = LocalProvider::default();
        let target = Target::new("222222222222", "eu-west-1");
        provider.fail_target(target.clone(), "bucket name taken").await;
        provider.create_unit(&spec("infra-dev")).await.unwrap();
        let op = provider
            .create_instances("infra-dev", std::slice::from_ref(&target))
            .await
            .unwrap();

        assert_eq!(
            provider.describe_operation("infra-dev", &op).await.unwrap(),
            OperationStatus::Failed
        );
        let instance = provider.describe_instance("infra-dev", &target).await.unwrap();
        assert_eq!(instance.detailed_status, DetailedStatus::Failed);
        let events = provider.failed_events("infra-dev", &target, 1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("bucket name taken"));
    }
}
