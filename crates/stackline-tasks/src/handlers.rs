//! Step handlers.
//!
//! Each handler is stateless apart from the shared ledgers, validates its
//! input, performs one idempotent step and returns the step's output
//! document.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use stackline_core::{BuildStatus, StacklineConfig, naming};
use stackline_rollout::{
    DeploymentDriver, DriverSettings, ParameterSource, TargetResolver, UnitProvider,
};
use stackline_state::{BuildKey, StateStore};
use thiserror::Error;
use tracing::{info, warn};

use crate::contracts::*;
use crate::engine::WorkflowEngine;
use crate::error::{TaskError, TaskResult};

/// Steps the workflow engine can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    StartExecution,
    AcquireLock,
    FetchTargets,
    CreateOrUpdateUnit,
    ProvisionInstances,
    PollStatus,
    AggregateResults,
    ReleaseLock,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::StartExecution,
        Step::AcquireLock,
        Step::FetchTargets,
        Step::CreateOrUpdateUnit,
        Step::ProvisionInstances,
        Step::PollStatus,
        Step::AggregateResults,
        Step::ReleaseLock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::StartExecution => "start-execution",
            Step::AcquireLock => "acquire-lock",
            Step::FetchTargets => "fetch-targets",
            Step::CreateOrUpdateUnit => "create-or-update-unit",
            Step::ProvisionInstances => "provision-instances",
            Step::PollStatus => "poll-status",
            Step::AggregateResults => "aggregate-results",
            Step::ReleaseLock => "release-lock",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown step: {0}")]
pub struct UnknownStep(pub String);

impl FromStr for Step {
    type Err = UnknownStep;

    /// Accepts `acquire-lock`, `acquire_lock` and `AcquireLock`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        Step::ALL
            .into_iter()
            .find(|step| step.as_str().replace('-', "") == wanted)
            .ok_or_else(|| UnknownStep(s.to_string()))
    }
}

/// Everything a step needs: the ledgers, the provider-backed driver and the
/// workflow engine.
#[derive(Clone)]
pub struct TaskContext {
    store: StateStore,
    resolver: TargetResolver,
    driver: DeploymentDriver,
    engine: Arc<dyn WorkflowEngine>,
    config: StacklineConfig,
}

impl TaskContext {
    pub fn new(
        store: StateStore,
        provider: Arc<dyn UnitProvider>,
        parameters: Arc<dyn ParameterSource>,
        engine: Arc<dyn WorkflowEngine>,
        config: StacklineConfig,
    ) -> Self {
        let resolver = TargetResolver::new(
            store.clone(),
            config.rollout.default_initial_environment.clone(),
        );
        let driver = DeploymentDriver::new(
            store.clone(),
            provider,
            parameters,
            DriverSettings::from(&config.rollout),
        );
        Self {
            store,
            resolver,
            driver,
            engine,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn resolver(&self) -> &TargetResolver {
        &self.resolver
    }

    /// Run `step` on a raw JSON input, returning the JSON output.
    pub async fn dispatch(
        &self,
        step: Step,
        input: serde_json::Value,
    ) -> TaskResult<serde_json::Value> {
        match step {
            Step::StartExecution => to_json(self.start_execution(parse(input)?).await?),
            Step::AcquireLock => to_json(self.acquire_lock(parse(input)?)?),
            Step::FetchTargets => to_json(self.fetch_targets(parse(input)?)?),
            Step::CreateOrUpdateUnit => to_json(self.create_or_update_unit(parse(input)?).await?),
            Step::ProvisionInstances => to_json(self.provision_instances(parse(input)?).await?),
            Step::PollStatus => to_json(self.poll_status(parse(input)?).await?),
            Step::AggregateResults => to_json(self.aggregate_results(parse(input)?).await?),
            Step::ReleaseLock => to_json(self.release_lock(parse(input)?)?),
        }
    }

    /// Start the deployment workflow for a submitted build and mark it
    /// IN_PROGRESS with the execution handle.
    pub async fn start_execution(
        &self,
        input: StartExecutionInput,
    ) -> TaskResult<StartExecutionOutput> {
        require(&[
            ("repo", &input.repo),
            ("env", &input.env),
            ("buildId", &input.build_id),
        ])?;
        let key = BuildKey::new(&input.repo, &input.env, &input.build_id);
        let Some(build) = self.store.get_build(&key)? else {
            return Err(TaskError::Validation(format!(
                "build {} of {} in {} has not been submitted",
                input.build_id, input.repo, input.env
            )));
        };

        let name = naming::execution_name(&input.repo, &input.env, &input.build_id);
        let started = build.status != BuildStatus::Pending;
        if let Some(handle) = build.execution_handle.filter(|_| started) {
            info!(build = %input.build_id, execution = %name, "execution already started");
            return Ok(StartExecutionOutput {
                execution_name: name,
                execution_handle: handle,
            });
        }
        let payload = serde_json::to_string(&input)
            .map_err(|e| TaskError::Validation(format!("unserializable input: {e}")))?;
        let handle = self
            .engine
            .start_execution(&self.config.workflow.state_machine, &name, &payload)
            .await?;
        self.store.start_build_execution(&key, &handle)?;

        info!(
            repo = %input.repo,
            env = %input.env,
            build = %input.build_id,
            execution = %name,
            "deployment execution started"
        );
        Ok(StartExecutionOutput {
            execution_name: name,
            execution_handle: handle,
        })
    }

    /// Try to take the (environment, repository) lock for a build.
    ///
    /// A held lock is not an error: the engine waits and retries until the
    /// attempt budget runs out, which then fails the step.
    pub fn acquire_lock(&self, input: AcquireLockInput) -> TaskResult<AcquireLockOutput> {
        require(&[
            ("env", &input.env),
            ("repo", &input.repo),
            ("buildId", &input.build_id),
            ("executionHandle", &input.execution_handle),
        ])?;
        let acquisition = self.store.acquire_lock(
            &input.env,
            &input.repo,
            &input.build_id,
            &input.execution_handle,
            self.config.lock.lease_secs(),
        )?;

        if acquisition.acquired {
            return Ok(AcquireLockOutput {
                lock_acquired: true,
                retry_count: input.retry_count,
                should_retry: false,
                message: format!("lock acquired by build {}", input.build_id),
            });
        }

        let attempts = input.retry_count.saturating_add(1);
        let max_attempts = self.config.lock.max_acquire_attempts;
        if attempts >= max_attempts {
            warn!(
                env = %input.env,
                repo = %input.repo,
                build = %input.build_id,
                holder = %acquisition.record.build_id,
                attempts,
                "lock acquisition budget exhausted"
            );
            return Err(TaskError::LockTimeout {
                environment: input.env,
                repository: input.repo,
                attempts,
            });
        }
        Ok(AcquireLockOutput {
            lock_acquired: false,
            retry_count: attempts,
            should_retry: true,
            message: format!(
                "lock held by build {} until {}",
                acquisition.record.build_id, acquisition.record.expires_at
            ),
        })
    }

    /// Expand the configured targets, optionally seeding deployment records.
    pub fn fetch_targets(&self, input: FetchTargetsInput) -> TaskResult<FetchTargetsOutput> {
        require(&[("env", &input.env), ("repo", &input.repo)])?;
        let targets = self.resolver.resolve(&input.repo, &input.env)?;
        if let Some(build_id) = input.build_id.as_deref().filter(|id| !id.trim().is_empty()) {
            self.store
                .create_deployments(&input.env, &input.repo, build_id, &targets)?;
        }
        Ok(FetchTargetsOutput {
            count: targets.len(),
            targets,
        })
    }

    pub async fn create_or_update_unit(
        &self,
        input: CreateOrUpdateUnitInput,
    ) -> TaskResult<CreateOrUpdateUnitOutput> {
        let outcome = self
            .driver
            .create_or_update_unit(
                &input.env,
                &input.repo,
                &input.build_id,
                &input.artifact_location,
            )
            .await?;
        Ok(CreateOrUpdateUnitOutput {
            unit_name: outcome.unit_name,
            operation: outcome.operation,
        })
    }

    pub async fn provision_instances(
        &self,
        input: ProvisionInstancesInput,
    ) -> TaskResult<ProvisionInstancesOutput> {
        let outcome = self
            .driver
            .provision_instances(&input.unit_name, &input.targets)
            .await?;
        Ok(ProvisionInstancesOutput {
            operation_id: outcome.operation_id,
            account_ids: outcome.account_ids,
            regions: outcome.regions,
        })
    }

    pub async fn poll_status(&self, input: PollStatusInput) -> TaskResult<PollStatusOutput> {
        let report = self
            .driver
            .poll_status(
                &input.env,
                &input.repo,
                &input.unit_name,
                &input.operation_id,
                &input.targets,
            )
            .await?;
        Ok(PollStatusOutput {
            operation_status: report.operation_status,
            deployments: report
                .deployments
                .into_iter()
                .map(|d| DeploymentState {
                    account_id: d.target.account_id,
                    region: d.target.region,
                    status: d.status,
                    detailed_status: d.detailed_status,
                    status_reason: d.status_reason,
                    stack_id: d.stack_id,
                    events: d.events,
                })
                .collect(),
            is_complete: report.is_complete,
            has_failures: report.has_failures,
        })
    }

    pub async fn aggregate_results(&self, input: BuildRef) -> TaskResult<AggregateResultsOutput> {
        let verdict = self
            .driver
            .aggregate(&input.env, &input.repo, &input.build_id)
            .await?;
        Ok(AggregateResultsOutput {
            build_status: verdict.build_status,
            partial_success: verdict.partial_success,
            failed_deployments: verdict.failed_deployments,
            summary: verdict.summary,
        })
    }

    /// Release the lock held by a build. Releasing a lock that is already
    /// gone succeeds.
    pub fn release_lock(&self, input: BuildRef) -> TaskResult<ReleaseLockOutput> {
        require(&[
            ("env", &input.env),
            ("repo", &input.repo),
            ("buildId", &input.build_id),
        ])?;
        let released = self
            .store
            .release_lock(&input.env, &input.repo, &input.build_id)?;
        let message = if released {
            format!("lock released by build {}", input.build_id)
        } else {
            "no lock held".to_string()
        };
        Ok(ReleaseLockOutput { released, message })
    }
}

fn require(fields: &[(&str, &String)]) -> TaskResult<()> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TaskError::Validation(format!(
            "missing required field(s): {}",
            missing.join(", ")
        )))
    }
}

fn parse<T: DeserializeOwned>(input: serde_json::Value) -> TaskResult<T> {
    serde_json::from_value(input).map_err(|e| TaskError::Validation(format!("invalid input: {e}")))
}

fn to_json<T: Serialize>(output: T) -> TaskResult<serde_json::Value> {
    serde_json::to_value(output).map_err(|e| TaskError::Failed(format!("unserializable output: {e}")))
}
