//! In-process workflow runner.
//!
//! Sequences the steps for one build the way the external engine does for
//! local runs: retryable step errors are retried after a pause, a held lock
//! is waited on, and a build the run gives up on is marked FAILED before its
//! lock is released.

use std::future::Future;
use std::time::Duration;

use stackline_core::BuildStatus;
use stackline_state::{BuildKey, BuildTransition};
use tracing::{info, warn};

use crate::contracts::*;
use crate::error::{TaskError, TaskResult};
use crate::handlers::TaskContext;

#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Pause between lock attempts, step retries and status polls.
    pub step_interval: Duration,
    pub max_polls: u32,
    /// Retries of a single step that keeps failing with a retryable error.
    pub max_step_retries: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            step_interval: Duration::from_secs(1),
            max_polls: 120,
            max_step_retries: 30,
        }
    }
}

impl TaskContext {
    /// Run every step for a submitted build and return the aggregated result.
    pub async fn run_build(
        &self,
        build: &BuildRef,
        artifact_location: &str,
        settings: &RunSettings,
    ) -> TaskResult<AggregateResultsOutput> {
        if let Err(e) = self.start_and_lock(build, artifact_location, settings).await {
            self.give_up(build, &e);
            return Err(e);
        }

        let outcome = self.deploy(build, artifact_location, settings).await;
        if let Err(e) = &outcome {
            self.give_up(build, e);
        }
        self.release_lock(build.clone())?;
        outcome
    }

    async fn start_and_lock(
        &self,
        build: &BuildRef,
        artifact_location: &str,
        settings: &RunSettings,
    ) -> TaskResult<()> {
        let mut extra = serde_json::Map::new();
        extra.insert("artifactLocation".to_string(), artifact_location.into());
        let start = StartExecutionInput {
            repo: build.repo.clone(),
            env: build.env.clone(),
            build_id: build.build_id.clone(),
            extra,
        };
        let started = retrying(settings, "start-execution", || self.start_execution(start.clone())).await?;

        let mut retry_count = 0;
        loop {
            let lock = self.acquire_lock(AcquireLockInput {
                env: build.env.clone(),
                repo: build.repo.clone(),
                build_id: build.build_id.clone(),
                execution_handle: started.execution_handle.clone(),
                retry_count,
            })?;
            if lock.lock_acquired {
                return Ok(());
            }
            retry_count = lock.retry_count;
            info!(build = %build.build_id, message = %lock.message, "waiting for lock");
            tokio::time::sleep(settings.step_interval).await;
        }
    }

    async fn deploy(
        &self,
        build: &BuildRef,
        artifact_location: &str,
        settings: &RunSettings,
    ) -> TaskResult<AggregateResultsOutput> {
        let targets = self
            .fetch_targets(FetchTargetsInput {
                env: build.env.clone(),
                repo: build.repo.clone(),
                build_id: Some(build.build_id.clone()),
            })?
            .targets;

        let unit_input = CreateOrUpdateUnitInput {
            env: build.env.clone(),
            repo: build.repo.clone(),
            build_id: build.build_id.clone(),
            artifact_location: artifact_location.to_string(),
        };
        let unit = retrying(settings, "create-or-update-unit", || {
            self.create_or_update_unit(unit_input.clone())
        })
        .await?;

        let provision_input = ProvisionInstancesInput {
            unit_name: unit.unit_name.clone(),
            targets: targets.clone(),
        };
        let provisioned = retrying(settings, "provision-instances", || {
            self.provision_instances(provision_input.clone())
        })
        .await?;

        let poll_input = PollStatusInput {
            env: build.env.clone(),
            repo: build.repo.clone(),
            unit_name: unit.unit_name,
            operation_id: provisioned.operation_id,
            targets,
        };
        let mut polls = 0;
        loop {
            polls += 1;
            let status = retrying(settings, "poll-status", || self.poll_status(poll_input.clone())).await?;
            if status.is_complete {
                break;
            }
            if polls >= settings.max_polls {
                return Err(TaskError::Failed(format!(
                    "rollout of build {} did not complete after {polls} polls",
                    build.build_id
                )));
            }
            tokio::time::sleep(settings.step_interval).await;
        }

        self.aggregate_results(build.clone()).await
    }

    /// Mark an abandoned build FAILED unless it already finished.
    fn give_up(&self, build: &BuildRef, error: &TaskError) {
        warn!(
            build = %build.build_id,
            error_type = error.error_type(),
            error = %error,
            "giving up on build"
        );
        let key = BuildKey::new(&build.repo, &build.env, &build.build_id);
        let finished = match self.store().get_build(&key) {
            Ok(Some(record)) => record.status.is_terminal(),
            Ok(None) => true,
            Err(e) => {
                warn!(build = %build.build_id, error = %e, "cannot read abandoned build");
                return;
            }
        };
        if finished {
            return;
        }
        let transition = BuildTransition::to(BuildStatus::Failed).with_error(error.to_string());
        if let Err(e) = self.store().update_build_status(&key, &transition) {
            warn!(build = %build.build_id, error = %e, "cannot mark abandoned build failed");
        }
    }
}

/// Re-invoke `call` while it fails with a retryable error.
async fn retrying<T, F, Fut>(settings: &RunSettings, step: &str, mut call: F) -> TaskResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TaskResult<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(e) if e.is_retryable() && attempt < settings.max_step_retries => {
                attempt += 1;
                info!(step, attempt, error = %e, "step retryable, backing off");
                tokio::time::sleep(settings.step_interval).await;
            }
            result => return result,
        }
    }
}
