//! End-to-end workflow tests.
//!
//! Plays the part of the workflow engine: submits builds and invokes every
//! step in order through `TaskContext::dispatch`, exactly as the JSON
//! contracts flow between steps, against the in-memory provider.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use stackline_core::{BuildStatus, StacklineConfig, Target};
use stackline_rollout::{DirParameterSource, LocalProvider};
use stackline_state::{BuildKey, NewBuild, StateStore, TargetConfig, TargetGroup};
use stackline_tasks::contracts::BuildRef;
use stackline_tasks::{LocalEngine, RunSettings, Step, TaskContext};

struct Harness {
    ctx: TaskContext,
    provider: Arc<LocalProvider>,
    engine: Arc<LocalEngine>,
    artifact: tempfile::TempDir,
}

fn harness() -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    store
        .put_target_config(&TargetConfig {
            repository: "default".to_string(),
            environment: "dev".to_string(),
            groups: vec![TargetGroup {
                accounts: vec!["111111111111".to_string(), "222222222222".to_string()],
                regions: vec!["us-east-1".to_string()],
            }],
            next_environments: Vec::new(),
            initial_environment: None,
            updated_at: 0,
        })
        .unwrap();

    let provider = Arc::new(LocalProvider::new(2));
    let engine = Arc::new(LocalEngine::new());
    let ctx = TaskContext::new(
        store,
        provider.clone(),
        Arc::new(DirParameterSource),
        engine.clone(),
        StacklineConfig::default(),
    );
    Harness {
        ctx,
        provider,
        engine,
        artifact: tempfile::tempdir().unwrap(),
    }
}

fn quick() -> RunSettings {
    RunSettings {
        step_interval: Duration::from_millis(1),
        ..RunSettings::default()
    }
}

impl Harness {
    fn submit(&self) -> String {
        self.submit_to("dev")
    }

    fn submit_to(&self, env: &str) -> String {
        self.ctx
            .store()
            .create_build(&NewBuild {
                repository: "payments".to_string(),
                environment: env.to_string(),
                branch: "main".to_string(),
                version: "2.4.0".to_string(),
                commit: "f00dbabe".to_string(),
                artifact_location: self.artifact.path().to_string_lossy().to_string(),
            })
            .unwrap()
            .build_id
    }

    fn artifact(&self) -> String {
        self.artifact.path().to_string_lossy().to_string()
    }

    fn build_status(&self, env: &str, build_id: &str) -> BuildStatus {
        self.ctx
            .store()
            .get_build(&BuildKey::new("payments", env, build_id))
            .unwrap()
            .unwrap()
            .status
    }

    async fn step(&self, step: Step, input: Value) -> Value {
        self.ctx.dispatch(step, input).await.unwrap()
    }

    /// Run every step for `build_id` and return the aggregation output.
    async fn run(&self, build_id: &str) -> Value {
        let artifact = self.artifact.path().to_string_lossy().to_string();
        let started = self
            .step(
                Step::StartExecution,
                json!({"repo": "payments", "env": "dev", "buildId": build_id, "artifactLocation": artifact}),
            )
            .await;
        let handle = started["executionHandle"].as_str().unwrap().to_string();

        let lock = self
            .step(
                Step::AcquireLock,
                json!({"env": "dev", "repo": "payments", "buildId": build_id, "executionHandle": handle}),
            )
            .await;
        assert_eq!(lock["lockAcquired"], true);

        let fetched = self
            .step(
                Step::FetchTargets,
                json!({"env": "dev", "repo": "payments", "buildId": build_id}),
            )
            .await;
        assert_eq!(fetched["count"], 2);
        let targets = fetched["targets"].clone();

        let unit = self
            .step(
                Step::CreateOrUpdateUnit,
                json!({"env": "dev", "repo": "payments", "buildId": build_id, "artifactLocation": artifact}),
            )
            .await;
        let unit_name = unit["unitName"].clone();

        let provisioned = self
            .step(
                Step::ProvisionInstances,
                json!({"unitName": unit_name, "targets": targets}),
            )
            .await;
        let operation_id = provisioned["operationId"].clone();

        let mut polls = 0;
        loop {
            polls += 1;
            let status = self
                .step(
                    Step::PollStatus,
                    json!({
                        "env": "dev",
                        "repo": "payments",
                        "unitName": unit_name,
                        "operationId": operation_id,
                        "targets": targets,
                    }),
                )
                .await;
            if status["isComplete"] == true {
                break;
            }
            assert!(polls < 10, "workflow never completed");
        }

        let aggregated = self
            .step(
                Step::AggregateResults,
                json!({"env": "dev", "repo": "payments", "buildId": build_id}),
            )
            .await;

        let released = self
            .step(
                Step::ReleaseLock,
                json!({"env": "dev", "repo": "payments", "buildId": build_id}),
            )
            .await;
        assert_eq!(released["released"], true);
        aggregated
    }
}

#[tokio::test]
async fn successful_workflow() {
    let h = harness();
    let build_id = h.submit();

    let aggregated = h.run(&build_id).await;
    assert_eq!(aggregated["buildStatus"], "SUCCESS");
    assert_eq!(aggregated["partialSuccess"], false);
    assert_eq!(aggregated["summary"]["total"], 2);
    assert_eq!(aggregated["summary"]["succeeded"], 2);

    let build = h
        .ctx
        .store()
        .get_build(&BuildKey::new("payments", "dev", &build_id))
        .unwrap()
        .unwrap();
    assert_eq!(build.status, BuildStatus::Success);
    assert!(build.execution_handle.is_some());
    assert_eq!(h.engine.execution_count().await, 1);
    assert!(h.ctx.store().get_lock("dev", "payments").unwrap().is_none());
}

#[tokio::test]
async fn rerunning_a_workflow_is_idempotent() {
    let h = harness();
    let build_id = h.submit();

    let first = h.run(&build_id).await;
    let second = h.run(&build_id).await;
    assert_eq!(first, second);
    assert_eq!(h.engine.execution_count().await, 1);
}

#[tokio::test]
async fn partial_failure_is_reported() {
    let h = harness();
    h.provider
        .fail_target(Target::new("222222222222", "us-east-1"), "Subnet quota exceeded")
        .await;
    let build_id = h.submit();

    let aggregated = h.run(&build_id).await;
    assert_eq!(aggregated["buildStatus"], "FAILED");
    assert_eq!(aggregated["partialSuccess"], true);
    assert_eq!(
        aggregated["failedDeployments"],
        json!(["222222222222/us-east-1"])
    );
    assert_eq!(aggregated["summary"]["failed"], 1);

    let latest = h.ctx.store().query_latest("dev").unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].build_id, build_id);
    assert_eq!(latest[0].status, BuildStatus::Failed);
}

#[tokio::test]
async fn second_build_waits_for_lock() {
    let h = harness();
    let first = h.submit();
    let second = h.submit();

    h.step(
        Step::AcquireLock,
        json!({"env": "dev", "repo": "payments", "buildId": first, "executionHandle": "exec-1"}),
    )
    .await;
    let waiting = h
        .step(
            Step::AcquireLock,
            json!({"env": "dev", "repo": "payments", "buildId": second, "executionHandle": "exec-2", "retryCount": 0}),
        )
        .await;
    assert_eq!(waiting["lockAcquired"], false);
    assert_eq!(waiting["shouldRetry"], true);
    assert_eq!(waiting["retryCount"], 1);

    let err = h
        .ctx
        .dispatch(
            Step::ReleaseLock,
            json!({"env": "dev", "repo": "payments", "buildId": second}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_output().error_type, "NotHolderError");
}

#[tokio::test]
async fn fetch_targets_without_configuration_fails_validation() {
    let h = harness();
    let err = h
        .ctx
        .dispatch(Step::FetchTargets, json!({"env": "prd", "repo": "payments"}))
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");
}

fn build_ref(env: &str, build_id: &str) -> BuildRef {
    BuildRef {
        env: env.to_string(),
        repo: "payments".to_string(),
        build_id: build_id.to_string(),
    }
}

#[tokio::test]
async fn runner_completes_a_build() {
    let h = harness();
    let build_id = h.submit();

    let aggregated = h
        .ctx
        .run_build(&build_ref("dev", &build_id), &h.artifact(), &quick())
        .await
        .unwrap();
    assert_eq!(aggregated.build_status, BuildStatus::Success);
    assert_eq!(aggregated.summary.succeeded, 2);
    assert_eq!(h.build_status("dev", &build_id), BuildStatus::Success);
    assert!(h.ctx.store().get_lock("dev", "payments").unwrap().is_none());

    let name = stackline_core::naming::execution_name("payments", "dev", &build_id);
    let execution = h.engine.execution(&name).await.unwrap();
    assert!(execution.input.contains(&build_id));
}

#[tokio::test]
async fn runner_fails_a_build_it_gives_up_on() {
    let h = harness();
    let build_id = h.submit_to("prd");

    let err = h
        .ctx
        .run_build(&build_ref("prd", &build_id), &h.artifact(), &quick())
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");

    let build = h
        .ctx
        .store()
        .get_build(&BuildKey::new("payments", "prd", &build_id))
        .unwrap()
        .unwrap();
    assert_eq!(build.status, BuildStatus::Failed);
    assert!(build.finished_at.is_some());
    assert!(build.error_message.is_some());
    assert!(h.ctx.store().get_lock("prd", "payments").unwrap().is_none());
}

#[tokio::test]
async fn runner_fails_a_build_that_never_gets_the_lock() {
    let h = harness();
    let holder = h.submit();
    let waiting = h.submit();
    h.step(
        Step::AcquireLock,
        json!({"env": "dev", "repo": "payments", "buildId": holder, "executionHandle": "exec-1"}),
    )
    .await;

    let err = h
        .ctx
        .run_build(&build_ref("dev", &waiting), &h.artifact(), &quick())
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "LockTimeoutError");
    assert_eq!(h.build_status("dev", &waiting), BuildStatus::Failed);

    let lock = h.ctx.store().get_lock("dev", "payments").unwrap().unwrap();
    assert_eq!(lock.build_id, holder);
}

#[tokio::test]
async fn runner_retries_while_the_unit_is_busy() {
    let h = harness();
    let first = h.submit();
    h.ctx
        .run_build(&build_ref("dev", &first), &h.artifact(), &quick())
        .await
        .unwrap();

    // The second build's unit update rolls out to both instances first, so
    // provisioning finds the unit busy until that operation settles.
    let second = h.submit();
    let aggregated = h
        .ctx
        .run_build(&build_ref("dev", &second), &h.artifact(), &quick())
        .await
        .unwrap();
    assert_eq!(aggregated.build_status, BuildStatus::Success);
    assert_eq!(h.build_status("dev", &second), BuildStatus::Success);
}
