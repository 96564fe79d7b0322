use serde_json::json;
use stackline_state::{BuildKey, NewBuild, StateStore};
use stackline_tasks::contracts::BuildRef;
use stackline_tasks::{RunSettings, TaskContext};
use tracing::info;

use super::print_json;

pub struct Submission {
    pub repo: String,
    pub env: String,
    pub artifact: String,
    pub branch: String,
    pub version: String,
    pub commit: String,
}

pub async fn submit(ctx: &TaskContext, submission: Submission, run: bool) -> anyhow::Result<()> {
    let build = ctx.store().create_build(&NewBuild {
        repository: submission.repo,
        environment: submission.env,
        branch: submission.branch,
        version: submission.version,
        commit: submission.commit,
        artifact_location: submission.artifact,
    })?;
    info!(repo = %build.repository, env = %build.environment, build = %build.build_id, "build submitted");

    if !run {
        return print_json(&build);
    }
    let build_ref = BuildRef {
        env: build.environment.clone(),
        repo: build.repository.clone(),
        build_id: build.build_id.clone(),
    };
    let result = ctx
        .run_build(&build_ref, &build.artifact_location, &RunSettings::default())
        .await;
    match result {
        Ok(aggregated) => print_json(&aggregated),
        Err(e) => {
            print_json(&e.to_output())?;
            anyhow::bail!("deployment of build {} failed: {e}", build.build_id)
        }
    }
}

pub fn latest(store: &StateStore, env: &str) -> anyhow::Result<()> {
    print_json(&store.query_latest(env)?)
}

pub fn show(
    store: &StateStore,
    repo: &str,
    env: &str,
    build_id: Option<&str>,
) -> anyhow::Result<()> {
    let Some(build_id) = build_id else {
        return print_json(&store.list_builds(repo, env)?);
    };
    let key = BuildKey::new(repo, env, build_id);
    let Some(build) = store.get_build(&key)? else {
        anyhow::bail!("build {build_id} of {repo} in {env} not found");
    };
    let deployments = store.query_deployments_by_build(env, repo, build_id)?;
    print_json(&json!({ "build": build, "deployments": deployments }))
}
