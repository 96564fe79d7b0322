use std::path::Path;

use serde::Deserialize;
use stackline_state::TargetConfig;
use stackline_tasks::TaskContext;
use tracing::{info, warn};

use super::print_json;

/// A target configuration file: one `[[targets]]` table per
/// (repository, environment).
#[derive(Debug, Deserialize)]
pub struct TargetFile {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

pub fn parse_target_file(content: &str) -> anyhow::Result<TargetFile> {
    Ok(toml::from_str(content)?)
}

pub fn import(ctx: &TaskContext, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)?;
    let parsed = parse_target_file(&content)?;
    for config in &parsed.targets {
        ctx.store().put_target_config(config)?;
    }
    info!(file = ?file, imported = parsed.targets.len(), "target configuration imported");

    let mut repositories: Vec<&str> = parsed
        .targets
        .iter()
        .map(|c| c.repository.as_str())
        .collect();
    repositories.sort_unstable();
    repositories.dedup();
    for repo in repositories {
        if let Some(cycle) = ctx.resolver().find_cycle(repo)? {
            warn!(repo = %repo, chain = %cycle.join(" -> "), "promotion chain is cyclic");
        }
    }
    print_json(&serde_json::json!({ "imported": parsed.targets.len() }))
}

pub fn resolve(ctx: &TaskContext, repo: &str, env: &str) -> anyhow::Result<()> {
    let targets = ctx.resolver().resolve(repo, env)?;
    print_json(&targets)
}

pub fn chain(ctx: &TaskContext, repo: &str) -> anyhow::Result<()> {
    if let Some(cycle) = ctx.resolver().find_cycle(repo)? {
        warn!(repo = %repo, chain = %cycle.join(" -> "), "promotion chain is cyclic");
    }
    let steps = ctx.resolver().walk_promotion_chain(repo)?;
    print_json(&steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_target_tables() {
        let file = parse_target_file(
            r#"
[[targets]]
repository = "default"
environment = "dev"
next_environments = ["prd"]

[[targets.groups]]
accounts = ["111111111111", "222222222222"]
regions = ["us-east-1"]

[[targets]]
repository = "default"
environment = "prd"
initial_environment = "dev"

[[targets.groups]]
accounts = ["333333333333"]
regions = ["us-east-1", "eu-west-1"]
"#,
        )
        .unwrap();

        assert_eq!(file.targets.len(), 2);
        assert_eq!(file.targets[0].groups[0].accounts.len(), 2);
        assert_eq!(file.targets[0].next_environments, vec!["prd".to_string()]);
        assert_eq!(file.targets[1].initial_environment.as_deref(), Some("dev"));
    }
}
