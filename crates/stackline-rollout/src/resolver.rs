//! Target resolution: which (account, region) pairs an environment deploys to,
//! and the order environments are promoted in.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use stackline_core::{DEFAULT_CONFIG_KEY, Target};
use stackline_state::{StateStore, TargetConfig, TargetGroup};
use tracing::{debug, warn};

use crate::error::{RolloutError, RolloutResult, require};

/// One environment of a promotion chain with its resolved targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionStep {
    pub environment: String,
    pub targets: Vec<Target>,
}

/// Resolves target configuration stored in the ledger.
#[derive(Clone)]
pub struct TargetResolver {
    store: StateStore,
    default_initial_environment: String,
}

impl TargetResolver {
    pub fn new(store: StateStore, default_initial_environment: impl Into<String>) -> Self {
        Self {
            store,
            default_initial_environment: default_initial_environment.into(),
        }
    }

    /// The configuration governing `repository` in `environment`: its own
    /// if it has one, otherwise the default configuration.
    pub fn config_for(&self, repository: &str, environment: &str) -> RolloutResult<TargetConfig> {
        require(&[("repository", repository), ("environment", environment)])?;
        if let Some(config) = self.store.get_target_config(repository, environment)? {
            return Ok(config);
        }
        if let Some(config) = self.store.get_target_config(DEFAULT_CONFIG_KEY, environment)? {
            debug!(repo = %repository, env = %environment, "using default target config");
            return Ok(config);
        }
        Err(RolloutError::NoTargets {
            repository: repository.to_string(),
            environment: environment.to_string(),
        })
    }

    /// Resolve and expand the targets for one environment.
    pub fn resolve(&self, repository: &str, environment: &str) -> RolloutResult<Vec<Target>> {
        let config = self.config_for(repository, environment)?;
        let targets = expand(&config.groups);
        if targets.is_empty() {
            return Err(RolloutError::NoTargets {
                repository: repository.to_string(),
                environment: environment.to_string(),
            });
        }
        Ok(targets)
    }

    /// Where the promotion chain of `repository` starts.
    pub fn initial_environment(&self, repository: &str) -> RolloutResult<String> {
        require(&[("repository", repository)])?;
        for owner in [repository, DEFAULT_CONFIG_KEY] {
            let configured = self
                .store
                .list_target_configs(owner)?
                .into_iter()
                .find_map(|c| c.initial_environment.filter(|env| !env.trim().is_empty()));
            if let Some(env) = configured {
                return Ok(env);
            }
        }
        Ok(self.default_initial_environment.clone())
    }

    /// Follow the first downstream link of each environment, starting at the
    /// initial environment. Stops at the end of the chain or when an
    /// environment repeats.
    pub fn walk_promotion_chain(&self, repository: &str) -> RolloutResult<Vec<PromotionStep>> {
        let mut steps = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(self.initial_environment(repository)?);

        while let Some(environment) = current.take() {
            if !visited.insert(environment.clone()) {
                warn!(repo = %repository, env = %environment, "promotion chain revisits environment, stopping");
                break;
            }
            let config = self.config_for(repository, &environment)?;
            current = config.next_environments.first().cloned();
            steps.push(PromotionStep {
                environment,
                targets: expand(&config.groups),
            });
        }
        Ok(steps)
    }

    /// The chain of environments up to and including the first repeated
    /// one, or `None` when the chain terminates.
    pub fn find_cycle(&self, repository: &str) -> RolloutResult<Option<Vec<String>>> {
        let mut path: Vec<String> = Vec::new();
        let mut current = Some(self.initial_environment(repository)?);

        while let Some(environment) = current.take() {
            if path.contains(&environment) {
                path.push(environment);
                return Ok(Some(path));
            }
            let next = match self.config_for(repository, &environment) {
                Ok(config) => config.next_environments.first().cloned(),
                Err(RolloutError::NoTargets { .. }) => None,
                Err(e) => return Err(e),
            };
            path.push(environment);
            current = next;
        }
        Ok(None)
    }
}

/// Union of accounts × regions across groups, deduplicated and sorted.
pub fn expand(groups: &[TargetGroup]) -> Vec<Target> {
    let mut targets = BTreeSet::new();
    for group in groups {
        for account in group.accounts.iter().filter(|a| !a.trim().is_empty()) {
            for region in group.regions.iter().filter(|r| !r.trim().is_empty()) {
                targets.insert(Target::new(account.trim(), region.trim()));
            }
        }
    }
    targets.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(accounts: &[&str], regions: &[&str]) -> TargetGroup {
        TargetGroup {
            accounts: accounts.iter().map(|s| s.to_string()).collect(),
            regions: regions.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn config(repo: &str, env: &str, next: &[&str]) -> TargetConfig {
        TargetConfig {
            repository: repo.to_string(),
            environment: env.to_string(),
            groups: vec![group(&["111111111111"], &["us-east-1"])],
            next_environments: next.iter().map(|s| s.to_string()).collect(),
            initial_environment: None,
            updated_at: 0,
        }
    }

    fn resolver() -> (StateStore, TargetResolver) {
        let store = StateStore::open_in_memory().unwrap();
        let resolver = TargetResolver::new(store.clone(), "dev");
        (store, resolver)
    }

    #[test]
    fn expand_crosses_accounts_and_regions() {
        let targets = expand(&[group(&["A", "B"], &["R1", "R2"])]);
        assert_eq!(targets.len(), 4);
        assert_eq!(targets[0], Target::new("A", "R1"));
        assert_eq!(targets[3], Target::new("B", "R2"));
    }

    #[test]
    fn expand_collapses_duplicates_across_groups() {
        let targets = expand(&[group(&["A"], &["R1", "R2"]), group(&["A", "B"], &["R1"])]);
        assert_eq!(
            targets,
            vec![Target::new("A", "R1"), Target::new("A", "R2"), Target::new("B", "R1")]
        );
    }

    #[test]
    fn resolve_prefers_repository_config() {
        let (store, resolver) = resolver();
        let mut own = config("infra", "dev", &[]);
        own.groups = vec![group(&["222222222222"], &["eu-west-1"])];
        store.put_target_config(&own).unwrap();
        store.put_target_config(&config(DEFAULT_CONFIG_KEY, "dev", &[])).unwrap();

        let targets = resolver.resolve("infra", "dev").unwrap();
        assert_eq!(targets, vec![Target::new("222222222222", "eu-west-1")]);
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let (store, resolver) = resolver();
        store.put_target_config(&config(DEFAULT_CONFIG_KEY, "dev", &[])).unwrap();
        let targets = resolver.resolve("payments", "dev").unwrap();
        assert_eq!(targets, vec![Target::new("111111111111", "us-east-1")]);
    }

    #[test]
    fn resolve_without_config_fails() {
        let (_store, resolver) = resolver();
        let err = resolver.resolve("infra", "prd").unwrap_err();
        assert!(matches!(err, RolloutError::NoTargets { .. }));
    }

    #[test]
    fn chain_follows_first_downstream() {
        let (store, resolver) = resolver();
        store.put_target_config(&config("infra", "dev", &["stg", "qa"])).unwrap();
        store.put_target_config(&config("infra", "stg", &["prd"])).unwrap();
        store.put_target_config(&config("infra", "qa", &[])).unwrap();
        store.put_target_config(&config("infra", "prd", &[])).unwrap();

        let steps = resolver.walk_promotion_chain("infra").unwrap();
        let envs: Vec<&str> = steps.iter().map(|s| s.environment.as_str()).collect();
        assert_eq!(envs, vec!["dev", "stg", "prd"]);
        assert_eq!(resolver.find_cycle("infra").unwrap(), None);
    }

    #[test]
    fn cyclic_chain_terminates() {
        let (store, resolver) = resolver();
        store.put_target_config(&config("infra", "dev", &["stg"])).unwrap();
        store.put_target_config(&config("infra", "stg", &["dev"])).unwrap();

        let steps = resolver.walk_promotion_chain("infra").unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(
            resolver.find_cycle("infra").unwrap(),
            Some(vec!["dev".to_string(), "stg".to_string(), "dev".to_string()])
        );
    }

    #[test]
    fn configured_initial_environment() {
        let (store, resolver) = resolver();
        let mut sandbox = config("infra", "sbx", &["dev"]);
        sandbox.initial_environment = Some("sbx".to_string());
        store.put_target_config(&sandbox).unwrap();
        store.put_target_config(&config("infra", "dev", &[])).unwrap();

        assert_eq!(resolver.initial_environment("infra").unwrap(), "sbx");
        assert_eq!(resolver.initial_environment("other").unwrap(), "dev");
        assert_eq!(resolver.walk_promotion_chain("infra").unwrap().len(), 2);
    }

    #[test]
    fn chain_into_unconfigured_environment_fails() {
        let (store, resolver) = resolver();
        store.put_target_config(&config("infra", "dev", &["stg"])).unwrap();
        let err = resolver.walk_promotion_chain("infra").unwrap_err();
        assert!(matches!(err, RolloutError::NoTargets { ref environment, .. } if environment == "stg"));
    }
}
