//! Target configuration storage.
//!
//! Operators write one [`TargetConfig`] per (repository, environment); the
//! `default` repository key holds the fallback used when a repository has
//! no configuration of its own.

use stackline_core::unix_now;
use tracing::debug;

use crate::error::StateResult;
use crate::store::{StateStore, validate_parts};
use crate::tables::TARGETS;
use crate::types::TargetConfig;

impl StateStore {
    /// Insert or replace a target configuration.
    pub fn put_target_config(&self, config: &TargetConfig) -> StateResult<()> {
        validate_parts(&[
            ("repository", config.repository.as_str()),
            ("environment", config.environment.as_str()),
        ])?;
        let mut stored = config.clone();
        stored.updated_at = unix_now();
        let key = stored.table_key();
        self.write_json(TARGETS, &key, &stored)?;
        debug!(%key, groups = stored.groups.len(), "target config stored");
        Ok(())
    }

    /// Get the configuration stored under exactly `(repository, environment)`.
    pub fn get_target_config(
        &self,
        repository: &str,
        environment: &str,
    ) -> StateResult<Option<TargetConfig>> {
        validate_parts(&[("repository", repository), ("environment", environment)])?;
        self.read_json(TARGETS, &TargetConfig::config_key(repository, environment))
    }

    /// All environments configured for `repository`.
    pub fn list_target_configs(&self, repository: &str) -> StateResult<Vec<TargetConfig>> {
        validate_parts(&[("repository", repository)])?;
        self.scan_json(TARGETS, &format!("{repository}|"))
    }

    /// Delete a configuration. Returns true if it existed.
    pub fn delete_target_config(&self, repository: &str, environment: &str) -> StateResult<bool> {
        validate_parts(&[("repository", repository), ("environment", environment)])?;
        self.remove_key(TARGETS, &TargetConfig::config_key(repository, environment))
    }
}
