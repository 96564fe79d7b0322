//! Build ledger: canonical build records plus the latest-build index.
//!
//! Every status transition writes the build record and its `LATEST` entry
//! in one write transaction, so "newest build per repository" queries read
//! a single partition instead of scanning every build.

use redb::ReadableTable;
use stackline_core::{BuildStatus, unix_now};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, decode, encode, validate_parts};
use crate::tables::{BUILDS, LATEST};
use crate::types::{BuildKey, BuildRecord, BuildTransition, LatestEntry, NewBuild, composite_key};

fn validate_key(key: &BuildKey) -> StateResult<()> {
    validate_parts(&[
        ("repository", key.repository.as_str()),
        ("environment", key.environment.as_str()),
        ("build_id", key.build_id.as_str()),
    ])
}

fn latest_entry(build: &BuildRecord) -> LatestEntry {
    LatestEntry {
        repository: build.repository.clone(),
        environment: build.environment.clone(),
        build_id: build.build_id.clone(),
        status: build.status,
        version: build.version.clone(),
        updated_at: build.updated_at,
    }
}

impl StateStore {
    /// Submit a build as PENDING under a fresh time-ordered identifier.
    pub fn create_build(&self, new: &NewBuild) -> StateResult<BuildRecord> {
        self.create_build_with_id(new, &Uuid::now_v7().to_string())
    }

    /// Submit a build under a caller-chosen identifier.
    ///
    /// Re-submitting an existing identifier returns the stored record
    /// unchanged.
    pub fn create_build_with_id(&self, new: &NewBuild, build_id: &str) -> StateResult<BuildRecord> {
        let key = BuildKey::new(&new.repository, &new.environment, build_id);
        validate_key(&key)?;
        let now = unix_now();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record;
        {
            let mut builds = txn.open_table(BUILDS).map_err(map_err!(Table))?;
            let table_key = key.table_key();
            let existing: Option<BuildRecord> = match builds.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            if let Some(existing) = existing {
                debug!(build = %build_id, "build already submitted");
                return Ok(existing);
            }

            record = BuildRecord {
                build_id: build_id.to_string(),
                repository: new.repository.clone(),
                environment: new.environment.clone(),
                status: BuildStatus::Pending,
                branch: new.branch.clone(),
                version: new.version.clone(),
                commit: new.commit.clone(),
                artifact_location: new.artifact_location.clone(),
                execution_handle: None,
                error_message: None,
                partial_success: false,
                failed_targets: Vec::new(),
                created_at: now,
                updated_at: now,
                finished_at: None,
            };
            let bytes = encode(&record)?;
            builds
                .insert(table_key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;

            let mut latest = txn.open_table(LATEST).map_err(map_err!(Table))?;
            upsert_latest(&mut latest, &record)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            repo = %record.repository,
            env = %record.environment,
            build = %record.build_id,
            "build submitted"
        );
        Ok(record)
    }

    /// Get a build by key.
    pub fn get_build(&self, key: &BuildKey) -> StateResult<Option<BuildRecord>> {
        validate_key(key)?;
        self.read_json(BUILDS, &key.table_key())
    }

    /// List builds of a repository in an environment, newest first.
    pub fn list_builds(&self, repository: &str, environment: &str) -> StateResult<Vec<BuildRecord>> {
        validate_parts(&[("repository", repository), ("environment", environment)])?;
        let prefix = format!("{}|", composite_key(&[repository, environment]));
        let mut builds: Vec<BuildRecord> = self.scan_json(BUILDS, &prefix)?;
        // v7 identifiers sort by creation time.
        builds.sort_by(|a, b| b.build_id.cmp(&a.build_id));
        Ok(builds)
    }

    /// Transition a build's status and mirror it into the latest index.
    ///
    /// `finished_at` is stamped only for SUCCESS/FAILED.
    pub fn update_build_status(
        &self,
        key: &BuildKey,
        transition: &BuildTransition,
    ) -> StateResult<BuildRecord> {
        validate_key(key)?;
        self.mutate_build(key, |build, now| {
            build.status = transition.status;
            if transition.error_message.is_some() {
                build.error_message = transition.error_message.clone();
            }
            build.partial_success = transition.partial_success;
            build.failed_targets = transition.failed_targets.clone();
            if transition.status.is_terminal() {
                build.finished_at = Some(now);
            }
            Ok(())
        })
    }

    /// Mark a PENDING build IN_PROGRESS and record its execution handle.
    ///
    /// Repeating the call for a build already IN_PROGRESS rewrites the
    /// handle; a finished build is rejected.
    pub fn start_build_execution(
        &self,
        key: &BuildKey,
        execution_handle: &str,
    ) -> StateResult<BuildRecord> {
        validate_key(key)?;
        self.mutate_build(key, |build, _| {
            if build.status.is_terminal() {
                return Err(StateError::InvalidTransition {
                    build: build.build_id.clone(),
                    from: build.status.to_string(),
                    to: BuildStatus::InProgress.to_string(),
                });
            }
            build.status = BuildStatus::InProgress;
            build.execution_handle = Some(execution_handle.to_string());
            Ok(())
        })
    }

    /// Latest build per repository in `environment`.
    ///
    /// Reads the index partition and re-fetches each referenced record;
    /// index entries whose build has been deleted are skipped.
    pub fn query_latest(&self, environment: &str) -> StateResult<Vec<BuildRecord>> {
        validate_parts(&[("environment", environment)])?;
        let prefix = format!("{environment}|");
        let entries: Vec<LatestEntry> = self.scan_json(LATEST, &prefix)?;
        let mut builds = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = BuildKey::new(&entry.repository, &entry.environment, &entry.build_id);
            match self.read_json::<BuildRecord>(BUILDS, &key.table_key())? {
                Some(build) => builds.push(build),
                None => debug!(build = %entry.build_id, "latest entry points at missing build"),
            }
        }
        Ok(builds)
    }

    /// Raw latest-index entry for one repository.
    pub fn get_latest_entry(
        &self,
        environment: &str,
        repository: &str,
    ) -> StateResult<Option<LatestEntry>> {
        validate_parts(&[("environment", environment), ("repository", repository)])?;
        self.read_json(LATEST, &composite_key(&[environment, repository]))
    }

    /// Delete a build, and its latest entry when that entry points at it.
    pub fn delete_build(&self, key: &BuildKey) -> StateResult<bool> {
        validate_key(key)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut builds = txn.open_table(BUILDS).map_err(map_err!(Table))?;
            existed = builds
                .remove(key.table_key().as_str())
                .map_err(map_err!(Write))?
                .is_some();

            let mut latest = txn.open_table(LATEST).map_err(map_err!(Table))?;
            let latest_key = key.latest_key();
            let points_here = match latest.get(latest_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode::<LatestEntry>(guard.value())?.build_id == key.build_id,
                None => false,
            };
            if points_here {
                latest.remove(latest_key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(build = %key.build_id, existed, "build deleted");
        Ok(existed)
    }

    /// Read-modify-write a build and its latest entry in one transaction.
    fn mutate_build<F>(&self, key: &BuildKey, apply: F) -> StateResult<BuildRecord>
    where
        F: FnOnce(&mut BuildRecord, u64) -> StateResult<()>,
    {
        let now = unix_now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut build: BuildRecord;
        {
            let mut builds = txn.open_table(BUILDS).map_err(map_err!(Table))?;
            let table_key = key.table_key();
            build = match builds.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("build {table_key}"))),
            };

            apply(&mut build, now)?;
            build.updated_at = now;

            let bytes = encode(&build)?;
            builds
                .insert(table_key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;

            let mut latest = txn.open_table(LATEST).map_err(map_err!(Table))?;
            upsert_latest(&mut latest, &build)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            repo = %build.repository,
            env = %build.environment,
            build = %build.build_id,
            status = %build.status,
            "build status updated"
        );
        Ok(build)
    }
}

/// Point the latest entry at `build` unless a newer build already owns it.
fn upsert_latest(
    latest: &mut redb::Table<'_, &'static str, &'static [u8]>,
    build: &BuildRecord,
) -> StateResult<()> {
    let latest_key = composite_key(&[&build.environment, &build.repository]);
    let newer_exists = match latest.get(latest_key.as_str()).map_err(map_err!(Read))? {
        Some(guard) => decode::<LatestEntry>(guard.value())?.build_id > build.build_id,
        None => false,
    };
    if newer_exists {
        debug!(build = %build.build_id, "latest index already points at a newer build");
        return Ok(());
    }
    let bytes = encode(&latest_entry(build))?;
    latest
        .insert(latest_key.as_str(), bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn new_build(repo: &str, env: &str) -> NewBuild {
        NewBuild {
            repository: repo.to_string(),
            environment: env.to_string(),
            branch: "main".to_string(),
            version: "1.2.3".to_string(),
            commit: "abc123".to_string(),
            artifact_location: "/artifacts/infra/1.2.3".to_string(),
        }
    }

    #[test]
    fn create_seeds_pending_build_and_latest_entry() {
        let store = store();
        let build = store.create_build(&new_build("infra", "dev")).unwrap();

        assert_eq!(build.status, BuildStatus::Pending);
        assert!(build.finished_at.is_none());
        let latest = store.get_latest_entry("dev", "infra").unwrap().unwrap();
        assert_eq!(latest.build_id, build.build_id);
        assert_eq!(latest.status, BuildStatus::Pending);
    }

    #[test]
    fn create_with_same_id_is_idempotent() {
        let store = store();
        let first = store.create_build_with_id(&new_build("infra", "dev"), "b1").unwrap();
        store
            .update_build_status(&first.key(), &BuildTransition::to(BuildStatus::InProgress))
            .unwrap();
        let again = store.create_build_with_id(&new_build("infra", "dev"), "b1").unwrap();
        assert_eq!(again.status, BuildStatus::InProgress);
    }

    #[test]
    fn terminal_update_stamps_finished_and_latest() {
        let store = store();
        let build = store.create_build(&new_build("infra", "dev")).unwrap();

        let updated = store
            .update_build_status(
                &build.key(),
                &BuildTransition::to(BuildStatus::Failed).with_error("stack rollback"),
            )
            .unwrap();

        assert_eq!(updated.status, BuildStatus::Failed);
        assert!(updated.finished_at.is_some());
        assert_eq!(updated.error_message.as_deref(), Some("stack rollback"));
        let latest = store.get_latest_entry("dev", "infra").unwrap().unwrap();
        assert_eq!(latest.status, BuildStatus::Failed);
    }

    #[test]
    fn in_progress_never_sets_finished() {
        let store = store();
        let build = store.create_build(&new_build("infra", "dev")).unwrap();
        let updated = store
            .update_build_status(&build.key(), &BuildTransition::to(BuildStatus::InProgress))
            .unwrap();
        assert!(updated.finished_at.is_none());
        let latest = store.get_latest_entry("dev", "infra").unwrap().unwrap();
        assert_eq!(latest.status, BuildStatus::InProgress);
    }

    #[test]
    fn start_execution_records_handle() {
        let store = store();
        let build = store.create_build(&new_build("infra", "dev")).unwrap();
        let started = store.start_build_execution(&build.key(), "exec-arn-1").unwrap();

        assert_eq!(started.status, BuildStatus::InProgress);
        assert_eq!(started.execution_handle.as_deref(), Some("exec-arn-1"));
        let latest = store.get_latest_entry("dev", "infra").unwrap().unwrap();
        assert_eq!(latest.status, BuildStatus::InProgress);
    }

    #[test]
    fn start_execution_rejects_finished_build() {
        let store = store();
        let build = store.create_build(&new_build("infra", "dev")).unwrap();
        store
            .update_build_status(&build.key(), &BuildTransition::to(BuildStatus::Success))
            .unwrap();
        let err = store.start_build_execution(&build.key(), "exec").unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn update_of_missing_build_is_not_found() {
        let store = store();
        let err = store
            .update_build_status(
                &BuildKey::new("infra", "dev", "nope"),
                &BuildTransition::to(BuildStatus::Success),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn query_latest_returns_one_build_per_repository() {
        let store = store();
        store.create_build_with_id(&new_build("infra", "dev"), "0001").unwrap();
        store.create_build_with_id(&new_build("infra", "dev"), "0002").unwrap();
        store.create_build_with_id(&new_build("network", "dev"), "0003").unwrap();
        store.create_build_with_id(&new_build("infra", "prd"), "0004").unwrap();

        let mut latest = store.query_latest("dev").unwrap();
        latest.sort_by(|a, b| a.repository.cmp(&b.repository));
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].build_id, "0002");
        assert_eq!(latest[1].build_id, "0003");
    }

    #[test]
    fn query_latest_stays_inside_its_environment() {
        let store = store();
        store.create_build_with_id(&new_build("infra", "dev"), "0001").unwrap();
        store.create_build_with_id(&new_build("infra", "prd"), "0002").unwrap();
        store.create_build_with_id(&new_build("infra", "prd-eu"), "0003").unwrap();
        store.create_build_with_id(&new_build("infra", "stg"), "0004").unwrap();

        let latest = store.query_latest("prd").unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].build_id, "0002");
    }

    #[test]
    fn older_build_does_not_steal_latest_entry() {
        let store = store();
        let old = store.create_build_with_id(&new_build("infra", "dev"), "0001").unwrap();
        store.create_build_with_id(&new_build("infra", "dev"), "0002").unwrap();

        store
            .update_build_status(&old.key(), &BuildTransition::to(BuildStatus::Failed))
            .unwrap();
        let latest = store.get_latest_entry("dev", "infra").unwrap().unwrap();
        assert_eq!(latest.build_id, "0002");
        assert_eq!(latest.status, BuildStatus::Pending);
    }

    #[test]
    fn list_builds_newest_first() {
        let store = store();
        store.create_build_with_id(&new_build("infra", "dev"), "0001").unwrap();
        store.create_build_with_id(&new_build("infra", "dev"), "0002").unwrap();
        store.create_build_with_id(&new_build("infra-extra", "dev"), "0003").unwrap();

        let builds = store.list_builds("infra", "dev").unwrap();
        let ids: Vec<_> = builds.iter().map(|b| b.build_id.as_str()).collect();
        assert_eq!(ids, vec!["0002", "0001"]);
    }

    #[test]
    fn delete_build_clears_latest_entry() {
        let store = store();
        let build = store.create_build(&new_build("infra", "dev")).unwrap();
        assert!(store.delete_build(&build.key()).unwrap());
        assert!(store.get_latest_entry("dev", "infra").unwrap().is_none());
        assert!(store.query_latest("dev").unwrap().is_empty());
    }
}
