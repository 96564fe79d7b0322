//! Deployment ledger: one status record per (environment, repository,
//! account, region) target.

use redb::ReadableTable;
use stackline_core::{DeploymentStatus, Target, unix_now};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, decode, encode, validate_parts};
use crate::tables::DEPLOYMENTS;
use crate::types::{
    DeploymentRecord, DeploymentUpdate, MAX_DIAGNOSTIC_EVENTS, composite_key,
};

fn validate_target(target: &Target) -> StateResult<()> {
    validate_parts(&[
        ("account_id", target.account_id.as_str()),
        ("region", target.region.as_str()),
    ])
}

impl StateStore {
    /// Seed one PENDING record per target for `build_id`.
    ///
    /// Records already owned by `build_id` are kept as they are, so a retried
    /// expansion never resets progress. Records left by an earlier build are
    /// replaced.
    pub fn create_deployments(
        &self,
        environment: &str,
        repository: &str,
        build_id: &str,
        targets: &[Target],
    ) -> StateResult<Vec<DeploymentRecord>> {
        validate_parts(&[
            ("environment", environment),
            ("repository", repository),
            ("build_id", build_id),
        ])?;
        for target in targets {
            validate_target(target)?;
        }
        let now = unix_now();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut records = Vec::with_capacity(targets.len());
        let mut seeded = 0usize;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            for target in targets {
                let key = DeploymentRecord::deployment_key(environment, repository, target);
                let existing: Option<DeploymentRecord> =
                    match table.get(key.as_str()).map_err(map_err!(Read))? {
                        Some(guard) => Some(decode(guard.value())?),
                        None => None,
                    };
                if let Some(existing) = existing.filter(|r| r.build_id == build_id) {
                    records.push(existing);
                    continue;
                }

                let record = DeploymentRecord {
                    environment: environment.to_string(),
                    repository: repository.to_string(),
                    account_id: target.account_id.clone(),
                    region: target.region.clone(),
                    build_id: build_id.to_string(),
                    status: DeploymentStatus::Pending,
                    unit_id: None,
                    operation_id: None,
                    stack_id: None,
                    status_reason: None,
                    error_message: None,
                    events: Vec::new(),
                    created_at: now,
                    updated_at: now,
                    finished_at: None,
                };
                let bytes = encode(&record)?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                seeded += 1;
                records.push(record);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            env = %environment,
            repo = %repository,
            build = %build_id,
            targets = targets.len(),
            seeded,
            "deployment records seeded"
        );
        Ok(records)
    }

    /// Apply a status update to one target's record.
    ///
    /// `finished_at` is stamped when the new status is terminal. A record that
    /// already reached a terminal status is returned unchanged. Events are
    /// capped at [`MAX_DIAGNOSTIC_EVENTS`].
    pub fn update_deployment_status(
        &self,
        environment: &str,
        repository: &str,
        target: &Target,
        update: &DeploymentUpdate,
    ) -> StateResult<DeploymentRecord> {
        validate_parts(&[("environment", environment), ("repository", repository)])?;
        validate_target(target)?;
        let key = DeploymentRecord::deployment_key(environment, repository, target);
        let now = unix_now();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut record: DeploymentRecord;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            record = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("deployment {key}"))),
            };

            if record.status.is_terminal() {
                debug!(deployment = %key, status = %record.status, "record already terminal");
                return Ok(record);
            }

            apply_update(&mut record, update, now);

            let bytes = encode(&record)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %key, status = %record.status, "deployment status updated");
        Ok(record)
    }

    /// Get the record for one target.
    pub fn get_deployment(
        &self,
        environment: &str,
        repository: &str,
        target: &Target,
    ) -> StateResult<Option<DeploymentRecord>> {
        validate_parts(&[("environment", environment), ("repository", repository)])?;
        validate_target(target)?;
        self.read_json(
            DEPLOYMENTS,
            &DeploymentRecord::deployment_key(environment, repository, target),
        )
    }

    /// All target records owned by `build_id`.
    pub fn query_deployments_by_build(
        &self,
        environment: &str,
        repository: &str,
        build_id: &str,
    ) -> StateResult<Vec<DeploymentRecord>> {
        validate_parts(&[
            ("environment", environment),
            ("repository", repository),
            ("build_id", build_id),
        ])?;
        let prefix = format!("{}|", composite_key(&[environment, repository]));
        let records: Vec<DeploymentRecord> = self.scan_json(DEPLOYMENTS, &prefix)?;
        Ok(records
            .into_iter()
            .filter(|r| r.build_id == build_id)
            .collect())
    }
}

fn apply_update(record: &mut DeploymentRecord, update: &DeploymentUpdate, now: u64) {
    if let Some(status) = update.status {
        record.status = status;
        if status.is_terminal() {
            record.finished_at = Some(now);
        }
    }
    if let Some(unit_id) = &update.unit_id {
        record.unit_id = Some(unit_id.clone());
    }
    if let Some(operation_id) = &update.operation_id {
        record.operation_id = Some(operation_id.clone());
    }
    if let Some(stack_id) = &update.stack_id {
        record.stack_id = Some(stack_id.clone());
    }
    if let Some(reason) = &update.status_reason {
        record.status_reason = Some(reason.clone());
    }
    if let Some(error) = &update.error_message {
        record.error_message = Some(error.clone());
    }
    if let Some(events) = &update.events {
        record.events = events.iter().take(MAX_DIAGNOSTIC_EVENTS).cloned().collect();
    }
    record.updated_at = now;
}
