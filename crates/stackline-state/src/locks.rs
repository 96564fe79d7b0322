//! Lock manager: exclusive per-(environment, repository) deployment lock.
//!
//! Acquisition is a single conditional write: the holder check and the
//! insert share one write transaction. Losing the race is a normal result
//! (`acquired = false`), not an error.

use redb::{ReadableDatabase, ReadableTable};
use stackline_core::unix_now;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, decode, encode, validate_parts};
use crate::tables::LOCKS;
use crate::types::{LockAcquisition, LockRecord};

impl StateStore {
    /// Acquire the lock for `(environment, repository)` on behalf of `build_id`.
    pub fn acquire_lock(
        &self,
        environment: &str,
        repository: &str,
        build_id: &str,
        execution_handle: &str,
        lease_secs: u64,
    ) -> StateResult<LockAcquisition> {
        self.acquire_lock_at(
            environment,
            repository,
            build_id,
            execution_handle,
            lease_secs,
            unix_now(),
        )
    }

    /// Acquire with an explicit clock, see [`StateStore::acquire_lock`].
    ///
    /// Succeeds when no lock exists, the existing lock has expired, or the
    /// existing holder is `build_id` (a retry of the same build). A lock held
    /// by another build is left untouched.
    pub fn acquire_lock_at(
        &self,
        environment: &str,
        repository: &str,
        build_id: &str,
        execution_handle: &str,
        lease_secs: u64,
        now: u64,
    ) -> StateResult<LockAcquisition> {
        validate_parts(&[
            ("environment", environment),
            ("repository", repository),
            ("build_id", build_id),
        ])?;
        let key = LockRecord::lock_id(environment, repository);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing: Option<LockRecord> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };

            match existing {
                Some(current) if current.build_id != build_id && !current.is_expired(now) => {
                    debug!(
                        lock = %key,
                        holder = %current.build_id,
                        requested = %build_id,
                        "lock held by another build"
                    );
                    outcome = LockAcquisition {
                        record: current,
                        acquired: false,
                    };
                }
                previous => {
                    if let Some(stale) = previous.as_ref().filter(|p| p.build_id != build_id) {
                        warn!(
                            lock = %key,
                            holder = %stale.build_id,
                            expired_at = stale.expires_at,
                            "taking over expired lock"
                        );
                    }
                    let record = LockRecord {
                        environment: environment.to_string(),
                        repository: repository.to_string(),
                        build_id: build_id.to_string(),
                        execution_handle: execution_handle.to_string(),
                        acquired_at: now,
                        expires_at: now.saturating_add(lease_secs),
                    };
                    let bytes = encode(&record)?;
                    table
                        .insert(key.as_str(), bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    outcome = LockAcquisition {
                        record,
                        acquired: true,
                    };
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if outcome.acquired {
            info!(lock = %key, build = %build_id, expires_at = outcome.record.expires_at, "lock acquired");
        }
        Ok(outcome)
    }

    /// Release the lock if `build_id` holds it.
    ///
    /// Returns `Ok(true)` when the lock was deleted and `Ok(false)` when no
    /// lock existed. A lock held by another build fails with
    /// [`StateError::NotHolder`] and stays in place.
    pub fn release_lock(
        &self,
        environment: &str,
        repository: &str,
        build_id: &str,
    ) -> StateResult<bool> {
        validate_parts(&[
            ("environment", environment),
            ("repository", repository),
            ("build_id", build_id),
        ])?;
        let key = LockRecord::lock_id(environment, repository);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let existing: Option<LockRecord> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };

            match existing {
                None => released = false,
                Some(current) if current.build_id != build_id => {
                    return Err(StateError::NotHolder {
                        lock: key,
                        holder: current.build_id,
                        requested: build_id.to_string(),
                    });
                }
                Some(_) => {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    released = true;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if released {
            info!(lock = %key, build = %build_id, "lock released");
        } else {
            debug!(lock = %key, build = %build_id, "release of absent lock");
        }
        Ok(released)
    }

    /// Remove a lock regardless of holder (stuck-lock recovery).
    pub fn delete_lock(&self, environment: &str, repository: &str) -> StateResult<bool> {
        validate_parts(&[("environment", environment), ("repository", repository)])?;
        let key = LockRecord::lock_id(environment, repository);
        let existed = self.remove_key(LOCKS, &key)?;
        warn!(lock = %key, existed, "lock force-deleted");
        Ok(existed)
    }

    /// Get the lock for `(environment, repository)`, expired or not.
    pub fn get_lock(&self, environment: &str, repository: &str) -> StateResult<Option<LockRecord>> {
        validate_parts(&[("environment", environment), ("repository", repository)])?;
        self.read_json(LOCKS, &LockRecord::lock_id(environment, repository))
    }

    /// List all locks.
    pub fn list_locks(&self) -> StateResult<Vec<LockRecord>> {
        self.scan_json(LOCKS, "")
    }

    /// Delete every lock whose lease ended before `now`. Returns number deleted.
    pub fn purge_expired_locks(&self, now: u64) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let record: LockRecord = decode(value.value())?;
                if record.is_expired(now) {
                    expired.push(key.value().to_string());
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            count = expired.len() as u32;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            info!(count, "expired locks purged");
        }
        Ok(count)
    }
}
