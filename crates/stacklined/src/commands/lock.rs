use stackline_core::unix_now;
use stackline_state::StateStore;
use tracing::{info, warn};

use super::print_json;

pub fn list(store: &StateStore) -> anyhow::Result<()> {
    let locks = store.list_locks()?;
    let now = unix_now();
    for lock in locks.iter().filter(|l| l.is_expired(now)) {
        warn!(lock = %lock.table_key(), build = %lock.build_id, "lock lease expired");
    }
    print_json(&locks)
}

pub fn delete(store: &StateStore, env: &str, repo: &str) -> anyhow::Result<()> {
    let held = store.get_lock(env, repo)?;
    let removed = store.delete_lock(env, repo)?;
    if let Some(lock) = held.filter(|_| removed) {
        warn!(env = %env, repo = %repo, build = %lock.build_id, "lock force-deleted");
    }
    print_json(&serde_json::json!({ "deleted": removed }))
}

pub fn purge(store: &StateStore) -> anyhow::Result<()> {
    let purged = store.purge_expired_locks(unix_now())?;
    info!(purged, "expired locks purged");
    print_json(&serde_json::json!({ "purged": purged }))
}
