//! redb table definitions for the Stackline ledgers.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Composite keys join their parts with `|`, so a key prefix selects a
//! partition for scans.

use redb::TableDefinition;

/// Deployment locks keyed by `{env}|{repo}`.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Build records keyed by `{repo}|{env}|{build_id}`.
pub const BUILDS: TableDefinition<&str, &[u8]> = TableDefinition::new("builds");

/// Latest-build index keyed by `{env}|{repo}`.
pub const LATEST: TableDefinition<&str, &[u8]> = TableDefinition::new("latest");

/// Deployment records keyed by `{env}|{repo}|{account}|{region}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Target configuration keyed by `{repo or default}|{env}`.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");
