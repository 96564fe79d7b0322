//! Record types persisted by the Stackline ledgers.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use stackline_core::{BuildStatus, DeploymentStatus, Target};

/// Separator joining composite key parts.
pub const KEY_SEPARATOR: char = '|';

/// Upper bound on diagnostic events kept per deployment record.
pub const MAX_DIAGNOSTIC_EVENTS: usize = 5;

pub(crate) fn composite_key(parts: &[&str]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part);
    }
    key
}

// ── Locks ──────────────────────────────────────────────────────────

/// Exclusive deployment lock for one (environment, repository).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    pub environment: String,
    pub repository: String,
    /// Build currently holding the lock.
    pub build_id: String,
    /// Workflow execution that acquired the lock.
    pub execution_handle: String,
    /// Unix timestamp (seconds) of acquisition.
    pub acquired_at: u64,
    /// Unix timestamp (seconds) after which the lock is abandoned.
    pub expires_at: u64,
}

impl LockRecord {
    pub fn lock_id(environment: &str, repository: &str) -> String {
        composite_key(&[environment, repository])
    }

    pub fn table_key(&self) -> String {
        Self::lock_id(&self.environment, &self.repository)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct LockAcquisition {
    /// The lock as stored after the attempt (ours or the current holder's).
    pub record: LockRecord,
    pub acquired: bool,
}

// ── Builds ─────────────────────────────────────────────────────────

/// Identifies one build of a repository in an environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BuildKey {
    pub repository: String,
    pub environment: String,
    pub build_id: String,
}

impl BuildKey {
    pub fn new(
        repository: impl Into<String>,
        environment: impl Into<String>,
        build_id: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            environment: environment.into(),
            build_id: build_id.into(),
        }
    }

    pub fn table_key(&self) -> String {
        composite_key(&[&self.repository, &self.environment, &self.build_id])
    }

    pub fn latest_key(&self) -> String {
        composite_key(&[&self.environment, &self.repository])
    }
}

/// Metadata supplied when a build is submitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewBuild {
    pub repository: String,
    pub environment: String,
    pub branch: String,
    pub version: String,
    pub commit: String,
    /// Where the built artifact lives (directory, bucket prefix, ...).
    pub artifact_location: String,
}

/// Canonical record of a build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildRecord {
    pub build_id: String,
    pub repository: String,
    pub environment: String,
    pub status: BuildStatus,
    pub branch: String,
    pub version: String,
    pub commit: String,
    pub artifact_location: String,
    pub execution_handle: Option<String>,
    pub error_message: Option<String>,
    /// Set when some, but not all, targets failed.
    #[serde(default)]
    pub partial_success: bool,
    /// Keys (`account/region`) of the targets that failed.
    #[serde(default)]
    pub failed_targets: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub finished_at: Option<u64>,
}

impl BuildRecord {
    pub fn key(&self) -> BuildKey {
        BuildKey::new(&self.repository, &self.environment, &self.build_id)
    }
}

/// Denormalized "newest build" pointer for a repository in an environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatestEntry {
    pub repository: String,
    pub environment: String,
    pub build_id: String,
    pub status: BuildStatus,
    pub version: String,
    pub updated_at: u64,
}

/// A status change applied to a build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildTransition {
    pub status: BuildStatus,
    pub error_message: Option<String>,
    pub partial_success: bool,
    pub failed_targets: Vec<String>,
}

impl BuildTransition {
    pub fn to(status: BuildStatus) -> Self {
        Self {
            status,
            error_message: None,
            partial_success: false,
            failed_targets: Vec::new(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_failed_targets(mut self, partial_success: bool, failed: Vec<String>) -> Self {
        self.partial_success = partial_success;
        self.failed_targets = failed;
        self
    }
}

// ── Deployments ────────────────────────────────────────────────────

/// Status of one (environment, repository, account, region) target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub environment: String,
    pub repository: String,
    pub account_id: String,
    pub region: String,
    pub build_id: String,
    pub status: DeploymentStatus,
    /// Deployment unit this target belongs to.
    pub unit_id: Option<String>,
    /// Provider operation that last touched this target.
    pub operation_id: Option<String>,
    /// Provider identifier of the instance materialized in this target.
    pub stack_id: Option<String>,
    pub status_reason: Option<String>,
    pub error_message: Option<String>,
    /// Most recent failure diagnostics, newest first.
    #[serde(default)]
    pub events: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub finished_at: Option<u64>,
}

impl DeploymentRecord {
    pub fn deployment_key(environment: &str, repository: &str, target: &Target) -> String {
        composite_key(&[environment, repository, &target.account_id, &target.region])
    }

    pub fn table_key(&self) -> String {
        Self::deployment_key(&self.environment, &self.repository, &self.target())
    }

    pub fn target(&self) -> Target {
        Target::new(&self.account_id, &self.region)
    }
}

/// Changes applied to a deployment record by the status poller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentUpdate {
    pub status: Option<DeploymentStatus>,
    pub unit_id: Option<String>,
    pub operation_id: Option<String>,
    pub stack_id: Option<String>,
    pub status_reason: Option<String>,
    pub error_message: Option<String>,
    pub events: Option<Vec<String>>,
}

impl DeploymentUpdate {
    pub fn status(status: DeploymentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

// ── Target configuration ───────────────────────────────────────────

/// A set of accounts crossed with a set of regions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TargetGroup {
    pub accounts: Vec<String>,
    pub regions: Vec<String>,
}

/// Where a repository (or the default) deploys in one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    /// Repository name, or `default` for the fallback configuration.
    pub repository: String,
    pub environment: String,
    pub groups: Vec<TargetGroup>,
    /// Downstream environments; the first entry continues the promotion chain.
    #[serde(default)]
    pub next_environments: Vec<String>,
    /// Environment the promotion chain starts from.
    #[serde(default)]
    pub initial_environment: Option<String>,
    #[serde(default)]
    pub updated_at: u64,
}

impl TargetConfig {
    pub fn config_key(repository: &str, environment: &str) -> String {
        composite_key(&[repository, environment])
    }

    pub fn table_key(&self) -> String {
        Self::config_key(&self.repository, &self.environment)
    }
}
