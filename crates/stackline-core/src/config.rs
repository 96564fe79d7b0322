//! stackline.toml configuration parser.
//!
//! Every section and field is optional; a missing file yields the defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_INITIAL_ENVIRONMENT;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StacklineConfig {
    pub store: StoreConfig,
    pub lock: LockConfig,
    pub rollout: RolloutConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb database file.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/stackline/stackline.redb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease length stamped on every acquired lock.
    pub lease_hours: u64,
    /// Acquire attempts before the AcquireLock step fails hard.
    pub max_acquire_attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_hours: 4,
            max_acquire_attempts: 10,
        }
    }
}

impl LockConfig {
    pub fn lease_secs(&self) -> u64 {
        self.lease_hours.saturating_mul(60 * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Per-target status checks in flight during one poll.
    pub poll_parallelism: usize,
    /// Where promotion chains start when a repository configures none.
    pub default_initial_environment: String,
    /// Parameter forced to the real target environment on every unit.
    pub environment_parameter: String,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            poll_parallelism: 8,
            default_initial_environment: DEFAULT_INITIAL_ENVIRONMENT.to_string(),
            environment_parameter: "Environment".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Identifier of the deployment workflow in the external engine.
    pub state_machine: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            state_machine: "stackline-deploy".to_string(),
        }
    }
}

impl StacklineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StacklineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
