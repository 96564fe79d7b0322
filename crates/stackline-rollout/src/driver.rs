//! Deployment driver: creates or updates the deployment unit and provisions
//! its instances. Every operation is safe to re-invoke for the same build.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stackline_core::config::RolloutConfig;
use stackline_core::{Target, naming};
use stackline_state::StateStore;
use tracing::{debug, info, warn};

use crate::error::{RolloutError, RolloutResult, require};
use crate::parameters::{ParameterSource, merge_parameters};
use crate::provider::{ProviderError, UnitProvider, UnitSpec};

/// Template file expected at the root of every build artifact.
pub const TEMPLATE_FILE: &str = "template.yaml";

/// Tunables for the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub environment_parameter: String,
    pub poll_parallelism: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from(&RolloutConfig::default())
    }
}

impl From<&RolloutConfig> for DriverSettings {
    fn from(config: &RolloutConfig) -> Self {
        Self {
            environment_parameter: config.environment_parameter.clone(),
            poll_parallelism: config.poll_parallelism.max(1),
        }
    }
}

/// What CreateOrUpdateUnit did to the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitOperation {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub unit_name: String,
    pub operation: UnitOperation,
    pub unit_id: Option<String>,
    /// Operation started by an update; `None` when nothing changed.
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionOutcome {
    pub operation_id: String,
    /// True when new instances were created, false when existing ones were updated.
    pub created: bool,
    pub account_ids: Vec<String>,
    pub regions: Vec<String>,
}

/// Drives a deployment unit through its provider.
#[derive(Clone)]
pub struct DeploymentDriver {
    pub(crate) store: StateStore,
    pub(crate) provider: Arc<dyn UnitProvider>,
    parameters: Arc<dyn ParameterSource>,
    pub(crate) settings: DriverSettings,
}

impl DeploymentDriver {
    pub fn new(
        store: StateStore,
        provider: Arc<dyn UnitProvider>,
        parameters: Arc<dyn ParameterSource>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            store,
            provider,
            parameters,
            settings,
        }
    }

    /// Create the unit for (repository, environment) if absent, update it otherwise.
    pub async fn create_or_update_unit(
        &self,
        environment: &str,
        repository: &str,
        build_id: &str,
        artifact_location: &str,
    ) -> RolloutResult<UnitOutcome> {
        require(&[
            ("env", environment),
            ("repo", repository),
            ("buildId", build_id),
            ("artifactLocation", artifact_location),
        ])?;

        let base = self.parameters.base(artifact_location).await?;
        let overrides = self
            .parameters
            .overrides(artifact_location, environment)
            .await?;
        let spec = UnitSpec {
            name: naming::unit_name(repository, environment),
            template_location: format!(
                "{}/{TEMPLATE_FILE}",
                artifact_location.trim_end_matches('/')
            ),
            parameters: merge_parameters(
                base,
                overrides,
                &self.settings.environment_parameter,
                environment,
            ),
            description: format!("{repository} in {environment} (build {build_id})"),
        };

        let (exists, unit_id) = match self.provider.describe_unit(&spec.name).await {
            Ok(Some(unit)) => (true, Some(unit.unit_id)),
            Ok(None) => (false, None),
            Err(e) if e.is_transient() => return Err(RolloutError::from_provider(e)),
            Err(e) => {
                // Unknown failure: the unit may exist, so try an update first.
                warn!(unit = %spec.name, error = %e, "describe failed, attempting update");
                (true, None)
            }
        };

        let outcome = if exists {
            match self.update_unit(&spec).await {
                Ok(operation_id) => UnitOutcome {
                    unit_name: spec.name.clone(),
                    operation: UnitOperation::Update,
                    unit_id,
                    operation_id,
                },
                Err(RolloutError::Provider(ProviderError::NotFound(_))) => {
                    self.create_unit(&spec).await?
                }
                Err(e) => return Err(e),
            }
        } else {
            self.create_unit(&spec).await?
        };

        info!(
            env = %environment,
            repo = %repository,
            build = %build_id,
            unit = %outcome.unit_name,
            operation = ?outcome.operation,
            parameters = spec.parameters.len(),
            "deployment unit reconciled"
        );
        Ok(outcome)
    }

    async fn update_unit(&self, spec: &UnitSpec) -> RolloutResult<Option<String>> {
        match self.provider.update_unit(spec).await {
            Ok(operation_id) => Ok(operation_id),
            Err(ProviderError::NoChanges) => {
                debug!(unit = %spec.name, "unit already up to date");
                Ok(None)
            }
            Err(e) => Err(RolloutError::from_provider(e)),
        }
    }

    async fn create_unit(&self, spec: &UnitSpec) -> RolloutResult<UnitOutcome> {
        match self.provider.create_unit(spec).await {
            Ok(unit) => Ok(UnitOutcome {
                unit_name: unit.name,
                operation: UnitOperation::Create,
                unit_id: Some(unit.unit_id),
                operation_id: None,
            }),
            Err(ProviderError::AlreadyExists(_)) => {
                debug!(unit = %spec.name, "unit created concurrently, updating instead");
                let operation_id = self.update_unit(spec).await?;
                Ok(UnitOutcome {
                    unit_name: spec.name.clone(),
                    operation: UnitOperation::Update,
                    unit_id: None,
                    operation_id,
                })
            }
            Err(e) => Err(RolloutError::from_provider(e)),
        }
    }

    /// Materialize the unit in every requested target.
    ///
    /// Pairs the unit is not yet present in are created; when every pair
    /// already exists the instances are updated instead. Existing pairs of a
    /// mixed request pick up a new definition through the unit update.
    pub async fn provision_instances(
        &self,
        unit_name: &str,
        targets: &[Target],
    ) -> RolloutResult<ProvisionOutcome> {
        require(&[("unitName", unit_name)])?;
        if targets.is_empty() {
            return Err(RolloutError::InvalidInput("targets must not be empty".to_string()));
        }
        for target in targets {
            require(&[
                ("accountId", target.account_id.as_str()),
                ("region", target.region.as_str()),
            ])?;
        }

        let requested: BTreeSet<Target> = targets.iter().cloned().collect();
        let existing: BTreeSet<Target> = self
            .provider
            .list_instances(unit_name)
            .await
            .map_err(RolloutError::from_provider)?
            .into_iter()
            .collect();
        let missing: Vec<Target> = requested.difference(&existing).cloned().collect();

        let (created, affected) = if missing.is_empty() {
            (false, requested.into_iter().collect::<Vec<_>>())
        } else {
            (true, missing)
        };

        let result = if created {
            self.provider.create_instances(unit_name, &affected).await
        } else {
            self.provider.update_instances(unit_name, &affected).await
        };
        let operation_id = result.map_err(|e| {
            let err = RolloutError::from_provider(e);
            if let RolloutError::Retryable { operation_id, .. } = &err {
                warn!(unit = %unit_name, in_progress = ?operation_id, "unit busy, retry later");
            }
            err
        })?;

        let account_ids: BTreeSet<String> = affected.iter().map(|t| t.account_id.clone()).collect();
        let regions: BTreeSet<String> = affected.iter().map(|t| t.region.clone()).collect();
        info!(
            unit = %unit_name,
            operation = %operation_id,
            created,
            instances = affected.len(),
            "instances provisioned"
        );
        Ok(ProvisionOutcome {
            operation_id,
            created,
            account_ids: account_ids.into_iter().collect(),
            regions: regions.into_iter().collect(),
        })
    }
}
