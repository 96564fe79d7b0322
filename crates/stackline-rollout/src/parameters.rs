//! Unit parameters shipped inside a build artifact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{RolloutError, RolloutResult};

/// Reads base and per-environment parameters for a build artifact.
#[async_trait]
pub trait ParameterSource: Send + Sync {
    /// Parameters shared by every environment. Empty when the artifact has none.
    async fn base(&self, artifact_location: &str) -> RolloutResult<BTreeMap<String, String>>;

    /// Overrides for one environment. Empty when the artifact has none.
    async fn overrides(
        &self,
        artifact_location: &str,
        environment: &str,
    ) -> RolloutResult<BTreeMap<String, String>>;
}

/// Base parameters overlaid with environment overrides, with
/// `environment_parameter` forced to the real target environment.
pub fn merge_parameters(
    base: BTreeMap<String, String>,
    overrides: BTreeMap<String, String>,
    environment_parameter: &str,
    environment: &str,
) -> BTreeMap<String, String> {
    let mut merged = base;
    merged.extend(overrides);
    merged.insert(environment_parameter.to_string(), environment.to_string());
    merged
}

/// Accepted parameter file layouts.
#[derive(Deserialize)]
#[serde(untagged)]
enum ParameterFile {
    Map(BTreeMap<String, serde_json::Value>),
    List(Vec<ParameterEntry>),
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParameterEntry {
    parameter_key: String,
    parameter_value: serde_json::Value,
}

fn scalar(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parse either `{"Key": "Value"}` or `[{"ParameterKey": .., "ParameterValue": ..}]`.
pub fn parse_parameters(content: &str) -> RolloutResult<BTreeMap<String, String>> {
    let file: ParameterFile =
        serde_json::from_str(content).map_err(|e| RolloutError::Parameters(e.to_string()))?;
    Ok(match file {
        ParameterFile::Map(map) => map.into_iter().map(|(k, v)| (k, scalar(v))).collect(),
        ParameterFile::List(entries) => entries
            .into_iter()
            .map(|e| (e.parameter_key, scalar(e.parameter_value)))
            .collect(),
    })
}

/// Reads `<artifact>/parameters.json` and `<artifact>/parameters/<env>.json`.
#[derive(Debug, Clone, Default)]
pub struct DirParameterSource;

impl DirParameterSource {
    async fn read_optional(path: &Path) -> RolloutResult<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                debug!(path = %path.display(), "reading parameters");
                parse_parameters(&content)
                    .map_err(|e| RolloutError::Parameters(format!("{}: {e}", path.display())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(RolloutError::Parameters(format!("{}: {e}", path.display()))),
        }
    }
}

#[async_trait]
impl ParameterSource for DirParameterSource {
    async fn base(&self, artifact_location: &str) -> RolloutResult<BTreeMap<String, String>> {
        Self::read_optional(&PathBuf::from(artifact_location).join("parameters.json")).await
    }

    async fn overrides(
        &self,
        artifact_location: &str,
        environment: &str,
    ) -> RolloutResult<BTreeMap<String, String>> {
        let path = PathBuf::from(artifact_location)
            .join("parameters")
            .join(format!("{environment}.json"));
        Self::read_optional(&path).await
    }
}
