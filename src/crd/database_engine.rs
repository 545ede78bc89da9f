use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ops_request::OpsType;

/// DatabaseEngine is a read-only catalog entry describing what an engine supports
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "dbaas.io",
    version = "v1",
    kind = "DatabaseEngine",
    plural = "databaseengines",
    shortname = "dbe",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Provider", "type":"string", "jsonPath":".spec.provider"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEngineSpec {
    #[serde(rename = "type")]
    pub type_: String,

    /// Child system that realizes clusters of this engine (e.g., "cloudnative-pg")
    pub provider: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_versions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_config: BTreeMap<String, String>,

    #[serde(default)]
    pub features: EngineFeatures,
}

/// Feature flags. An unset flag does not restrict anything.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitr: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_scaling: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_scaling: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_expansion: Option<bool>,
}

impl EngineFeatures {
    /// The feature flag gating an operation type, if any
    pub fn flag_for(&self, ops_type: OpsType) -> Option<(&'static str, Option<bool>)> {
        match ops_type {
            OpsType::Backup | OpsType::Restore => Some(("backup", self.backup)),
            OpsType::HorizontalScaling => Some(("horizontalScaling", self.horizontal_scaling)),
            OpsType::VerticalScaling => Some(("verticalScaling", self.vertical_scaling)),
            OpsType::VolumeExpansion => Some(("volumeExpansion", self.volume_expansion)),
            _ => None,
        }
    }
}

impl DatabaseEngineSpec {
    /// Whether `version` is listed; an empty list allows any version
    pub fn supports_version(&self, version: &str) -> bool {
        self.supported_versions.is_empty() || self.supported_versions.iter().any(|v| v == version)
    }
}
