//! Typed view of the CloudNativePG records this delegate reads and writes
//!
//! Only the fields the delegate touches are modelled. Everything else in a
//! stored object is ignored on read.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

use crate::delegate::DelegateResult;

pub const GROUP: &str = "postgresql.cnpg.io";
pub const VERSION: &str = "v1";

/// Phase text CloudNativePG reports for a healthy cluster
pub const PHASE_HEALTHY: &str = "Cluster in healthy state";

/// Condition type set while a cluster is hibernated
pub const CONDITION_HIBERNATION: &str = "cnpg.io/hibernation";

/// Condition type CloudNativePG flips while instances roll
pub const CONDITION_READY: &str = "Ready";

/// Phase a Backup record reports once it finished successfully
pub const BACKUP_COMPLETED: &str = "completed";

fn api_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(GROUP, VERSION, kind), plural)
}

pub fn cluster_api() -> ApiResource {
    api_resource("Cluster", "clusters")
}

pub fn backup_api() -> ApiResource {
    api_resource("Backup", "backups")
}

pub fn pooler_api() -> ApiResource {
    api_resource("Pooler", "poolers")
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSpec {
    pub instances: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgresql: Option<PostgresConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<AffinityConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapConfiguration>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_clusters: Vec<ExternalCluster>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed: Option<ManagedConfiguration>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PostgresConfiguration {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AffinityConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_pod_anti_affinity: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_anti_affinity_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology_key: Option<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfiguration {
    pub enable_pod_monitor: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barman_object_store: Option<BarmanObjectStore>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BarmanObjectStore {
    pub destination_path: String,

    #[serde(rename = "endpointURL", skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_credentials: Option<S3Credentials>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_credentials: Option<GoogleCredentials>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure_credentials: Option<AzureCredentials>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct S3Credentials {
    #[serde(rename = "accessKeyId")]
    pub access_key_id: SecretKeySelector,
    pub secret_access_key: SecretKeySelector,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<SecretKeySelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleCredentials {
    pub application_credentials: SecretKeySelector,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AzureCredentials {
    pub storage_account: SecretKeySelector,
    pub storage_key: SecretKeySelector,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

impl SecretKeySelector {
    pub fn new(name: &str, key: &str) -> Self {
        Self {
            name: name.to_string(),
            key: key.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BootstrapConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initdb: Option<BootstrapInitDb>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<BootstrapRecovery>,

    #[serde(rename = "pg_basebackup", skip_serializing_if = "Option::is_none")]
    pub pg_basebackup: Option<BootstrapPgBaseBackup>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BootstrapInitDb {
    pub database: String,
    pub owner: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BootstrapRecovery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<NamedReference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_target: Option<RecoveryTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NamedReference {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BootstrapPgBaseBackup {
    pub source: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalCluster {
    pub name: String,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub connection_parameters: BTreeMap<String, String>,

    #[serde(rename = "sslKey", skip_serializing_if = "Option::is_none")]
    pub ssl_key: Option<SecretKeySelector>,

    #[serde(rename = "sslCert", skip_serializing_if = "Option::is_none")]
    pub ssl_cert: Option<SecretKeySelector>,

    #[serde(rename = "sslRootCert", skip_serializing_if = "Option::is_none")]
    pub ssl_root_cert: Option<SecretKeySelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagedConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<ManagedServices>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagedServices {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional: Vec<ManagedService>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagedService {
    /// "rw", "r" or "ro"
    pub selector_type: String,
    pub service_template: ServiceTemplate,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceTemplate {
    pub metadata: ServiceTemplateMetadata,
    pub spec: ServiceTemplateSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceTemplateMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceTemplateSpec {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_source_ranges: Vec<String>,
}

/// Observed state of a CloudNativePG cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterStatus {
    pub instances: i32,
    pub ready_instances: i32,
    pub phase: Option<String>,
    pub phase_reason: Option<String>,
    pub current_primary: Option<String>,
    pub target_primary: Option<String>,
    pub instance_names: Vec<String>,
    pub image: Option<String>,
    pub first_recoverability_point: Option<String>,
    pub last_successful_backup: Option<String>,
    #[serde(rename = "resizingPVC")]
    pub resizing_pvc: Vec<String>,
    pub conditions: Vec<ChildCondition>,
}

impl ClusterStatus {
    pub fn is_healthy(&self) -> bool {
        self.phase.as_deref() == Some(PHASE_HEALTHY)
    }

    pub fn is_hibernated(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == CONDITION_HIBERNATION && c.status == "True")
    }

    pub fn condition(&self, type_: &str) -> Option<&ChildCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ChildCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupRequestSpec {
    pub cluster: NamedReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupRequestStatus {
    pub phase: Option<String>,
    pub error: Option<String>,
    pub stopped_at: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolerSpec {
    pub cluster: NamedReference,
    pub instances: i32,

    #[serde(rename = "type")]
    pub type_: String,

    pub pgbouncer: PgBouncerSpec,

    /// Pod template merged over the defaults, used to carry resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PgBouncerSpec {
    pub pool_mode: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolerStatus {
    pub instances: i32,
}

/// Deserialize one top-level section (e.g. "spec") of a stored object
pub fn section<T>(object: &DynamicObject, key: &str) -> DelegateResult<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match object.data.get(key) {
        Some(value) if !value.is_null() => Ok(serde_json::from_value(value.clone())?),
        _ => Ok(T::default()),
    }
}
