//! Builds the CloudNativePG `Cluster` child record from a DatabaseCluster

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ResourceRequirements as K8sResourceRequirements, Toleration as K8sToleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DynamicObject, ObjectMeta};
use kube::{Resource, ResourceExt};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::markers;
use super::model::{
    AffinityConfiguration, AzureCredentials, BackupConfiguration, BarmanObjectStore,
    BootstrapConfiguration, BootstrapInitDb, BootstrapPgBaseBackup, BootstrapRecovery, ClusterSpec,
    ExternalCluster, GoogleCredentials, ManagedConfiguration, ManagedService, ManagedServices,
    MonitoringConfiguration, NamedReference, PgBouncerSpec, PoolerSpec, PostgresConfiguration,
    S3Credentials, SecretKeySelector, ServiceTemplate, ServiceTemplateMetadata,
    ServiceTemplateSpec, StorageConfiguration, cluster_api, pooler_api,
};
use super::status::pooler_name;
use crate::crd::{
    BackupStorageSpec, DatabaseCluster, ExposeSpec, ExposeType, ResourceList,
    ResourceRequirements, StorageType,
};
use crate::delegate::child::FIELD_MANAGER;
use crate::delegate::{Applier, ChildRecord, DelegateError, DelegateResult};

/// Label carrying the owning DatabaseCluster name
pub const LABEL_CLUSTER: &str = "dbaas.io/cluster";
/// Label carrying the engine type
pub const LABEL_ENGINE: &str = "dbaas.io/engine";

/// Child fields only shaped when the child is first created
const CREATION_ONLY_FIELDS: [&str; 2] = ["/spec/bootstrap", "/spec/externalClusters"];

const DEFAULT_DATABASE: &str = "app";
const DEFAULT_OWNER: &str = "app";

/// The only proxy implementation CloudNativePG runs
const PROXY_PGBOUNCER: &str = "pgbouncer";
const DEFAULT_POOL_MODE: &str = "transaction";

/// Applier for the CloudNativePG delegate
pub struct CnpgApplier {
    cluster: DatabaseCluster,
    existing: Option<DynamicObject>,
    backup_storage: Option<BackupStorageSpec>,
    image_repository: String,
    metadata: ObjectMeta,
    spec: ClusterSpec,
    pooler: Option<ChildRecord>,
}

impl CnpgApplier {
    /// `existing` is the stored child record, `backup_storage` the resolved
    /// BackupStorage referenced by the cluster's backup spec.
    pub fn new(
        cluster: DatabaseCluster,
        existing: Option<DynamicObject>,
        backup_storage: Option<BackupStorageSpec>,
        image_repository: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            existing,
            backup_storage,
            image_repository: image_repository.into(),
            metadata: ObjectMeta::default(),
            spec: ClusterSpec::default(),
            pooler: None,
        }
    }
}

impl Applier for CnpgApplier {
    fn metadata(&mut self) -> DelegateResult<()> {
        let owner = self
            .cluster
            .controller_owner_ref(&())
            .ok_or_else(|| DelegateError::Invalid("cluster has no uid yet".to_string()))?;
        let name = self.cluster.name_any();

        self.metadata = ObjectMeta {
            name: Some(name.clone()),
            namespace: self.cluster.namespace(),
            labels: Some(child_labels(&self.cluster)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        };
        Ok(())
    }

    fn engine(&mut self) -> DelegateResult<()> {
        let spec = &self.cluster.spec;
        if spec.engine.version.trim().is_empty() {
            return Err(DelegateError::Invalid(
                "engine version must be set".to_string(),
            ));
        }
        if spec.cluster_size < 1 {
            return Err(DelegateError::Invalid(format!(
                "clusterSize must be at least 1, got {}",
                spec.cluster_size
            )));
        }

        self.spec.instances = spec.cluster_size;
        self.spec.image_name = Some(image_name(&self.image_repository, &spec.engine.version));
        self.spec.storage = Some(StorageConfiguration {
            size: Some(spec.storage.size.clone()),
            storage_class: spec.storage.storage_class_name.clone(),
        });
        self.spec.resources = Some(resource_requirements(spec.resources.as_ref()));

        let parameters: BTreeMap<String, String> = spec
            .config
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();
        self.spec.postgresql = (!parameters.is_empty()).then_some(PostgresConfiguration { parameters });

        self.spec.managed = spec
            .expose
            .as_ref()
            .and_then(|e| managed_services(&self.cluster.name_any(), e));
        Ok(())
    }

    fn proxy(&mut self) -> DelegateResult<()> {
        let Some(proxy) = self.cluster.spec.proxy.as_ref().filter(|p| p.enabled) else {
            return Ok(());
        };
        let kind = proxy.type_.as_deref().unwrap_or(PROXY_PGBOUNCER);
        if kind != PROXY_PGBOUNCER {
            warn!(proxy_type = kind, "Proxy type not supported by this delegate, skipping");
            return Ok(());
        }
        if proxy.replicas < 1 {
            return Err(DelegateError::Invalid(format!(
                "proxy replicas must be at least 1, got {}",
                proxy.replicas
            )));
        }

        let cluster_name = self.cluster.name_any();
        let template = match proxy.resources.as_ref() {
            Some(r) => {
                let resources = serde_json::to_value(resource_requirements(Some(r)))?;
                Some(json!({
                    "spec": {"containers": [{"name": PROXY_PGBOUNCER, "resources": resources}]}
                }))
            }
            None => None,
        };
        let spec = PoolerSpec {
            cluster: NamedReference {
                name: cluster_name.clone(),
            },
            instances: proxy.replicas,
            type_: "rw".to_string(),
            pgbouncer: PgBouncerSpec {
                pool_mode: DEFAULT_POOL_MODE.to_string(),
            },
            template,
        };

        let api = pooler_api();
        let name = pooler_name(&cluster_name);
        let mut pooler = DynamicObject::new(&name, &api);
        pooler.metadata = ObjectMeta {
            name: Some(name),
            ..self.metadata.clone()
        };
        pooler.data = json!({ "spec": serde_json::to_value(spec)? });
        self.pooler = Some(ChildRecord::new(api, pooler));
        Ok(())
    }

    fn monitoring(&mut self) -> DelegateResult<()> {
        let Some(monitoring) = self.cluster.spec.monitoring.as_ref() else {
            return Ok(());
        };
        if let Some(config) = monitoring.monitoring_config_ref.as_deref() {
            debug!(config, "Monitoring config reference is not resolved, using pod monitor only");
        }
        self.spec.monitoring = Some(MonitoringConfiguration {
            enable_pod_monitor: monitoring.enabled,
        });
        Ok(())
    }

    fn pod_scheduling_policy(&mut self) -> DelegateResult<()> {
        let Some(policy) = self.cluster.spec.pod_scheduling_policy.as_ref() else {
            return Ok(());
        };

        if let Some(kind) = policy.pod_anti_affinity_type.as_deref()
            && kind != "preferred"
            && kind != "required"
        {
            return Err(DelegateError::Invalid(format!(
                "podAntiAffinityType must be \"preferred\" or \"required\", got {kind:?}"
            )));
        }

        let tolerations = policy
            .tolerations
            .iter()
            .map(|t| K8sToleration {
                key: t.key.clone(),
                operator: t.operator.clone(),
                value: t.value.clone(),
                effect: t.effect.clone(),
                toleration_seconds: t.toleration_seconds,
                ..Default::default()
            })
            .collect();

        self.spec.affinity = Some(AffinityConfiguration {
            enable_pod_anti_affinity: policy.pod_anti_affinity_type.as_ref().map(|_| true),
            pod_anti_affinity_type: policy.pod_anti_affinity_type.clone(),
            topology_key: policy.topology_key.clone(),
            node_selector: policy.node_selector.clone(),
            tolerations,
        });
        self.spec.priority_class_name = policy.priority_class_name.clone();
        Ok(())
    }

    fn backup(&mut self) -> DelegateResult<()> {
        let Some(backup) = self.cluster.spec.backup.as_ref().filter(|b| b.enabled) else {
            return Ok(());
        };
        if backup.schedule.is_some() {
            debug!("Backup schedule is not managed by this delegate, skipping");
        }
        let Some(storage_name) = backup.backup_storage_ref.as_deref() else {
            warn!("Backups enabled without a backupStorageRef, skipping");
            return Ok(());
        };
        let storage = self.backup_storage.as_ref().ok_or_else(|| {
            DelegateError::Invalid(format!("backup storage {storage_name} not found"))
        })?;

        self.spec.backup = Some(BackupConfiguration {
            barman_object_store: Some(object_store(storage_name, storage, &self.cluster.name_any())?),
            retention_policy: backup.retention_policy.clone(),
        });
        Ok(())
    }

    fn data_source(&mut self) -> DelegateResult<()> {
        if self.existing.is_some() {
            // Bootstrap only matters at creation; the stored one is kept in finish()
            return Ok(());
        }

        let source = self.cluster.spec.data_source.clone().unwrap_or_default();
        let bootstrap = match (source.backup_source, source.clone_source) {
            (Some(_), Some(_)) => {
                return Err(DelegateError::Invalid(
                    "dataSource must set only one of backupSource or cloneSource".to_string(),
                ));
            }
            (Some(backup), None) => BootstrapConfiguration {
                recovery: Some(BootstrapRecovery {
                    backup: Some(NamedReference {
                        name: backup.backup_name,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            (None, Some(clone)) => {
                if clone.timestamp.is_some() {
                    warn!(
                        source = %clone.cluster_name,
                        "Point-in-time clone is not supported, cloning the current state"
                    );
                }
                self.spec
                    .external_clusters
                    .push(clone_source_cluster(&clone.cluster_name));
                BootstrapConfiguration {
                    pg_basebackup: Some(BootstrapPgBaseBackup {
                        source: clone.cluster_name,
                    }),
                    ..Default::default()
                }
            }
            (None, None) => BootstrapConfiguration {
                initdb: Some(BootstrapInitDb {
                    database: DEFAULT_DATABASE.to_string(),
                    owner: DEFAULT_OWNER.to_string(),
                }),
                ..Default::default()
            },
        };
        self.spec.bootstrap = Some(bootstrap);
        Ok(())
    }

    fn data_import(&mut self) -> DelegateResult<()> {
        Ok(())
    }

    fn finish(self: Box<Self>) -> DelegateResult<ChildRecord> {
        let api = cluster_api();
        let mut object = DynamicObject::new(&self.cluster.name_any(), &api);
        object.metadata = self.metadata;
        object.data = json!({ "spec": serde_json::to_value(&self.spec)? });

        if let Some(existing) = &self.existing {
            let generation = self.cluster.metadata.generation.unwrap_or_default();
            let owned = markers::owned_fields(existing, generation);
            for pointer in CREATION_ONLY_FIELDS
                .iter()
                .copied()
                .chain(owned.iter().map(String::as_str))
            {
                copy_pointer(&mut object.data, &existing.data, pointer);
            }
        }

        let mut record = ChildRecord::new(api, object);
        record.companions.extend(self.pooler);
        Ok(record)
    }
}

/// Labels put on every child record
pub fn child_labels(cluster: &DatabaseCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.name_any()),
        (LABEL_ENGINE.to_string(), cluster.spec.engine.type_.clone()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}

pub fn image_name(repository: &str, version: &str) -> String {
    format!("{repository}:{version}")
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut out = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        out.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        out.insert("memory".to_string(), Quantity(memory.clone()));
    }
    out
}

/// Requests default to 1 CPU / 2Gi and limits to 2 CPU / 4Gi when unset
pub fn resource_requirements(resources: Option<&ResourceRequirements>) -> K8sResourceRequirements {
    let default_requests = ResourceList {
        cpu: Some("1".to_string()),
        memory: Some("2Gi".to_string()),
    };
    let default_limits = ResourceList {
        cpu: Some("2".to_string()),
        memory: Some("4Gi".to_string()),
    };
    let requests = resources
        .and_then(|r| r.requests.clone())
        .unwrap_or(default_requests);
    let limits = resources
        .and_then(|r| r.limits.clone())
        .unwrap_or(default_limits);

    K8sResourceRequirements {
        requests: Some(quantities(&requests)),
        limits: Some(quantities(&limits)),
        ..Default::default()
    }
}

/// Extra service for non-ClusterIP exposure, pointing at the primary
pub fn managed_services(cluster_name: &str, expose: &ExposeSpec) -> Option<ManagedConfiguration> {
    if expose.type_ == ExposeType::ClusterIP {
        return None;
    }
    Some(ManagedConfiguration {
        services: Some(ManagedServices {
            additional: vec![ManagedService {
                selector_type: "rw".to_string(),
                service_template: ServiceTemplate {
                    metadata: ServiceTemplateMetadata {
                        name: external_service_name(cluster_name),
                        annotations: expose.annotations.clone(),
                    },
                    spec: ServiceTemplateSpec {
                        type_: expose.type_.to_string(),
                        load_balancer_source_ranges: expose.load_balancer_source_ranges.clone(),
                    },
                },
            }],
        }),
    })
}

pub fn external_service_name(cluster_name: &str) -> String {
    format!("{cluster_name}-external")
}

fn object_store(
    storage_name: &str,
    storage: &BackupStorageSpec,
    cluster_name: &str,
) -> DelegateResult<BarmanObjectStore> {
    let secret = storage
        .credentials_secret_ref
        .as_ref()
        .map(|s| s.name.as_str())
        .ok_or_else(|| {
            DelegateError::Invalid(format!(
                "backup storage {storage_name} has no credentialsSecretRef"
            ))
        })?;
    let missing = |section: &str| {
        DelegateError::Invalid(format!(
            "backup storage {storage_name} of type {} has no {section} settings",
            storage.type_
        ))
    };
    let path = |prefix: &Option<String>| match prefix.as_deref().map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{p}/{cluster_name}"),
        _ => cluster_name.to_string(),
    };

    let store = match storage.type_ {
        StorageType::S3 => {
            let s3 = storage.s3.as_ref().ok_or_else(|| missing("s3"))?;
            BarmanObjectStore {
                destination_path: format!("s3://{}/{}", s3.bucket, path(&s3.prefix)),
                endpoint_url: s3.endpoint.clone(),
                s3_credentials: Some(S3Credentials {
                    access_key_id: SecretKeySelector::new(secret, "ACCESS_KEY_ID"),
                    secret_access_key: SecretKeySelector::new(secret, "ACCESS_SECRET_KEY"),
                    region: s3
                        .region
                        .as_ref()
                        .map(|_| SecretKeySelector::new(secret, "ACCESS_REGION")),
                }),
                ..Default::default()
            }
        }
        StorageType::Gcs => {
            let gcs = storage.gcs.as_ref().ok_or_else(|| missing("gcs"))?;
            BarmanObjectStore {
                destination_path: format!("gs://{}/{}", gcs.bucket, path(&gcs.prefix)),
                google_credentials: Some(GoogleCredentials {
                    application_credentials: SecretKeySelector::new(secret, "gcsCredentials"),
                }),
                ..Default::default()
            }
        }
        StorageType::Azure => {
            let azure = storage.azure.as_ref().ok_or_else(|| missing("azure"))?;
            BarmanObjectStore {
                destination_path: format!(
                    "https://{}.blob.core.windows.net/{}/{}",
                    azure.storage_account,
                    azure.container,
                    path(&azure.prefix)
                ),
                azure_credentials: Some(AzureCredentials {
                    storage_account: SecretKeySelector::new(secret, "AZURE_STORAGE_ACCOUNT"),
                    storage_key: SecretKeySelector::new(secret, "AZURE_STORAGE_KEY"),
                }),
                ..Default::default()
            }
        }
    };
    Ok(store)
}

/// Streaming-replication connection to another cluster in the same namespace
fn clone_source_cluster(source: &str) -> ExternalCluster {
    let replication_secret = format!("{source}-replication");
    let ca_secret = format!("{source}-ca");
    ExternalCluster {
        name: source.to_string(),
        connection_parameters: BTreeMap::from([
            ("host".to_string(), format!("{source}-rw")),
            ("user".to_string(), "streaming_replica".to_string()),
            ("sslmode".to_string(), "verify-full".to_string()),
            ("dbname".to_string(), "postgres".to_string()),
        ]),
        ssl_key: Some(SecretKeySelector::new(&replication_secret, "tls.key")),
        ssl_cert: Some(SecretKeySelector::new(&replication_secret, "tls.crt")),
        ssl_root_cert: Some(SecretKeySelector::new(&ca_secret, "ca.crt")),
    }
}

/// Copy the value at `pointer` in `source` into `target`, creating parents.
///
/// Nothing happens when `source` has no value there.
pub fn copy_pointer(target: &mut Value, source: &Value, pointer: &str) {
    if let Some(value) = source.pointer(pointer) {
        set_pointer(target, pointer, value.clone());
    }
}

pub fn set_pointer(target: &mut Value, pointer: &str, value: Value) {
    let parts: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };

    let mut current = target;
    for part in parents {
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}
