//! In-memory stand-ins for the Kubernetes API
//!
//! [`FakeRecordStore`] holds the operator's own records and
//! [`FakeDynamicClient`] holds child-system objects. Both enforce
//! resourceVersion preconditions and count writes, so tests can assert that
//! an idempotent pass wrote nothing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject};
use serde_json::Value;

use dbaas_operator::config::OperatorConfig;
use dbaas_operator::controller::store::{RecordStore, apply_merge_patch, replacement_patch};
use dbaas_operator::controller::{Context, Error, Result};
use dbaas_operator::crd::{
    DatabaseCluster, DatabaseClusterStatus, DatabaseEngine, OpsRequest, OpsRequestStatus,
};
use dbaas_operator::delegate::{DynamicClient, EngineRegistry};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    })
}

fn next_version(current: Option<&str>) -> String {
    let n = current.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    (n + 1).to_string()
}

fn check_version(stored: Option<&String>, given: Option<&String>) -> Result<(), kube::Error> {
    match (stored, given) {
        (Some(stored), Some(given)) if stored != given => Err(api_error(409, "Conflict")),
        _ => Ok(()),
    }
}

/// Replace `old` status with `new` the same way the real store does, through
/// a merge patch
fn patched<T>(old: &Option<T>, new: &T) -> Result<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut current = serde_json::to_value(old)?;
    let desired = serde_json::to_value(new)?;
    let patch = replacement_patch(&current, &desired);
    apply_merge_patch(&mut current, &patch);
    Ok(serde_json::from_value(current)?)
}

// =============================================================================
// Record store
// =============================================================================

#[derive(Default)]
pub struct FakeRecordStore {
    clusters: Mutex<BTreeMap<Key, DatabaseCluster>>,
    ops: Mutex<BTreeMap<Key, OpsRequest>>,
    engines: Mutex<Vec<DatabaseEngine>>,
    status_writes: AtomicUsize,
}

impl FakeRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_cluster(&self, cluster: DatabaseCluster) {
        let k = key(&cluster.namespace().unwrap_or_default(), &cluster.name_any());
        self.clusters.lock().unwrap().insert(k, cluster);
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<DatabaseCluster> {
        self.clusters.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    /// Mark a cluster as deleted, like `kubectl delete` with finalizers present
    pub fn mark_cluster_deleted(&self, namespace: &str, name: &str) {
        if let Some(cluster) = self.clusters.lock().unwrap().get_mut(&key(namespace, name)) {
            cluster.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
            );
        }
    }

    pub fn put_ops(&self, ops: OpsRequest) {
        let k = key(&ops.namespace().unwrap_or_default(), &ops.name_any());
        self.ops.lock().unwrap().insert(k, ops);
    }

    pub fn ops(&self, namespace: &str, name: &str) -> Option<OpsRequest> {
        self.ops.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    pub fn put_engine(&self, engine: DatabaseEngine) {
        self.engines.lock().unwrap().push(engine);
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for FakeRecordStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<DatabaseCluster>> {
        Ok(self.cluster(namespace, name))
    }

    async fn get_ops(&self, namespace: &str, name: &str) -> Result<Option<OpsRequest>> {
        Ok(self.ops(namespace, name))
    }

    async fn list_engines(&self) -> Result<Vec<DatabaseEngine>> {
        Ok(self.engines.lock().unwrap().clone())
    }

    async fn set_cluster_finalizers(
        &self,
        cluster: &DatabaseCluster,
        finalizers: Vec<String>,
    ) -> Result<DatabaseCluster> {
        let k = key(&cluster.namespace().unwrap_or_default(), &cluster.name_any());
        let mut clusters = self.clusters.lock().unwrap();
        let stored = clusters
            .get_mut(&k)
            .ok_or_else(|| Error::KubeError(api_error(404, "NotFound")))?;
        check_version(
            stored.metadata.resource_version.as_ref(),
            cluster.metadata.resource_version.as_ref(),
        )?;

        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version =
            Some(next_version(stored.metadata.resource_version.as_deref()));
        let updated = stored.clone();

        // The API server drops a deleted object once its last finalizer is gone
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            clusters.remove(&k);
        }
        Ok(updated)
    }

    async fn replace_cluster_status(
        &self,
        cluster: &DatabaseCluster,
        status: &DatabaseClusterStatus,
    ) -> Result<DatabaseCluster> {
        let k = key(&cluster.namespace().unwrap_or_default(), &cluster.name_any());
        let mut clusters = self.clusters.lock().unwrap();
        let stored = clusters
            .get_mut(&k)
            .ok_or_else(|| Error::KubeError(api_error(404, "NotFound")))?;
        check_version(
            stored.metadata.resource_version.as_ref(),
            cluster.metadata.resource_version.as_ref(),
        )?;

        stored.status = Some(patched(&stored.status, status)?);
        stored.metadata.resource_version =
            Some(next_version(stored.metadata.resource_version.as_deref()));
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }

    async fn replace_ops_status(
        &self,
        ops: &OpsRequest,
        status: &OpsRequestStatus,
    ) -> Result<OpsRequest> {
        let k = key(&ops.namespace().unwrap_or_default(), &ops.name_any());
        let mut requests = self.ops.lock().unwrap();
        let stored = requests
            .get_mut(&k)
            .ok_or_else(|| Error::KubeError(api_error(404, "NotFound")))?;
        check_version(
            stored.metadata.resource_version.as_ref(),
            ops.metadata.resource_version.as_ref(),
        )?;

        stored.status = Some(patched(&stored.status, status)?);
        stored.metadata.resource_version =
            Some(next_version(stored.metadata.resource_version.as_deref()));
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }

    async fn delete_ops(&self, ops: &OpsRequest) -> Result<()> {
        let k = key(&ops.namespace().unwrap_or_default(), &ops.name_any());
        self.ops.lock().unwrap().remove(&k);
        Ok(())
    }
}

// =============================================================================
// Child system
// =============================================================================

type ObjectKey = (String, String, String);

fn object_key(api: &ApiResource, namespace: &str, name: &str) -> ObjectKey {
    (api.plural.clone(), namespace.to_string(), name.to_string())
}

#[derive(Default)]
pub struct FakeDynamicClient {
    objects: Mutex<BTreeMap<ObjectKey, DynamicObject>>,
    creates: AtomicUsize,
    replaces: AtomicUsize,
}

impl FakeDynamicClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, api: &ApiResource, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&object_key(api, namespace, name))
            .cloned()
    }

    /// Write the status block the child system would report
    pub fn set_status(&self, api: &ApiResource, namespace: &str, name: &str, status: Value) {
        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .get_mut(&object_key(api, namespace, name))
            .expect("object to exist");
        object.data["status"] = status;
        object.metadata.resource_version =
            Some(next_version(object.metadata.resource_version.as_deref()));
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn replaces(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DynamicClient for FakeDynamicClient {
    async fn get(
        &self,
        api: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        Ok(self.object(api, namespace, name))
    }

    async fn create(
        &self,
        api: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let k = object_key(api, namespace, &object.name_any());
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut stored = object.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some("1".to_string());
        objects.insert(k, stored.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn replace(
        &self,
        api: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let k = object_key(api, namespace, &object.name_any());
        let mut objects = self.objects.lock().unwrap();
        let Some(existing) = objects.get(&k) else {
            return Err(api_error(404, "NotFound"));
        };
        check_version(
            existing.metadata.resource_version.as_ref(),
            object.metadata.resource_version.as_ref(),
        )?;

        // Status is a sub-resource; a plain replace leaves it alone
        let mut stored = object.clone();
        match existing.data.get("status").cloned() {
            Some(status) => stored.data["status"] = status,
            None => {
                if let Value::Object(map) = &mut stored.data {
                    map.remove("status");
                }
            }
        }
        stored.metadata.resource_version =
            Some(next_version(existing.metadata.resource_version.as_deref()));
        objects.insert(k, stored.clone());
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn delete(
        &self,
        api: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<bool, kube::Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .remove(&object_key(api, namespace, name))
            .is_some())
    }

    async fn list(
        &self,
        api: &ApiResource,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, kube::Error> {
        let wanted: Vec<(&str, &str)> = selector
            .split(',')
            .filter_map(|term| term.split_once('='))
            .collect();
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((plural, ns, _), _)| *plural == api.plural && ns == namespace)
            .map(|(_, object)| object)
            .filter(|object| {
                let labels = object.labels();
                wanted
                    .iter()
                    .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect())
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// Both fakes plus a controller context wired to them
pub struct TestEnv {
    pub records: Arc<FakeRecordStore>,
    pub children: Arc<FakeDynamicClient>,
    pub ctx: Arc<Context>,
}

impl TestEnv {
    pub fn new() -> Self {
        let records = Arc::new(FakeRecordStore::new());
        let children = Arc::new(FakeDynamicClient::new());
        let config = OperatorConfig::default();
        let delegates = Arc::new(EngineRegistry::new(
            children.clone(),
            config.postgres_image_repository.clone(),
        ));
        let ctx = Arc::new(Context::from_parts(records.clone(), delegates, config));
        Self {
            records,
            children,
            ctx,
        }
    }
}
