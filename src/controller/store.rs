//! Access to the operator's own records
//!
//! Status writes carry the object's resourceVersion, so a write based on a
//! stale read fails with a conflict and the pass is retried.

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{Value, json};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::controller::error::Result;
use crate::crd::{
    DatabaseCluster, DatabaseClusterStatus, DatabaseEngine, OpsRequest, OpsRequestStatus,
};
use crate::delegate::child::FIELD_MANAGER;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<DatabaseCluster>>;

    async fn get_ops(&self, namespace: &str, name: &str) -> Result<Option<OpsRequest>>;

    /// Every entry of the cluster-scoped engine catalog
    async fn list_engines(&self) -> Result<Vec<DatabaseEngine>>;

    /// Replace the finalizer list and return the updated record
    async fn set_cluster_finalizers(
        &self,
        cluster: &DatabaseCluster,
        finalizers: Vec<String>,
    ) -> Result<DatabaseCluster>;

    /// Overwrite the whole status sub-resource
    async fn replace_cluster_status(
        &self,
        cluster: &DatabaseCluster,
        status: &DatabaseClusterStatus,
    ) -> Result<DatabaseCluster>;

    /// Overwrite the whole status sub-resource
    async fn replace_ops_status(
        &self,
        ops: &OpsRequest,
        status: &OpsRequestStatus,
    ) -> Result<OpsRequest>;

    /// Delete the record; an already-deleted record is not an error
    async fn delete_ops(&self, ops: &OpsRequest) -> Result<()>;
}

/// [`RecordStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeRecordStore {
    client: Client,
}

impl KubeRecordStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Merge patch that turns `old` into exactly `new`.
///
/// Keys present in `old` but missing from `new` are set to null so that a
/// JSON merge patch removes them; nested objects are handled recursively.
/// Anything that is not an object on both sides is replaced as a whole.
pub fn replacement_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = serde_json::Map::new();
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, new_value) in new_map {
                let value = match old_map.get(key) {
                    Some(old_value) => replacement_patch(old_value, new_value),
                    None => new_value.clone(),
                };
                patch.insert(key.clone(), value);
            }
            Value::Object(patch)
        }
        (_, new) => new.clone(),
    }
}

/// Apply a JSON merge patch (RFC 7386) to `target`
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                apply_merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

fn status_patch(resource_version: Option<String>, old: Value, new: Value) -> Value {
    json!({
        "metadata": { "resourceVersion": resource_version },
        "status": replacement_patch(&old, &new),
    })
}

#[async_trait]
impl RecordStore for KubeRecordStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<DatabaseCluster>> {
        let api: Api<DatabaseCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_ops(&self, namespace: &str, name: &str) -> Result<Option<OpsRequest>> {
        let api: Api<OpsRequest> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_engines(&self) -> Result<Vec<DatabaseEngine>> {
        let api: Api<DatabaseEngine> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn set_cluster_finalizers(
        &self,
        cluster: &DatabaseCluster,
        finalizers: Vec<String>,
    ) -> Result<DatabaseCluster> {
        let ns = cluster.namespace().unwrap_or_default();
        let api: Api<DatabaseCluster> = Api::namespaced(self.client.clone(), &ns);
        let patch = json!({
            "metadata": {
                "resourceVersion": cluster.resource_version(),
                "finalizers": finalizers,
            }
        });
        let updated = api
            .patch(
                &cluster.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(cluster = %cluster.name_any(), ?finalizers, "Updated finalizers");
        Ok(updated)
    }

    async fn replace_cluster_status(
        &self,
        cluster: &DatabaseCluster,
        status: &DatabaseClusterStatus,
    ) -> Result<DatabaseCluster> {
        let ns = cluster.namespace().unwrap_or_default();
        let api: Api<DatabaseCluster> = Api::namespaced(self.client.clone(), &ns);
        let patch = status_patch(
            cluster.resource_version(),
            serde_json::to_value(&cluster.status)?,
            serde_json::to_value(status)?,
        );
        Ok(api
            .patch_status(
                &cluster.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?)
    }

    async fn replace_ops_status(
        &self,
        ops: &OpsRequest,
        status: &OpsRequestStatus,
    ) -> Result<OpsRequest> {
        let ns = ops.namespace().unwrap_or_default();
        let api: Api<OpsRequest> = Api::namespaced(self.client.clone(), &ns);
        let patch = status_patch(
            ops.resource_version(),
            serde_json::to_value(&ops.status)?,
            serde_json::to_value(status)?,
        );
        Ok(api
            .patch_status(
                &ops.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?)
    }

    async fn delete_ops(&self, ops: &OpsRequest) -> Result<()> {
        let ns = ops.namespace().unwrap_or_default();
        let api: Api<OpsRequest> = Api::namespaced(self.client.clone(), &ns);
        match api.delete(&ops.name_any(), &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
