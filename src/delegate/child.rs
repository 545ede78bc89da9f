//! Access to records in the child system
//!
//! Child records are addressed as [`DynamicObject`]s so that delegates can
//! drive any child CRD without compiling its types into the operator.

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Field manager recorded on every write this operator makes
pub const FIELD_MANAGER: &str = "dbaas-operator";

/// Annotation holding the spec this operator last wrote to a child record
pub const LAST_APPLIED: &str = "dbaas.io/last-applied";

/// A built child record together with the API it lives under
#[derive(Clone, Debug)]
pub struct ChildRecord {
    pub api: ApiResource,
    pub object: DynamicObject,
    /// Records applied after this one and owned by the same cluster
    pub companions: Vec<ChildRecord>,
}

impl ChildRecord {
    pub fn new(api: ApiResource, object: DynamicObject) -> Self {
        Self {
            api,
            object,
            companions: Vec::new(),
        }
    }
}

/// Read/write access to the child system
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DynamicClient: Send + Sync {
    /// Fetch an object, `None` when it does not exist
    async fn get(
        &self,
        api: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error>;

    async fn create(
        &self,
        api: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// Replace an object. The object's resourceVersion is the write precondition.
    async fn replace(
        &self,
        api: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error>;

    /// Delete an object. Returns `false` when it was already absent.
    async fn delete(&self, api: &ApiResource, namespace: &str, name: &str)
    -> Result<bool, kube::Error>;

    /// List the objects matching a label selector such as `a=b,c=d`
    async fn list(
        &self,
        api: &ApiResource,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, kube::Error>;
}

/// [`DynamicClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeDynamicClient {
    client: Client,
}

impl KubeDynamicClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, api: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, api)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl DynamicClient for KubeDynamicClient {
    async fn get(
        &self,
        api: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        self.api(api, namespace).get_opt(name).await
    }

    async fn create(
        &self,
        api: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        self.api(api, namespace).create(&post_params(), object).await
    }

    async fn replace(
        &self,
        api: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject, kube::Error> {
        let name = object.name_any();
        self.api(api, namespace)
            .replace(&name, &post_params(), object)
            .await
    }

    async fn delete(
        &self,
        api: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<bool, kube::Error> {
        match self
            .api(api, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(
        &self,
        api: &ApiResource,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>, kube::Error> {
        let params = ListParams::default().labels(selector);
        Ok(self.api(api, namespace).list(&params).await?.items)
    }
}

/// Result of [`create_or_update`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Create the child record; when it already exists, replace it if it differs.
///
/// The stored object is left alone when every desired field is already
/// present with the same value and the spec recorded under [`LAST_APPLIED`]
/// is the desired one. Labels and annotations written by others are carried
/// over on replace.
pub async fn create_or_update(
    client: &dyn DynamicClient,
    child: &ChildRecord,
) -> Result<ApplyOutcome, kube::Error> {
    let namespace = child.object.namespace().unwrap_or_default();
    let name = child.object.name_any();
    let desired = stamped(&child.object);

    let conflict = match client.create(&child.api, &namespace, &desired).await {
        Ok(_) => {
            debug!(kind = %child.api.kind, %name, "Created child record");
            return Ok(ApplyOutcome::Created);
        }
        Err(kube::Error::Api(api_err)) if api_err.code == 409 => kube::Error::Api(api_err),
        Err(e) => return Err(e),
    };

    // Deleted between create and get: surface the conflict so the pass is retried
    let Some(existing) = client.get(&child.api, &namespace, &name).await? else {
        return Err(conflict);
    };

    if !needs_replace(&desired, &existing) {
        debug!(kind = %child.api.kind, %name, "Child record unchanged");
        return Ok(ApplyOutcome::Unchanged);
    }

    client
        .replace(&child.api, &namespace, &replacement(&desired, &existing))
        .await?;
    debug!(kind = %child.api.kind, %name, "Updated child record");
    Ok(ApplyOutcome::Updated)
}

/// `object` with its spec recorded under [`LAST_APPLIED`]
pub fn stamped(object: &DynamicObject) -> DynamicObject {
    let mut out = object.clone();
    if let Some(spec) = object.data.get("spec") {
        out.annotations_mut()
            .insert(LAST_APPLIED.to_string(), spec.to_string());
    }
    out
}

/// The spec recorded under [`LAST_APPLIED`], `None` when absent or unreadable
pub fn last_applied(object: &DynamicObject) -> Option<Value> {
    object
        .annotations()
        .get(LAST_APPLIED)
        .and_then(|raw| serde_json::from_str(raw).ok())
}

/// Whether `existing` has to be replaced to carry the stamped `desired` object.
///
/// A field dropped from the desired spec is still present in the recorded
/// spec, so removals count as drift even though the stored object keeps the
/// old value.
pub fn needs_replace(desired: &DynamicObject, existing: &DynamicObject) -> bool {
    last_applied(existing).as_ref() != desired.data.get("spec")
        || !is_subset(&desired_view(desired), &desired_view(existing))
}

/// The object written over `existing`: `desired` at the stored resourceVersion
pub fn replacement(desired: &DynamicObject, existing: &DynamicObject) -> DynamicObject {
    let mut out = desired.clone();
    out.metadata.resource_version = existing.metadata.resource_version.clone();
    out.metadata.labels = merged(&existing.metadata.labels, &desired.metadata.labels);
    out.metadata.annotations = merged(&existing.metadata.annotations, &desired.metadata.annotations);
    out
}

/// The parts of an object this operator owns
fn desired_view(object: &DynamicObject) -> Value {
    serde_json::json!({
        "labels": object.metadata.labels,
        "annotations": object.metadata.annotations,
        "ownerReferences": object.metadata.owner_references,
        "spec": object.data.get("spec"),
    })
}

fn merged(
    existing: &Option<std::collections::BTreeMap<String, String>>,
    desired: &Option<std::collections::BTreeMap<String, String>>,
) -> Option<std::collections::BTreeMap<String, String>> {
    match (existing, desired) {
        (None, None) => None,
        (existing, desired) => {
            let mut out = existing.clone().unwrap_or_default();
            out.extend(desired.clone().unwrap_or_default());
            Some(out)
        }
    }
}

/// Whether every value in `desired` appears with the same value in `actual`.
///
/// Objects are compared key by key so that fields defaulted by the server do
/// not count as drift. Arrays and scalars must match exactly; a `null` in
/// `desired` matches a missing key.
pub fn is_subset(desired: &Value, actual: &Value) -> bool {
    match (desired, actual) {
        (Value::Null, _) => true,
        (Value::Object(d), Value::Object(a)) => d
            .iter()
            .all(|(k, v)| is_subset(v, a.get(k).unwrap_or(&Value::Null))),
        (Value::Object(d), Value::Null) => d.values().all(|v| is_subset(v, &Value::Null)),
        (d, a) => d == a,
    }
}
