pub mod config;
pub mod controller;
pub mod crd;
pub mod delegate;
pub mod health;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, Result, cluster_error_policy, ops_error_policy,
    reconcile_cluster, reconcile_ops,
};
pub use crd::{BackupStorage, DatabaseCluster, DatabaseEngine, OpsRequest};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use crate::delegate::cnpg::model::cluster_api;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the DatabaseCluster controller.
///
/// Watches DatabaseCluster records in the configured scope together with the
/// CloudNativePG clusters they own, so child state changes wake the owner.
pub async fn run_cluster_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.watch_namespace.clone();
    tracing::info!(
        "Starting controller for DatabaseCluster resources (scope: {})",
        namespace.as_deref().unwrap_or("cluster-wide")
    );

    let ctx = Arc::new(Context::new(client.clone(), config, health_state));

    let clusters: Api<DatabaseCluster> = scoped_api(client.clone(), namespace.as_deref());
    let children: Api<DynamicObject> = match namespace.as_deref() {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &cluster_api()),
        None => Api::all_with(client.clone(), &cluster_api()),
    };

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(clusters, watcher_config.clone())
        .owns_with(children, cluster_api(), watcher_config)
        .run(reconcile_cluster, cluster_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled cluster: {}", obj.name);
                }
                Err(e) => {
                    // Watch events for a just-deleted object still trigger a
                    // pass that then finds nothing
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("DatabaseCluster no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("DatabaseCluster reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    tracing::error!("DatabaseCluster controller stream ended unexpectedly");
}

/// Run the OpsRequest controller.
///
/// Progress of a dispatched operation is polled on a timer rather than
/// watched, so only OpsRequest records themselves are watched here.
pub async fn run_ops_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.watch_namespace.clone();
    tracing::info!(
        "Starting controller for OpsRequest resources (scope: {})",
        namespace.as_deref().unwrap_or("cluster-wide")
    );

    let ctx = Arc::new(Context::new(client.clone(), config, health_state));
    let requests: Api<OpsRequest> = scoped_api(client, namespace.as_deref());

    Controller::new(requests, WatcherConfig::default().any_semantic())
        .run(reconcile_ops, ops_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled ops request: {}", obj.name);
                }
                Err(e) => {
                    // Watch events for a just-deleted object still trigger a
                    // pass that then finds nothing
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("OpsRequest no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("OpsRequest reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::error!("OpsRequest controller stream ended unexpectedly");
}
