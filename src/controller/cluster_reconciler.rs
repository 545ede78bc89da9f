//! Reconciliation logic for DatabaseCluster resources
//!
//! A pass re-reads the record, resolves the engine delegate, and then either
//! tears the child down (deletion) or builds, applies and reports on it. The
//! pass is level-triggered: it does not depend on which event woke it up.

use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::status::{deleting_status, finalize_status, spec_changed};
use crate::crd::DatabaseCluster;
use crate::delegate::{ApplyOutcome, Delegate, run_pipeline};
use crate::health::CLUSTER_CONTROLLER;

/// Finalizer name for cleanup
pub const FINALIZER: &str = "dbaas.io/finalizer";

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile_cluster(cluster: Arc<DatabaseCluster>, ctx: Arc<Context>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let started = Instant::now();

    let result = reconcile_pass(&ns, &name, &ctx).await;

    if let Some(health) = &ctx.health {
        match &result {
            Ok(_) => {
                health.metrics.record_reconcile(
                    CLUSTER_CONTROLLER,
                    &ns,
                    &name,
                    started.elapsed().as_secs_f64(),
                );
                health.mark_reconciled();
            }
            Err(_) => health.metrics.record_error(CLUSTER_CONTROLLER, &ns, &name),
        }
    }
    result
}

async fn reconcile_pass(ns: &str, name: &str, ctx: &Context) -> Result<Action> {
    // The cached object may be stale; always work from a fresh read
    let Some(cluster) = ctx.records.get_cluster(ns, name).await? else {
        debug!("DatabaseCluster no longer exists");
        return Ok(Action::await_change());
    };

    let delegate = ctx.delegates.resolve(&cluster.spec.engine.type_)?;

    if let Some(delay) = delegate.pre_reconcile(&cluster).await? {
        info!("Delegate asked to postpone reconciliation for {:?}", delay);
        return Ok(Action::requeue(delay));
    }

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, delegate.as_ref(), ctx).await;
    }

    let cluster = if has_finalizer(&cluster) {
        cluster
    } else {
        add_finalizer(&cluster, ctx).await?
    };

    if spec_changed(&cluster) {
        info!(
            "Spec changed (generation: {:?} -> {:?})",
            cluster.status.as_ref().and_then(|s| s.observed_generation),
            cluster.metadata.generation
        );
    }

    let child = run_pipeline(delegate.applier(&cluster).await?)?;
    match delegate.apply(&child).await? {
        ApplyOutcome::Created => info!("Created child record"),
        ApplyOutcome::Updated => info!("Updated child record"),
        ApplyOutcome::Unchanged => debug!("Child record already up to date"),
    }

    let reported = delegate.status(&cluster).await?;
    let status = finalize_status(&cluster, reported, &now());
    if cluster.status.as_ref() != Some(&status) {
        debug!(phase = %status.phase, "Writing cluster status");
        ctx.records.replace_cluster_status(&cluster, &status).await?;
    }

    Ok(Action::requeue(ctx.config.cluster_resync))
}

/// Error policy for the cluster controller
pub fn cluster_error_policy(
    cluster: Arc<DatabaseCluster>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    let name = cluster.name_any();
    let backoff = BackoffConfig::default();

    // Attempts are not tracked across passes
    let delay = backoff.delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

fn has_finalizer(cluster: &DatabaseCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add the finalizer, keeping any others, and return the updated record
async fn add_finalizer(cluster: &DatabaseCluster, ctx: &Context) -> Result<DatabaseCluster> {
    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let updated = ctx
        .records
        .set_cluster_finalizers(cluster, finalizers)
        .await?;
    info!("Added finalizer to {}", cluster.name_any());
    Ok(updated)
}

/// Tear down the child and release the record
async fn handle_deletion(
    cluster: &DatabaseCluster,
    delegate: &dyn Delegate,
    ctx: &Context,
) -> Result<Action> {
    let name = cluster.name_any();
    if !has_finalizer(cluster) {
        debug!("No finalizer on {}, nothing to clean up", name);
        return Ok(Action::await_change());
    }
    info!("Handling deletion of {}", name);

    // Best effort; the record is going away either way
    let status = deleting_status(cluster, &now());
    let cluster = if cluster.status.as_ref() == Some(&status) {
        cluster.clone()
    } else {
        match ctx.records.replace_cluster_status(cluster, &status).await {
            Ok(updated) => updated,
            Err(e) => {
                debug!("Failed to write Deleting status for {}: {}", name, e);
                cluster.clone()
            }
        }
    };

    delegate.cleanup(&cluster).await?;

    let remaining: Vec<String> = cluster
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    ctx.records
        .set_cluster_finalizers(&cluster, remaining)
        .await?;

    info!("Removed finalizer from {}", name);
    Ok(Action::await_change())
}
