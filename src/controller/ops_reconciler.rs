//! Reconciliation logic for OpsRequest resources
//!
//! An OpsRequest moves Pending -> Running -> {Succeeded | Failed}. It is
//! dispatched to the delegate exactly once; the `Dispatched` entry in the
//! action log records that it happened. After that every pass only polls the
//! delegate for progress.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::validation::{select_engine, validate_capability, validate_payload};
use crate::crd::{
    ActionLogEntry, ActionStatus, DatabaseCluster, DatabaseEngine, OpsPhase, OpsRequest,
    OpsRequestStatus, Operation,
};
use crate::delegate::OperationsHandler;
use crate::health::OPS_CONTROLLER;

/// What to do with a finished OpsRequest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtlDecision {
    /// The TTL has run out
    Delete,
    /// Check again after this long
    Wait(Duration),
    /// No TTL; keep the record
    Retain,
}

/// Decide whether a terminal OpsRequest should be deleted yet.
///
/// A record without a TTL, or without a readable completion time, is kept.
/// Negative TTLs count as zero.
pub fn ttl_decision(
    ttl_seconds: Option<i64>,
    completion_time: Option<&str>,
    now: DateTime<Utc>,
) -> TtlDecision {
    let Some(ttl) = ttl_seconds else {
        return TtlDecision::Retain;
    };
    let Some(completed) = completion_time
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
    else {
        return TtlDecision::Retain;
    };
    let Some(deadline) =
        TimeDelta::try_seconds(ttl.max(0)).and_then(|ttl| completed.checked_add_signed(ttl))
    else {
        return TtlDecision::Retain;
    };

    if now >= deadline {
        TtlDecision::Delete
    } else {
        TtlDecision::Wait((deadline - now).to_std().unwrap_or_default())
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Terminal status for an operation that cannot proceed
pub fn failed_status(
    current: &OpsRequestStatus,
    ops: &OpsRequest,
    message: String,
    now: &str,
) -> OpsRequestStatus {
    let mut status = current.clone();
    status.action_log.push(ActionLogEntry {
        timestamp: now.to_string(),
        action: ops.spec.type_.to_string(),
        status: ActionStatus::Failed,
        message: Some(message.clone()),
    });
    status.phase = OpsPhase::Failed;
    status.message = Some(message);
    status.completion_time = Some(now.to_string());
    status
}

/// Fold a delegate-reported status into the current one.
///
/// The phase never moves backwards, the action log only grows, the start
/// time is carried over, and completionTime is set exactly when the phase
/// is terminal.
pub fn merge_reported(
    current: &OpsRequestStatus,
    reported: OpsRequestStatus,
    now: &str,
) -> OpsRequestStatus {
    let mut next = reported;
    if !current.phase.can_transition_to(next.phase) {
        next.phase = current.phase;
    }
    if next.start_time.is_none() {
        next.start_time = current.start_time.clone();
    }
    if !next.action_log.starts_with(&current.action_log) {
        let added: Vec<ActionLogEntry> = next
            .action_log
            .into_iter()
            .filter(|entry| !current.action_log.contains(entry))
            .collect();
        next.action_log = current.action_log.clone();
        next.action_log.extend(added);
    }
    if next.phase.is_terminal() {
        if next.completion_time.is_none() {
            next.completion_time = Some(now.to_string());
        }
    } else {
        next.completion_time = None;
    }
    next
}

/// Main reconciliation function
#[instrument(skip(ops, ctx), fields(name = %ops.name_any(), namespace = ops.namespace().unwrap_or_default()))]
pub async fn reconcile_ops(ops: Arc<OpsRequest>, ctx: Arc<Context>) -> Result<Action> {
    let ns = ops.namespace().unwrap_or_default();
    let name = ops.name_any();
    let started = Instant::now();

    let result = reconcile_pass(&ns, &name, &ctx, Utc::now()).await;

    if let Some(health) = &ctx.health {
        match &result {
            Ok(_) => {
                health.metrics.record_reconcile(
                    OPS_CONTROLLER,
                    &ns,
                    &name,
                    started.elapsed().as_secs_f64(),
                );
                health.mark_reconciled();
            }
            Err(_) => health.metrics.record_error(OPS_CONTROLLER, &ns, &name),
        }
    }
    result
}

async fn reconcile_pass(ns: &str, name: &str, ctx: &Context, now: DateTime<Utc>) -> Result<Action> {
    let Some(ops) = ctx.records.get_ops(ns, name).await? else {
        debug!("OpsRequest no longer exists");
        return Ok(Action::await_change());
    };
    let current = ops.status.clone().unwrap_or_default();
    let now_str = format_time(now);

    if current.phase.is_terminal() {
        return finished(&ops, &current, ctx, now).await;
    }

    let cluster_name = ops.spec.cluster_ref.name.clone();
    let Some(cluster) = ctx.records.get_cluster(ns, &cluster_name).await? else {
        return fail(
            &ops,
            &current,
            format!("target cluster not found: {cluster_name}"),
            ctx,
            now,
        )
        .await;
    };

    let delegate = match ctx.delegates.resolve(&cluster.spec.engine.type_) {
        Ok(delegate) => delegate,
        Err(e) => {
            return fail(&ops, &current, format!("unable to get provider: {e}"), ctx, now).await;
        }
    };
    let handler = delegate.operations();

    let (mut ops, mut current) = if current.phase == OpsPhase::Pending {
        let running = OpsRequestStatus {
            phase: OpsPhase::Running,
            start_time: Some(now_str.clone()),
            message: Some(format!("{} started", ops.spec.type_)),
            ..current
        };
        info!(ops_type = %ops.spec.type_, cluster = %cluster_name, "Operation started");
        let updated = ctx.records.replace_ops_status(&ops, &running).await?;
        (updated, running)
    } else {
        (ops, current)
    };

    if !current.is_dispatched() {
        let engines = ctx.records.list_engines().await?;
        if let Err(e) = dispatch(&ops, &cluster, &engines, handler.as_ref()).await {
            return fail(&ops, &current, e.to_string(), ctx, now).await;
        }
        current.action_log.push(ActionLogEntry {
            timestamp: now_str.clone(),
            action: ops.spec.type_.to_string(),
            status: ActionStatus::Dispatched,
            message: None,
        });
        info!(ops_type = %ops.spec.type_, "Operation dispatched");
        ops = ctx.records.replace_ops_status(&ops, &current).await?;
    }

    let reported = match handler.status(&cluster, &ops).await {
        Ok(reported) => reported,
        Err(e) => {
            warn!("Failed to read operation progress: {}", e);
            return Ok(Action::requeue(ctx.config.ops_poll));
        }
    };

    let next = merge_reported(&current, reported, &now_str);
    if next != current {
        debug!(phase = %next.phase, "Writing operation status");
        ctx.records.replace_ops_status(&ops, &next).await?;
        if next.phase.is_terminal() {
            info!(ops_type = %ops.spec.type_, phase = %next.phase, "Operation finished");
            record_outcome(ctx, &ops, next.phase);
        }
    }

    if next.phase.is_terminal() {
        Ok(after_terminal(&ops, next.completion_time.as_deref(), now))
    } else {
        Ok(Action::requeue(ctx.config.ops_poll))
    }
}

/// Validate the operation against its payload and the engine catalog, then
/// hand it to the delegate.
///
/// Nothing reaches the delegate unless every check passes.
async fn dispatch(
    ops: &OpsRequest,
    cluster: &DatabaseCluster,
    engines: &[DatabaseEngine],
    handler: &dyn OperationsHandler,
) -> Result<()> {
    let op = ops
        .spec
        .operation()
        .map_err(|e| Error::ValidationError(e.to_string()))?;
    validate_payload(&op)?;

    let engine = &cluster.spec.engine;
    if let Some(entry) = select_engine(engines, &engine.type_, engine.engine_ref.as_deref()) {
        validate_capability(&op, &entry.spec)?;
    }

    match op {
        Operation::Start => handler.start(cluster).await,
        Operation::Stop => handler.stop(cluster).await,
        Operation::Restart => handler.restart(cluster).await,
        Operation::Switchover(spec) => handler.switchover(cluster, spec).await,
        Operation::HorizontalScaling(spec) => handler.horizontal_scaling(cluster, spec).await,
        Operation::VerticalScaling(spec) => handler.vertical_scaling(cluster, spec).await,
        Operation::VolumeExpansion(spec) => handler.volume_expansion(cluster, spec).await,
        Operation::Reconfiguring(spec) => handler.reconfigure(cluster, spec).await,
        Operation::Upgrade(spec) => handler.upgrade(cluster, spec).await,
        Operation::Backup(_) => handler.backup(cluster, ops).await,
        Operation::Restore(spec) => handler.restore(cluster, spec).await,
        Operation::Expose(spec) => handler.expose(cluster, spec).await,
        Operation::RebuildInstance(spec) => handler.rebuild_instance(cluster, spec).await,
        Operation::Custom(spec) => handler.custom(cluster, spec).await,
    }?;
    Ok(())
}

/// Write a Failed status and stop working on the operation
async fn fail(
    ops: &OpsRequest,
    current: &OpsRequestStatus,
    message: String,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action> {
    warn!(ops_type = %ops.spec.type_, "Operation failed: {}", message);
    let status = failed_status(current, ops, message, &format_time(now));
    ctx.records.replace_ops_status(ops, &status).await?;
    record_outcome(ctx, ops, OpsPhase::Failed);
    Ok(after_terminal(ops, status.completion_time.as_deref(), now))
}

/// Apply the TTL to an operation that already finished
async fn finished(
    ops: &OpsRequest,
    current: &OpsRequestStatus,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action> {
    let ttl = ops.spec.ttl_seconds_after_finished;
    match ttl_decision(ttl, current.completion_time.as_deref(), now) {
        TtlDecision::Delete => {
            info!("TTL expired, deleting OpsRequest {}", ops.name_any());
            ctx.records.delete_ops(ops).await?;
            Ok(Action::await_change())
        }
        TtlDecision::Wait(remaining) => Ok(Action::requeue(remaining)),
        TtlDecision::Retain => Ok(Action::await_change()),
    }
}

fn after_terminal(ops: &OpsRequest, completion_time: Option<&str>, now: DateTime<Utc>) -> Action {
    match ttl_decision(ops.spec.ttl_seconds_after_finished, completion_time, now) {
        TtlDecision::Wait(remaining) => Action::requeue(remaining),
        // The next pass sees the terminal phase and deletes
        TtlDecision::Delete => Action::requeue(Duration::from_secs(1)),
        TtlDecision::Retain => Action::await_change(),
    }
}

fn record_outcome(ctx: &Context, ops: &OpsRequest, phase: OpsPhase) {
    if let Some(health) = &ctx.health {
        health
            .metrics
            .record_operation(&ops.spec.type_.to_string(), &phase.to_string());
    }
}

/// Error policy for the OpsRequest controller
pub fn ops_error_policy(ops: Arc<OpsRequest>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = ops.name_any();
    let delay = BackoffConfig::default().delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {}, requeuing in {:?}",
            name, error, delay
        );
    }

    Action::requeue(delay)
}
