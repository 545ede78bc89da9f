//! Maps CloudNativePG observed state onto the unified cluster status

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube::api::DynamicObject;

use super::applier::external_service_name;
use super::model::{
    BACKUP_COMPLETED, BackupRequestStatus, ClusterStatus, PoolerSpec, PoolerStatus, section,
};
use crate::crd::{
    BackupStatus, ClusterPhase, DatabaseCluster, DatabaseClusterStatus, DatabaseStatus,
    Endpoints, ExposeType, MonitoringStatus, ProxyStatus,
};
use crate::delegate::DelegateResult;

/// Port the CloudNativePG instance manager exports metrics on
const METRICS_PORT: u16 = 9187;

/// Known CloudNativePG phase texts and their unified phase
const PHASES: &[(&str, ClusterPhase)] = &[
    ("Cluster in healthy state", ClusterPhase::Ready),
    ("Setting up primary", ClusterPhase::Initializing),
    ("Creating a new replica", ClusterPhase::Initializing),
    ("Waiting for the instances to become active", ClusterPhase::Initializing),
    ("Upgrading cluster", ClusterPhase::Updating),
    ("Cluster upgrade delayed", ClusterPhase::Updating),
    ("Switchover in progress", ClusterPhase::Updating),
    ("Failing over", ClusterPhase::Updating),
    ("Applying configuration", ClusterPhase::Updating),
    ("Promoting to primary cluster", ClusterPhase::Updating),
    ("Primary instance is being restarted in-place", ClusterPhase::Updating),
    ("Primary instance is being restarted without a switchover", ClusterPhase::Updating),
    ("Online upgrade in progress", ClusterPhase::Updating),
    ("Upgrading Postgres major version", ClusterPhase::Updating),
    ("Waiting for user action", ClusterPhase::Failed),
    ("Cluster is unrecoverable", ClusterPhase::Failed),
    ("Unable to create required cluster objects", ClusterPhase::Failed),
    (
        "Cluster cannot proceed to reconciliation due to an unknown image catalog",
        ClusterPhase::Failed,
    ),
];

/// Translate a child phase text. Unknown or empty phases map to Initializing.
pub fn map_phase(phase: &str) -> ClusterPhase {
    PHASES
        .iter()
        .find(|(text, _)| *text == phase)
        .map(|(_, unified)| *unified)
        .unwrap_or(ClusterPhase::Initializing)
}

/// Build the full unified status from the current child records.
///
/// `child` is the CloudNativePG cluster, `pooler` its read-write pooler if
/// one exists and `backups` the Backup records created for the cluster. The
/// result depends on nothing else.
pub fn map_status(
    cluster: &DatabaseCluster,
    child: Option<&DynamicObject>,
    pooler: Option<&DynamicObject>,
    backups: &[DynamicObject],
) -> DelegateResult<DatabaseClusterStatus> {
    let Some(child) = child else {
        return Ok(DatabaseClusterStatus {
            phase: ClusterPhase::Initializing,
            message: Some("waiting for the child cluster to be created".to_string()),
            ..Default::default()
        });
    };
    let observed: ClusterStatus = section(child, "status")?;
    let phase_text = observed.phase.clone().unwrap_or_default();
    let phase = map_phase(&phase_text);

    let roles: BTreeMap<String, String> = observed
        .instance_names
        .iter()
        .map(|instance| {
            let role = if observed.current_primary.as_deref() == Some(instance.as_str()) {
                "primary"
            } else {
                "replica"
            };
            (instance.clone(), role.to_string())
        })
        .collect();

    let name = cluster.name_any();
    let ns = cluster.namespace().unwrap_or_default();
    let external = cluster
        .spec
        .expose
        .as_ref()
        .filter(|e| e.type_ != ExposeType::ClusterIP)
        .map(|_| service_host(&external_service_name(&name), &ns));

    let database = DatabaseStatus {
        ready: phase == ClusterPhase::Ready
            && observed.instances > 0
            && observed.ready_instances == observed.instances,
        instances: observed.instances,
        ready_instances: observed.ready_instances,
        primary_instance: observed.current_primary.clone(),
        roles,
        endpoints: Endpoints {
            primary: Some(service_host(&format!("{name}-rw"), &ns)),
            replica: Some(service_host(&format!("{name}-ro"), &ns)),
            external,
        },
    };

    // Metrics are scraped only once the child itself carries the pod monitor
    let pod_monitor = child
        .data
        .pointer("/spec/monitoring/enablePodMonitor")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let monitoring = cluster.spec.monitoring.as_ref().map(|m| MonitoringStatus {
        enabled: m.enabled,
        ready: m.enabled && pod_monitor && observed.ready_instances > 0,
        endpoint: m
            .enabled
            .then(|| format!("{}:{METRICS_PORT}", service_host(&format!("{name}-rw"), &ns))),
    });

    let backup = backup_status(cluster, &observed, backups);
    let proxy = proxy_status(cluster, pooler)?;

    Ok(DatabaseClusterStatus {
        phase,
        database: Some(database),
        proxy,
        backup,
        monitoring,
        observed_generation: None,
        message: (!phase_text.is_empty()).then_some(phase_text),
        conditions: Vec::new(),
    })
}

fn service_host(service: &str, namespace: &str) -> String {
    format!("{service}.{namespace}.svc.cluster.local")
}

/// Normalize an RFC 3339 time to UTC, dropping values that do not parse
fn normalize_time(value: Option<&str>) -> Option<String> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc).to_rfc3339())
}

fn backup_status(
    cluster: &DatabaseCluster,
    observed: &ClusterStatus,
    backups: &[DynamicObject],
) -> Option<BackupStatus> {
    cluster.spec.backup.as_ref().filter(|b| b.enabled)?;
    Some(BackupStatus {
        last_backup_time: normalize_time(observed.last_successful_backup.as_deref()),
        first_recoverability_point: normalize_time(observed.first_recoverability_point.as_deref()),
        last_backup_name: latest_backup(backups),
    })
}

/// Name of the most recently finished completed backup
fn latest_backup(backups: &[DynamicObject]) -> Option<String> {
    backups
        .iter()
        .filter_map(|backup| {
            let status: BackupRequestStatus = section(backup, "status").ok()?;
            if status.phase.as_deref() != Some(BACKUP_COMPLETED) {
                return None;
            }
            let stopped = status
                .stopped_at
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok());
            Some((stopped, backup.name_any()))
        })
        .max()
        .map(|(_, name)| name)
}

fn proxy_status(
    cluster: &DatabaseCluster,
    pooler: Option<&DynamicObject>,
) -> DelegateResult<Option<ProxyStatus>> {
    let Some(proxy) = cluster.spec.proxy.as_ref().filter(|p| p.enabled) else {
        return Ok(None);
    };
    let Some(pooler) = pooler else {
        return Ok(Some(ProxyStatus {
            ready: false,
            replicas: proxy.replicas,
            ready_replicas: 0,
        }));
    };
    let spec: PoolerSpec = section(pooler, "spec")?;
    let status: PoolerStatus = section(pooler, "status")?;
    Ok(Some(ProxyStatus {
        ready: spec.instances > 0 && status.instances >= spec.instances,
        replicas: spec.instances,
        ready_replicas: status.instances,
    }))
}

/// Name of the read-write pooler this delegate reports on
pub fn pooler_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pooler-rw")
}
