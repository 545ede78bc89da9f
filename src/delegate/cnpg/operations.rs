//! Day-2 operations for CloudNativePG clusters
//!
//! Every operation except Backup edits the child Cluster record in place:
//! either a spec field (claimed through [`markers::claim_field`] so that the
//! next cluster pass keeps it) or one of the side-channel annotations.
//! Backup creates a separate `Backup` record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::applier::{
    LABEL_CLUSTER, external_service_name, image_name, managed_services, resource_requirements,
    set_pointer,
};
use super::markers;
use super::model::{
    BackupRequestSpec, BackupRequestStatus, CONDITION_READY, ClusterStatus, NamedReference,
    PHASE_HEALTHY, backup_api, cluster_api, section,
};
use super::status::map_phase;
use crate::crd::{
    ActionLogEntry, ActionStatus, ClusterPhase, CustomOpsSpec, DatabaseCluster, ExposeSpec,
    HorizontalScalingSpec, OpsPhase, OpsRequest, OpsRequestStatus, OpsType, RebuildInstanceSpec,
    ReconfiguringSpec, RestoreSpec, SwitchoverSpec, UpgradeSpec, VerticalScalingSpec,
    VolumeExpansionSpec,
};
use crate::delegate::child::is_subset;
use crate::delegate::{DelegateError, DelegateResult, DynamicClient, OperationsHandler};

const ENGINE: &str = "postgresql";

/// Label tying a child Backup record to the uid of the OpsRequest that created it
pub const LABEL_OPS_REQUEST: &str = "dbaas.io/ops-request";

/// Operations handler for the CloudNativePG delegate
pub struct CnpgOperations {
    client: Arc<dyn DynamicClient>,
    image_repository: String,
}

impl CnpgOperations {
    pub fn new(client: Arc<dyn DynamicClient>, image_repository: impl Into<String>) -> Self {
        Self {
            client,
            image_repository: image_repository.into(),
        }
    }

    async fn child(&self, cluster: &DatabaseCluster) -> DelegateResult<DynamicObject> {
        let name = cluster.name_any();
        let ns = cluster.namespace().unwrap_or_default();
        self.client
            .get(&cluster_api(), &ns, &name)
            .await?
            .ok_or(DelegateError::ChildNotFound(name))
    }

    async fn save(&self, cluster: &DatabaseCluster, child: &DynamicObject) -> DelegateResult<()> {
        let ns = cluster.namespace().unwrap_or_default();
        self.client.replace(&cluster_api(), &ns, child).await?;
        Ok(())
    }

    /// Overwrite one child spec field and record that an operation owns it
    async fn set_owned_field(
        &self,
        cluster: &DatabaseCluster,
        pointer: &str,
        value: Value,
    ) -> DelegateResult<()> {
        let mut child = self.child(cluster).await?;
        set_pointer(&mut child.data, pointer, value);
        markers::claim_field(&mut child, pointer, generation(cluster));
        self.save(cluster, &child).await
    }

    async fn set_marker(
        &self,
        cluster: &DatabaseCluster,
        key: &str,
        value: String,
    ) -> DelegateResult<()> {
        let mut child = self.child(cluster).await?;
        markers::set(&mut child, key, value);
        self.save(cluster, &child).await
    }
}

fn generation(cluster: &DatabaseCluster) -> i64 {
    cluster.metadata.generation.unwrap_or_default()
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl OperationsHandler for CnpgOperations {
    async fn start(&self, cluster: &DatabaseCluster) -> DelegateResult<()> {
        self.set_marker(cluster, markers::HIBERNATION, markers::HIBERNATION_OFF.to_string())
            .await
    }

    async fn stop(&self, cluster: &DatabaseCluster) -> DelegateResult<()> {
        self.set_marker(cluster, markers::HIBERNATION, markers::HIBERNATION_ON.to_string())
            .await
    }

    async fn restart(&self, cluster: &DatabaseCluster) -> DelegateResult<()> {
        self.set_marker(cluster, markers::RESTARTED_AT, now()).await
    }

    async fn switchover(
        &self,
        cluster: &DatabaseCluster,
        spec: &SwitchoverSpec,
    ) -> DelegateResult<()> {
        let mut child = self.child(cluster).await?;
        let observed: ClusterStatus = section(&child, "status")?;
        let target = switchover_target(&observed, spec.target_instance.as_deref())?;
        info!(cluster = %cluster.name_any(), %target, "Requesting switchover");

        markers::set(&mut child, markers::SWITCHOVER_TARGET, target);
        markers::set(&mut child, markers::FORCE_SWITCHOVER, now());
        self.save(cluster, &child).await
    }

    async fn horizontal_scaling(
        &self,
        cluster: &DatabaseCluster,
        spec: &HorizontalScalingSpec,
    ) -> DelegateResult<()> {
        if spec.replicas < 1 {
            return Err(DelegateError::Invalid(format!(
                "replicas must be at least 1, got {}",
                spec.replicas
            )));
        }
        self.set_owned_field(cluster, "/spec/instances", json!(spec.replicas))
            .await
    }

    async fn vertical_scaling(
        &self,
        cluster: &DatabaseCluster,
        spec: &VerticalScalingSpec,
    ) -> DelegateResult<()> {
        let resources = resource_requirements(Some(&spec.resources));
        self.set_owned_field(cluster, "/spec/resources", serde_json::to_value(resources)?)
            .await
    }

    async fn volume_expansion(
        &self,
        cluster: &DatabaseCluster,
        spec: &VolumeExpansionSpec,
    ) -> DelegateResult<()> {
        if spec.size.trim().is_empty() {
            return Err(DelegateError::Invalid("size must be set".to_string()));
        }
        self.set_owned_field(cluster, "/spec/storage/size", json!(spec.size))
            .await
    }

    async fn reconfigure(
        &self,
        cluster: &DatabaseCluster,
        spec: &ReconfiguringSpec,
    ) -> DelegateResult<()> {
        const POINTER: &str = "/spec/postgresql/parameters";
        let mut child = self.child(cluster).await?;

        let mut parameters = match child.data.pointer(POINTER) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => serde_json::Map::new(),
        };
        for p in &spec.config {
            parameters.insert(p.name.clone(), Value::String(p.value.clone()));
        }

        set_pointer(&mut child.data, POINTER, Value::Object(parameters));
        markers::claim_field(&mut child, POINTER, generation(cluster));
        self.save(cluster, &child).await
    }

    async fn upgrade(&self, cluster: &DatabaseCluster, spec: &UpgradeSpec) -> DelegateResult<()> {
        if spec.target_version.trim().is_empty() {
            return Err(DelegateError::Invalid(
                "targetVersion must be set".to_string(),
            ));
        }
        let image = image_name(&self.image_repository, &spec.target_version);
        self.set_owned_field(cluster, "/spec/imageName", json!(image))
            .await
    }

    async fn backup(&self, cluster: &DatabaseCluster, ops: &OpsRequest) -> DelegateResult<()> {
        let api = backup_api();
        let ns = cluster.namespace().unwrap_or_default();
        let backup_name = ops.backup_name();
        let owner = ops.uid().unwrap_or_default();

        let mut request = DynamicObject::new(&backup_name, &api).within(&ns);
        request.metadata.labels = Some(
            [
                (LABEL_CLUSTER.to_string(), cluster.name_any()),
                (LABEL_OPS_REQUEST.to_string(), owner.clone()),
            ]
            .into_iter()
            .collect(),
        );
        request.data = json!({
            "spec": serde_json::to_value(BackupRequestSpec {
                cluster: NamedReference { name: cluster.name_any() },
            })?
        });

        match self.client.create(&api, &ns, &request).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                // Ours only when an earlier dispatch of this same request created it
                let existing = self.client.get(&api, &ns, &backup_name).await?;
                let created_by = existing
                    .as_ref()
                    .and_then(|b| b.labels().get(LABEL_OPS_REQUEST).cloned());
                if created_by.as_deref() == Some(owner.as_str()) {
                    debug!(backup = %backup_name, "Backup request already exists");
                    Ok(())
                } else {
                    Err(DelegateError::Invalid(format!(
                        "backup {backup_name} already exists and belongs to another request"
                    )))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn restore(&self, cluster: &DatabaseCluster, spec: &RestoreSpec) -> DelegateResult<()> {
        if let Some(target) = spec.point_in_time.as_deref() {
            DateTime::parse_from_rfc3339(target).map_err(|e| {
                DelegateError::Invalid(format!("pointInTime {target:?} is not RFC 3339: {e}"))
            })?;
        }

        let mut recovery = json!({ "backup": { "name": spec.backup_name } });
        if let Some(target) = &spec.point_in_time {
            recovery["recoveryTarget"] = json!({ "targetTime": target });
        }

        let mut child = self.child(cluster).await?;
        set_pointer(&mut child.data, "/spec/bootstrap", json!({ "recovery": recovery }));
        self.save(cluster, &child).await
    }

    async fn expose(&self, cluster: &DatabaseCluster, spec: &ExposeSpec) -> DelegateResult<()> {
        let managed = match managed_services(&cluster.name_any(), spec) {
            Some(m) => serde_json::to_value(m)?,
            None => Value::Null,
        };
        self.set_owned_field(cluster, "/spec/managed", managed).await
    }

    async fn rebuild_instance(
        &self,
        cluster: &DatabaseCluster,
        spec: &RebuildInstanceSpec,
    ) -> DelegateResult<()> {
        let mut child = self.child(cluster).await?;
        let observed: ClusterStatus = section(&child, "status")?;
        let known = |name: &str| {
            observed.instance_names.is_empty() || observed.instance_names.iter().any(|n| n == name)
        };

        if !known(&spec.instance_name) {
            return Err(DelegateError::Invalid(format!(
                "instance {} is not part of cluster {}",
                spec.instance_name,
                cluster.name_any()
            )));
        }
        if let Some(source) = spec.source_instance.as_deref() {
            if source == spec.instance_name {
                return Err(DelegateError::Invalid(
                    "sourceInstance must differ from instanceName".to_string(),
                ));
            }
            if !known(source) {
                return Err(DelegateError::Invalid(format!(
                    "source instance {source} is not part of cluster {}",
                    cluster.name_any()
                )));
            }
            markers::set(&mut child, markers::REBUILD_SOURCE, source);
        }

        markers::set(&mut child, markers::REBUILD_INSTANCE, spec.instance_name.clone());
        self.save(cluster, &child).await
    }

    async fn custom(&self, _cluster: &DatabaseCluster, spec: &CustomOpsSpec) -> DelegateResult<()> {
        Err(DelegateError::unsupported(
            ENGINE,
            format!("custom operation {}", spec.operation),
        ))
    }

    async fn status(
        &self,
        cluster: &DatabaseCluster,
        ops: &OpsRequest,
    ) -> DelegateResult<OpsRequestStatus> {
        let current = ops.status.clone().unwrap_or_default();
        let ns = cluster.namespace().unwrap_or_default();

        let (phase, message) = if ops.spec.type_ == OpsType::Backup {
            let backup = self
                .client
                .get(&backup_api(), &ns, &ops.backup_name())
                .await?;
            backup_progress(backup.as_ref())?
        } else {
            let name = cluster.name_any();
            let child = self.client.get(&cluster_api(), &ns, &name).await?;
            let target_image = ops
                .spec
                .upgrade
                .as_ref()
                .map(|u| image_name(&self.image_repository, &u.target_version));
            let external_service = if ops.spec.type_ == OpsType::Expose {
                let api = ApiResource::erase::<Service>(&());
                self.client
                    .get(&api, &ns, &external_service_name(&name))
                    .await?
                    .is_some()
            } else {
                false
            };
            cluster_progress(
                ops,
                Observation {
                    child: child.as_ref(),
                    target_image: target_image.as_deref(),
                    external_service,
                },
            )?
        };

        Ok(next_status(&current, ops.spec.type_, phase, message, &now()))
    }
}

/// Pick the instance to promote. An explicit target must be a known replica.
fn switchover_target(observed: &ClusterStatus, requested: Option<&str>) -> DelegateResult<String> {
    let primary = observed.current_primary.as_deref();
    match requested {
        Some(target) if Some(target) == primary => Err(DelegateError::Invalid(format!(
            "instance {target} is already the primary"
        ))),
        Some(target)
            if !observed.instance_names.is_empty()
                && !observed.instance_names.iter().any(|n| n == target) =>
        {
            Err(DelegateError::Invalid(format!("unknown instance {target}")))
        }
        Some(target) => Ok(target.to_string()),
        None => observed
            .instance_names
            .iter()
            .find(|n| Some(n.as_str()) != primary)
            .cloned()
            .ok_or_else(|| DelegateError::Invalid("no replica available to promote".to_string())),
    }
}

/// Progress of a Backup operation, read from the child Backup record
pub fn backup_progress(backup: Option<&DynamicObject>) -> DelegateResult<(OpsPhase, String)> {
    let Some(backup) = backup else {
        return Ok((OpsPhase::Running, "waiting for backup to be created".to_string()));
    };
    let status: BackupRequestStatus = section(backup, "status")?;
    let phase = status.phase.unwrap_or_default();
    let progress = match phase.as_str() {
        "completed" => (OpsPhase::Succeeded, "backup completed".to_string()),
        "failed" => (
            OpsPhase::Failed,
            format!(
                "backup failed: {}",
                status.error.as_deref().unwrap_or("unknown error")
            ),
        ),
        "" => (OpsPhase::Running, "backup pending".to_string()),
        other => (OpsPhase::Running, format!("backup {other}")),
    };
    Ok(progress)
}

/// Child-system state read for one progress check
#[derive(Clone, Copy, Debug, Default)]
pub struct Observation<'a> {
    pub child: Option<&'a DynamicObject>,
    /// Image an Upgrade moves to
    pub target_image: Option<&'a str>,
    /// Whether the external Service an Expose manages exists
    pub external_service: bool,
}

/// Progress of every non-Backup operation, read from the child Cluster record.
///
/// Operations CloudNativePG carries out by rolling the instances only
/// succeed once the requested change is on the child and the child has been
/// seen leaving the healthy state since dispatch.
pub fn cluster_progress(
    ops: &OpsRequest,
    seen: Observation<'_>,
) -> DelegateResult<(OpsPhase, String)> {
    let Some(child) = seen.child else {
        return Ok((OpsPhase::Failed, "child cluster not found".to_string()));
    };
    let observed: ClusterStatus = section(child, "status")?;
    let phase_text = observed.phase.clone().unwrap_or_default();
    if map_phase(&phase_text) == ClusterPhase::Failed {
        return Ok((OpsPhase::Failed, format!("cluster failed: {phase_text}")));
    }

    let healthy = observed.is_healthy();
    let done = match ops.spec.type_ {
        OpsType::Stop => observed.is_hibernated(),
        OpsType::Start => !observed.is_hibernated() && healthy,
        OpsType::HorizontalScaling => {
            let target = ops.spec.horizontal_scaling.as_ref().map(|h| h.replicas);
            healthy
                && target == Some(observed.instances)
                && observed.ready_instances == observed.instances
        }
        OpsType::Upgrade => {
            healthy && seen.target_image.is_some() && observed.image.as_deref() == seen.target_image
        }
        OpsType::Switchover => {
            healthy
                && observed.current_primary.is_some()
                && observed.current_primary.as_deref() == markers::get(child, markers::SWITCHOVER_TARGET)
        }
        OpsType::Expose => {
            let wanted = ops
                .spec
                .expose
                .as_ref()
                .and_then(|e| managed_services(&ops.spec.cluster_ref.name, e))
                .is_some();
            healthy && seen.external_service == wanted
        }
        OpsType::Restart
        | OpsType::VerticalScaling
        | OpsType::VolumeExpansion
        | OpsType::Reconfiguring
        | OpsType::Restore
        | OpsType::RebuildInstance => {
            healthy && change_landed(ops, child, &observed) && rollout_observed(ops, &observed)
        }
        OpsType::Backup | OpsType::Custom => healthy,
    };

    if done {
        return Ok((OpsPhase::Succeeded, format!("{} completed", ops.spec.type_)));
    }
    let message = if phase_text.is_empty() {
        format!("{} in progress", ops.spec.type_)
    } else {
        phase_text
    };
    Ok((OpsPhase::Running, message))
}

/// Whether the child carries the change the operation asked for
fn change_landed(ops: &OpsRequest, child: &DynamicObject, observed: &ClusterStatus) -> bool {
    let spec = &ops.spec;
    let text = |pointer: &str| child.data.pointer(pointer).and_then(Value::as_str);
    match spec.type_ {
        OpsType::Restart => markers::get(child, markers::RESTARTED_AT).is_some(),
        OpsType::VerticalScaling => spec.vertical_scaling.as_ref().is_some_and(|v| {
            let actual = child.data.pointer("/spec/resources");
            serde_json::to_value(resource_requirements(Some(&v.resources)))
                .is_ok_and(|wanted| actual.is_some_and(|a| is_subset(&wanted, a)))
        }),
        OpsType::VolumeExpansion => {
            observed.resizing_pvc.is_empty()
                && spec
                    .volume_expansion
                    .as_ref()
                    .is_some_and(|v| text("/spec/storage/size") == Some(v.size.as_str()))
        }
        OpsType::Reconfiguring => spec.reconfiguring.as_ref().is_some_and(|r| {
            let applied = child.data.pointer("/spec/postgresql/parameters");
            r.config.iter().all(|p| {
                applied.and_then(|a| a.get(&p.name)).and_then(Value::as_str)
                    == Some(p.value.as_str())
            })
        }),
        OpsType::Restore => spec.restore.as_ref().is_some_and(|r| {
            text("/spec/bootstrap/recovery/backup/name") == Some(r.backup_name.as_str())
        }),
        OpsType::RebuildInstance => spec.rebuild_instance.as_ref().is_some_and(|r| {
            markers::get(child, markers::REBUILD_INSTANCE) == Some(r.instance_name.as_str())
        }),
        _ => true,
    }
}

/// Whether the child was seen leaving the healthy state after dispatch.
///
/// Either a poll recorded a phase other than healthy, or the child's Ready
/// condition last changed after the Dispatched entry.
fn rollout_observed(ops: &OpsRequest, observed: &ClusterStatus) -> bool {
    let Some(log) = ops.status.as_ref().map(|s| &s.action_log) else {
        return false;
    };
    let Some(at) = log
        .iter()
        .rposition(|e| e.status == ActionStatus::Dispatched)
    else {
        return false;
    };

    let left_healthy = log.iter().skip(at + 1).any(|e| {
        e.status == ActionStatus::InProgress
            && e.message.as_deref().is_some_and(|m| m != PHASE_HEALTHY)
    });
    let dispatched = log.get(at).and_then(|e| parse_time(&e.timestamp));
    let ready_changed = observed
        .condition(CONDITION_READY)
        .and_then(|c| c.last_transition_time.as_deref())
        .and_then(parse_time)
        .zip(dispatched)
        .is_some_and(|(changed, dispatched)| changed > dispatched);

    left_healthy || ready_changed
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Fold a progress observation into the current status.
///
/// The status is returned unchanged when neither phase nor message moved, so
/// repeated polls do not grow the action log.
pub fn next_status(
    current: &OpsRequestStatus,
    ops_type: OpsType,
    phase: OpsPhase,
    message: String,
    now: &str,
) -> OpsRequestStatus {
    if current.phase == phase && current.message.as_deref() == Some(message.as_str()) {
        return current.clone();
    }

    let mut next = current.clone();
    let entry_status = match phase {
        OpsPhase::Succeeded => ActionStatus::Succeeded,
        OpsPhase::Failed => ActionStatus::Failed,
        OpsPhase::Pending | OpsPhase::Running => ActionStatus::InProgress,
    };
    next.action_log.push(ActionLogEntry {
        timestamp: now.to_string(),
        action: ops_type.to_string(),
        status: entry_status,
        message: Some(message.clone()),
    });
    next.phase = phase;
    next.message = Some(message);
    if phase.is_terminal() && next.completion_time.is_none() {
        next.completion_time = Some(now.to_string());
    }
    next
}
