use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::common::{ConfigParameter, LocalObjectReference, ResourceRequirements};
use super::database_cluster::ExposeSpec;

/// OpsRequest is a one-shot day-2 operation against an existing DatabaseCluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "dbaas.io",
    version = "v1",
    kind = "OpsRequest",
    plural = "opsrequests",
    shortname = "ops",
    namespaced,
    status = "OpsRequestStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterRef.name"}"#,
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestSpec {
    /// Target cluster in the same namespace
    pub cluster_ref: LocalObjectReference,

    #[serde(rename = "type")]
    pub type_: OpsType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switchover: Option<SwitchoverSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_scaling: Option<HorizontalScalingSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_scaling: Option<VerticalScalingSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_expansion: Option<VolumeExpansionSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconfiguring: Option<ReconfiguringSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupOpsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<ExposeSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild_instance: Option<RebuildInstanceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomOpsSpec>,

    /// Delete the record this many seconds after it reaches a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i64>,
}

/// The closed set of supported operation types
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum OpsType {
    Start,
    Stop,
    Restart,
    Switchover,
    HorizontalScaling,
    VerticalScaling,
    VolumeExpansion,
    Reconfiguring,
    Upgrade,
    Backup,
    Restore,
    Expose,
    RebuildInstance,
    Custom,
}

impl OpsType {
    pub const ALL: [OpsType; 14] = [
        OpsType::Start,
        OpsType::Stop,
        OpsType::Restart,
        OpsType::Switchover,
        OpsType::HorizontalScaling,
        OpsType::VerticalScaling,
        OpsType::VolumeExpansion,
        OpsType::Reconfiguring,
        OpsType::Upgrade,
        OpsType::Backup,
        OpsType::Restore,
        OpsType::Expose,
        OpsType::RebuildInstance,
        OpsType::Custom,
    ];

    /// Whether this type can only run with its payload set
    pub fn requires_payload(self) -> bool {
        !matches!(
            self,
            OpsType::Start | OpsType::Stop | OpsType::Restart | OpsType::Backup
        )
    }
}

impl std::fmt::Display for OpsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpsType::Start => "Start",
            OpsType::Stop => "Stop",
            OpsType::Restart => "Restart",
            OpsType::Switchover => "Switchover",
            OpsType::HorizontalScaling => "HorizontalScaling",
            OpsType::VerticalScaling => "VerticalScaling",
            OpsType::VolumeExpansion => "VolumeExpansion",
            OpsType::Reconfiguring => "Reconfiguring",
            OpsType::Upgrade => "Upgrade",
            OpsType::Backup => "Backup",
            OpsType::Restore => "Restore",
            OpsType::Expose => "Expose",
            OpsType::RebuildInstance => "RebuildInstance",
            OpsType::Custom => "Custom",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwitchoverSpec {
    /// Instance to promote; the delegate picks a replica when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_instance: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScalingSpec {
    pub replicas: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerticalScalingSpec {
    pub resources: ResourceRequirements,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeExpansionSpec {
    pub size: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconfiguringSpec {
    pub config: Vec<ConfigParameter>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSpec {
    pub target_version: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupOpsSpec {
    /// Name of the backup record; defaults to the OpsRequest name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    pub backup_name: String,

    /// Recovery target time (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_in_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RebuildInstanceSpec {
    pub instance_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_instance: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomOpsSpec {
    pub operation: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Problems with the payload of an OpsRequest, detected before dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("operation {0} requires its payload to be set")]
    Missing(OpsType),

    #[error("payload for {found} does not match operation type {declared}")]
    Mismatched { declared: OpsType, found: OpsType },
}

/// An operation together with its typed payload
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operation<'a> {
    Start,
    Stop,
    Restart,
    Switchover(&'a SwitchoverSpec),
    HorizontalScaling(&'a HorizontalScalingSpec),
    VerticalScaling(&'a VerticalScalingSpec),
    VolumeExpansion(&'a VolumeExpansionSpec),
    Reconfiguring(&'a ReconfiguringSpec),
    Upgrade(&'a UpgradeSpec),
    Backup(Option<&'a BackupOpsSpec>),
    Restore(&'a RestoreSpec),
    Expose(&'a ExposeSpec),
    RebuildInstance(&'a RebuildInstanceSpec),
    Custom(&'a CustomOpsSpec),
}

impl Operation<'_> {
    pub fn ops_type(&self) -> OpsType {
        match self {
            Operation::Start => OpsType::Start,
            Operation::Stop => OpsType::Stop,
            Operation::Restart => OpsType::Restart,
            Operation::Switchover(_) => OpsType::Switchover,
            Operation::HorizontalScaling(_) => OpsType::HorizontalScaling,
            Operation::VerticalScaling(_) => OpsType::VerticalScaling,
            Operation::VolumeExpansion(_) => OpsType::VolumeExpansion,
            Operation::Reconfiguring(_) => OpsType::Reconfiguring,
            Operation::Upgrade(_) => OpsType::Upgrade,
            Operation::Backup(_) => OpsType::Backup,
            Operation::Restore(_) => OpsType::Restore,
            Operation::Expose(_) => OpsType::Expose,
            Operation::RebuildInstance(_) => OpsType::RebuildInstance,
            Operation::Custom(_) => OpsType::Custom,
        }
    }
}

impl OpsRequestSpec {
    /// Types whose payload field is set on this spec
    pub fn payload_types(&self) -> Vec<OpsType> {
        let set = [
            (OpsType::Switchover, self.switchover.is_some()),
            (OpsType::HorizontalScaling, self.horizontal_scaling.is_some()),
            (OpsType::VerticalScaling, self.vertical_scaling.is_some()),
            (OpsType::VolumeExpansion, self.volume_expansion.is_some()),
            (OpsType::Reconfiguring, self.reconfiguring.is_some()),
            (OpsType::Upgrade, self.upgrade.is_some()),
            (OpsType::Backup, self.backup.is_some()),
            (OpsType::Restore, self.restore.is_some()),
            (OpsType::Expose, self.expose.is_some()),
            (OpsType::RebuildInstance, self.rebuild_instance.is_some()),
            (OpsType::Custom, self.custom.is_some()),
        ];
        set.into_iter()
            .filter_map(|(t, present)| present.then_some(t))
            .collect()
    }

    /// Convert the declared type and payload fields into a typed operation.
    ///
    /// At most one payload may be set and it must match the declared type.
    pub fn operation(&self) -> Result<Operation<'_>, PayloadError> {
        let declared = self.type_;
        if let Some(found) = self
            .payload_types()
            .into_iter()
            .find(|found| *found != declared)
        {
            return Err(PayloadError::Mismatched { declared, found });
        }

        let missing = PayloadError::Missing(declared);
        let op = match declared {
            OpsType::Start => Operation::Start,
            OpsType::Stop => Operation::Stop,
            OpsType::Restart => Operation::Restart,
            OpsType::Switchover => Operation::Switchover(self.switchover.as_ref().ok_or(missing)?),
            OpsType::HorizontalScaling => {
                Operation::HorizontalScaling(self.horizontal_scaling.as_ref().ok_or(missing)?)
            }
            OpsType::VerticalScaling => {
                Operation::VerticalScaling(self.vertical_scaling.as_ref().ok_or(missing)?)
            }
            OpsType::VolumeExpansion => {
                Operation::VolumeExpansion(self.volume_expansion.as_ref().ok_or(missing)?)
            }
            OpsType::Reconfiguring => {
                Operation::Reconfiguring(self.reconfiguring.as_ref().ok_or(missing)?)
            }
            OpsType::Upgrade => Operation::Upgrade(self.upgrade.as_ref().ok_or(missing)?),
            OpsType::Backup => Operation::Backup(self.backup.as_ref()),
            OpsType::Restore => Operation::Restore(self.restore.as_ref().ok_or(missing)?),
            OpsType::Expose => Operation::Expose(self.expose.as_ref().ok_or(missing)?),
            OpsType::RebuildInstance => {
                Operation::RebuildInstance(self.rebuild_instance.as_ref().ok_or(missing)?)
            }
            OpsType::Custom => Operation::Custom(self.custom.as_ref().ok_or(missing)?),
        };
        Ok(op)
    }
}

impl OpsRequest {
    /// Name of the backup a Backup operation creates.
    ///
    /// Falls back to the OpsRequest's own name when the payload has none.
    pub fn backup_name(&self) -> String {
        self.spec
            .backup
            .as_ref()
            .and_then(|b| b.backup_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.name_any())
    }
}

/// Observed state of an OpsRequest
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequestStatus {
    #[serde(default)]
    pub phase: OpsPhase,

    /// When the operation moved to Running (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    /// When the operation reached a terminal phase (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Append-only history of what happened to this operation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_log: Vec<ActionLogEntry>,
}

impl OpsRequestStatus {
    /// Whether the operation has already been handed to the delegate
    pub fn is_dispatched(&self) -> bool {
        self.action_log
            .iter()
            .any(|entry| entry.status == ActionStatus::Dispatched)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub timestamp: String,
    pub action: String,
    pub status: ActionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ActionStatus {
    Dispatched,
    InProgress,
    Succeeded,
    Failed,
}

/// Operation lifecycle phase: Pending -> Running -> {Succeeded | Failed}
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum OpsPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl OpsPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, OpsPhase::Succeeded | OpsPhase::Failed)
    }

    /// Whether writing `next` over `self` keeps the phase sequence valid.
    ///
    /// Staying in a non-terminal phase is allowed; nothing leaves a terminal phase.
    pub fn can_transition_to(self, next: OpsPhase) -> bool {
        match self {
            OpsPhase::Pending => true,
            OpsPhase::Running => next != OpsPhase::Pending,
            OpsPhase::Succeeded | OpsPhase::Failed => false,
        }
    }
}

impl std::fmt::Display for OpsPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpsPhase::Pending => write!(f, "Pending"),
            OpsPhase::Running => write!(f, "Running"),
            OpsPhase::Succeeded => write!(f, "Succeeded"),
            OpsPhase::Failed => write!(f, "Failed"),
        }
    }
}
