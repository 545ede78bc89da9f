//! Status and conditions for DatabaseCluster resources
//!
//! The delegate produces the engine-derived part of the status. The
//! controller adds what only it knows: observedGeneration and conditions.

use chrono::{SecondsFormat, Utc};

use crate::crd::{ClusterPhase, Condition, DatabaseCluster, DatabaseClusterStatus};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Cluster is ready to accept connections
    pub const READY: &str = "Ready";
    /// Cluster is moving towards its desired state
    pub const PROGRESSING: &str = "Progressing";
    /// The child system reports a state it cannot recover from on its own
    pub const DEGRADED: &str = "Degraded";
}

pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
    now: String,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self::from_existing(Vec::new(), generation)
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
            now: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Use a fixed transition time instead of the current time
    pub fn at(mut self, now: impl Into<String>) -> Self {
        self.now = now.into();
        self
    }

    /// Set a condition. The transition time only moves when the status changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = self.now.clone();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: self.now.clone(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::DEGRADED,
            bool_status(is_degraded),
            reason,
            message,
        )
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Check if the spec has changed since the status was last written
pub fn spec_changed(cluster: &DatabaseCluster) -> bool {
    let current = cluster.metadata.generation;
    let observed = cluster.status.as_ref().and_then(|s| s.observed_generation);
    match (current, observed) {
        (Some(current), Some(observed)) => current != observed,
        _ => true,
    }
}

/// Complete a delegate-reported status with the controller-owned fields.
///
/// Every delegate field is taken verbatim. `observedGeneration` never moves
/// backwards, and conditions are derived from the reported phase.
pub fn finalize_status(
    cluster: &DatabaseCluster,
    reported: DatabaseClusterStatus,
    now: &str,
) -> DatabaseClusterStatus {
    let previous = cluster.status.as_ref();
    let observed_generation = match (
        cluster.metadata.generation,
        previous.and_then(|s| s.observed_generation),
    ) {
        (Some(current), Some(prior)) => Some(current.max(prior)),
        (current, prior) => current.or(prior),
    };

    let message = reported.message.clone().unwrap_or_default();
    let existing = previous.map(|s| s.conditions.clone()).unwrap_or_default();
    let builder = ConditionBuilder::from_existing(existing, observed_generation).at(now);
    let conditions = match reported.phase {
        ClusterPhase::Ready => builder
            .ready(true, "ClusterReady", &message)
            .progressing(false, "Stable", "Cluster is stable")
            .degraded(false, "Healthy", "Cluster is healthy"),
        ClusterPhase::Initializing => builder
            .ready(false, "Initializing", &message)
            .progressing(true, "Initializing", &message)
            .degraded(false, "Healthy", "Cluster is healthy"),
        ClusterPhase::Updating => builder
            .ready(false, "Updating", &message)
            .progressing(true, "Updating", &message)
            .degraded(false, "Healthy", "Cluster is healthy"),
        ClusterPhase::Failed => builder
            .ready(false, "ClusterFailed", &message)
            .progressing(false, "ClusterFailed", &message)
            .degraded(true, "ClusterFailed", &message),
        ClusterPhase::Deleting => builder
            .ready(false, "Deleting", "Cluster is being deleted")
            .progressing(true, "Deleting", "Cluster is being deleted"),
    }
    .build();

    DatabaseClusterStatus {
        observed_generation,
        conditions,
        ..reported
    }
}

/// Status written while the child is being torn down
pub fn deleting_status(cluster: &DatabaseCluster, now: &str) -> DatabaseClusterStatus {
    let reported = DatabaseClusterStatus {
        phase: ClusterPhase::Deleting,
        message: Some("Cleaning up child resources".to_string()),
        ..cluster.status.clone().unwrap_or_default()
    };
    finalize_status(cluster, reported, now)
}
