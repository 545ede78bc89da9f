// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for the DBaaS operator
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. Operation phases never move backwards and the action log only grows
//! 2. The TTL decision matches the deadline arithmetic at every boundary
//! 3. Status replacement through a merge patch yields exactly the new status
//! 4. Unknown child phase text never reports a cluster as Ready
//! 5. Payload validation accepts exactly the documented replica and size ranges
//! 6. Writing a child record converges on the desired spec, removals included

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, TimeZone, Utc};
use kube::api::DynamicObject;
use proptest::prelude::*;
use serde_json::{Value, json};

use dbaas_operator::controller::ops_reconciler::{merge_reported, ttl_decision};
use dbaas_operator::controller::store::{apply_merge_patch, replacement_patch};
use dbaas_operator::controller::{MAX_REPLICAS, MIN_REPLICAS, TtlDecision, validate_payload};
use dbaas_operator::crd::{
    ActionLogEntry, ActionStatus, ClusterPhase, HorizontalScalingSpec, OpsPhase, OpsRequestStatus,
    Operation, VolumeExpansionSpec,
};
use dbaas_operator::delegate::cnpg::map_phase;
use dbaas_operator::delegate::cnpg::model::cluster_api;
use dbaas_operator::delegate::{needs_replace, replacement, stamped};

// =============================================================================
// Helper functions
// =============================================================================

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
}

fn log_entry(n: usize, status: ActionStatus) -> ActionLogEntry {
    ActionLogEntry {
        timestamp: rfc3339(base_time() + ChronoDuration::seconds(n as i64)),
        action: "Restart".to_string(),
        status,
        message: Some(format!("step {n}")),
    }
}

fn child(spec: Value) -> DynamicObject {
    let mut obj = DynamicObject::new("orders", &cluster_api()).within("shop");
    obj.data = json!({ "spec": spec });
    obj
}

// =============================================================================
// Strategy generators
// =============================================================================

fn ops_phase() -> impl Strategy<Value = OpsPhase> {
    prop_oneof![
        Just(OpsPhase::Pending),
        Just(OpsPhase::Running),
        Just(OpsPhase::Succeeded),
        Just(OpsPhase::Failed),
    ]
}

fn action_status() -> impl Strategy<Value = ActionStatus> {
    prop_oneof![
        Just(ActionStatus::Dispatched),
        Just(ActionStatus::InProgress),
        Just(ActionStatus::Succeeded),
        Just(ActionStatus::Failed),
    ]
}

fn action_log(max: usize) -> impl Strategy<Value = Vec<ActionLogEntry>> {
    prop::collection::vec(action_status(), 0..max).prop_map(|statuses| {
        statuses
            .into_iter()
            .enumerate()
            .map(|(n, status)| log_entry(n, status))
            .collect()
    })
}

fn ops_status() -> impl Strategy<Value = OpsRequestStatus> {
    (ops_phase(), action_log(5), any::<bool>()).prop_map(|(phase, action_log, started)| {
        OpsRequestStatus {
            phase,
            start_time: started.then(|| rfc3339(base_time())),
            completion_time: phase.is_terminal().then(|| rfc3339(base_time())),
            message: Some(phase.to_string()),
            action_log,
        }
    })
}

/// A status block of strings, numbers, nested objects and the odd null
fn status_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z]{0,8}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop::collection::btree_map("[a-e]", inner, 0..4)
            .prop_map(|map| Value::Object(map.into_iter().collect()))
    })
}

/// Objects without null members, the shape a serialized status has
fn serialized_status() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-e]", status_value(), 0..5)
        .prop_map(|map| strip_nulls(Value::Object(map.into_iter().collect())))
}

/// A flat child spec of short string settings
fn child_spec() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-f]", "[a-z]{0,4}", 0..6).prop_map(|map| {
        Value::Object(map.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
    })
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}

// =============================================================================
// Property-based tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: A merged phase is never earlier than the current one
    #[test]
    fn prop_merge_never_regresses_phase(current in ops_status(), reported in ops_status()) {
        let next = merge_reported(&current, reported.clone(), &rfc3339(base_time()));

        if current.phase.can_transition_to(reported.phase) {
            prop_assert_eq!(next.phase, reported.phase);
        } else {
            prop_assert_eq!(next.phase, current.phase);
        }
    }

    /// Property: The action log of a merge starts with the current log
    #[test]
    fn prop_merge_keeps_action_log(current in ops_status(), reported in ops_status()) {
        let next = merge_reported(&current, reported, &rfc3339(base_time()));
        prop_assert!(next.action_log.starts_with(&current.action_log));
    }

    /// Property: completionTime is set exactly when the merged phase is terminal
    #[test]
    fn prop_merge_completion_time_tracks_phase(current in ops_status(), reported in ops_status()) {
        let next = merge_reported(&current, reported, &rfc3339(base_time()));
        prop_assert_eq!(next.completion_time.is_some(), next.phase.is_terminal());
    }

    /// Property: Terminal phases absorb every report
    #[test]
    fn prop_terminal_phase_is_final(
        terminal in prop_oneof![Just(OpsPhase::Succeeded), Just(OpsPhase::Failed)],
        reported in ops_status()
    ) {
        let current = OpsRequestStatus {
            phase: terminal,
            completion_time: Some(rfc3339(base_time())),
            ..Default::default()
        };
        let next = merge_reported(&current, reported, &rfc3339(base_time()));
        prop_assert_eq!(next.phase, terminal);
    }

    /// Property: A request is deleted exactly once `now` reaches completion + ttl
    #[test]
    fn prop_ttl_boundary(ttl in 0i64..86_400, elapsed in 0i64..172_800) {
        let completed = base_time();
        let now = completed + ChronoDuration::seconds(elapsed);
        let decision = ttl_decision(Some(ttl), Some(&rfc3339(completed)), now);

        if elapsed >= ttl {
            prop_assert_eq!(decision, TtlDecision::Delete);
        } else {
            let remaining = std::time::Duration::from_secs((ttl - elapsed) as u64);
            prop_assert_eq!(decision, TtlDecision::Wait(remaining));
        }
    }

    /// Property: Negative TTLs behave like zero
    #[test]
    fn prop_negative_ttl_deletes(ttl in i64::MIN..0) {
        let completed = rfc3339(base_time());
        prop_assert_eq!(
            ttl_decision(Some(ttl), Some(&completed), base_time()),
            TtlDecision::Delete
        );
    }

    /// Property: Without a TTL nothing is ever deleted
    #[test]
    fn prop_no_ttl_retains(elapsed in 0i64..10_000_000) {
        let now = base_time() + ChronoDuration::seconds(elapsed);
        prop_assert_eq!(
            ttl_decision(None, Some(&rfc3339(base_time())), now),
            TtlDecision::Retain
        );
    }

    /// Property: Patching the old status with the replacement patch yields the new one
    #[test]
    fn prop_replacement_patch_yields_new(old in serialized_status(), new in serialized_status()) {
        let patch = replacement_patch(&old, &new);
        let mut patched = old.clone();
        apply_merge_patch(&mut patched, &patch);
        prop_assert_eq!(patched, new);
    }

    /// Property: One write brings a child from any earlier spec to the desired one
    #[test]
    fn prop_child_write_converges(
        first in child_spec(),
        second in child_spec(),
        defaults in child_spec()
    ) {
        let mut stored = stamped(&child(first.clone()));
        // Fields the child system fills in on its own
        if let (Some(spec), Value::Object(defaults)) = (stored.data["spec"].as_object_mut(), defaults) {
            for (k, v) in defaults {
                spec.entry(k).or_insert(v);
            }
        }

        let desired = stamped(&child(second.clone()));
        if needs_replace(&desired, &stored) {
            stored = replacement(&desired, &stored);
        }

        prop_assert!(!needs_replace(&desired, &stored));
        for (k, v) in second.as_object().unwrap() {
            prop_assert_eq!(&stored.data["spec"][k], v);
        }
        for k in first.as_object().unwrap().keys() {
            if second.get(k).is_none() {
                prop_assert!(stored.data["spec"].get(k).is_none(), "{} left behind", k);
            }
        }
    }

    /// Property: Phase text outside the known table never maps to Ready
    #[test]
    fn prop_unknown_phase_never_ready(text in "[a-zA-Z ]{0,40}") {
        prop_assume!(text != "Cluster in healthy state");
        prop_assert_ne!(map_phase(&text), ClusterPhase::Ready);
    }

    /// Property: Replica counts inside the limits are accepted, all others rejected
    #[test]
    fn prop_replica_limits(replicas in -50i32..200) {
        let spec = HorizontalScalingSpec { replicas };
        let result = validate_payload(&Operation::HorizontalScaling(&spec));
        let in_range = (MIN_REPLICAS..=MAX_REPLICAS).contains(&replicas);
        prop_assert_eq!(result.is_ok(), in_range, "replicas {}", replicas);
    }

    /// Property: Volume sizes need a whole number and a binary suffix
    #[test]
    fn prop_volume_size_format(n in 1u32..10_000, suffix in prop_oneof![
        Just("Mi"), Just("Gi"), Just("Ti"), Just("GB"), Just("g"), Just("")
    ]) {
        let spec = VolumeExpansionSpec { size: format!("{n}{suffix}") };
        let result = validate_payload(&Operation::VolumeExpansion(&spec));
        let valid = matches!(suffix, "Mi" | "Gi" | "Ti");
        prop_assert_eq!(result.is_ok(), valid, "size {}", spec.size);
    }
}

// =============================================================================
// Edge cases
// =============================================================================

mod edge_case_tests {
    use super::*;

    #[test]
    fn test_ttl_with_unparsable_completion_is_retained() {
        assert_eq!(
            ttl_decision(Some(0), Some("yesterday"), base_time()),
            TtlDecision::Retain
        );
        assert_eq!(ttl_decision(Some(0), None, base_time()), TtlDecision::Retain);
    }

    #[test]
    fn test_ttl_overflow_is_retained() {
        assert_eq!(
            ttl_decision(Some(i64::MAX), Some(&rfc3339(base_time())), base_time()),
            TtlDecision::Retain
        );
    }

    #[test]
    fn test_empty_phase_is_initializing() {
        assert_eq!(map_phase(""), ClusterPhase::Initializing);
    }

    #[test]
    fn test_replacement_patch_removes_dropped_fields() {
        let old = json!({"phase": "Ready", "message": "ok", "database": {"ready": true}});
        let new = json!({"phase": "Deleting"});
        let mut patched = old.clone();
        apply_merge_patch(&mut patched, &replacement_patch(&old, &new));
        assert_eq!(patched, new);
    }
}
