//! OpsRequest passes against the CloudNativePG delegate

use std::sync::Arc;

use kube::runtime::controller::Action;
use serde_json::json;

use dbaas_operator::crd::{
    ActionStatus, CustomOpsSpec, DatabaseEngine, DatabaseEngineSpec, EngineFeatures, OpsPhase,
    OpsRequestStatus, OpsType, VolumeExpansionSpec,
};
use dbaas_operator::delegate::cnpg::markers;
use dbaas_operator::delegate::cnpg::model::{backup_api, cluster_api};
use dbaas_operator::{reconcile_cluster, reconcile_ops};

use crate::common::*;

const NS: &str = "shop";

async fn cluster_pass(env: &TestEnv, name: &str) {
    let cluster = env.records.cluster(NS, name).expect("cluster record");
    reconcile_cluster(Arc::new(cluster), env.ctx.clone())
        .await
        .expect("cluster pass to succeed");
}

async fn ops_pass(env: &TestEnv, name: &str) -> Action {
    let ops = env.records.ops(NS, name).expect("ops record");
    reconcile_ops(Arc::new(ops), env.ctx.clone())
        .await
        .expect("ops pass to succeed")
}

fn ops_status(env: &TestEnv, name: &str) -> OpsRequestStatus {
    env.records
        .ops(NS, name)
        .and_then(|o| o.status)
        .expect("ops status")
}

/// A cluster whose child reports healthy with `size` members
async fn ready_cluster(env: &TestEnv, name: &str, size: i32) {
    env.records.put_cluster(create_test_cluster(name, NS, size));
    cluster_pass(env, name).await;
    env.children
        .set_status(&cluster_api(), NS, name, healthy_child_status(name, size));
    cluster_pass(env, name).await;
}

fn dispatch_count(status: &OpsRequestStatus) -> usize {
    status
        .action_log
        .iter()
        .filter(|e| e.status == ActionStatus::Dispatched)
        .count()
}

#[tokio::test]
async fn test_horizontal_scaling_runs_to_completion() {
    let env = TestEnv::new();
    ready_cluster(&env, "orders", 3).await;
    env.records
        .put_ops(create_scaling_request("orders-scale", NS, "orders", 5));

    let action = ops_pass(&env, "orders-scale").await;
    assert_eq!(action, Action::requeue(env.ctx.config.ops_poll));

    let status = ops_status(&env, "orders-scale");
    assert_eq!(status.phase, OpsPhase::Running);
    assert!(status.start_time.is_some());
    assert_eq!(dispatch_count(&status), 1);

    let child = env.children.object(&cluster_api(), NS, "orders").unwrap();
    assert_eq!(child.data["spec"]["instances"], 5);

    // A cluster pass in between must not undo the operation
    cluster_pass(&env, "orders").await;
    let child = env.children.object(&cluster_api(), NS, "orders").unwrap();
    assert_eq!(child.data["spec"]["instances"], 5);

    // Still scaling: poll again without dispatching twice
    ops_pass(&env, "orders-scale").await;
    assert_eq!(dispatch_count(&ops_status(&env, "orders-scale")), 1);

    env.children
        .set_status(&cluster_api(), NS, "orders", healthy_child_status("orders", 5));
    let action = ops_pass(&env, "orders-scale").await;
    assert_eq!(action, Action::await_change());

    let status = ops_status(&env, "orders-scale");
    assert_eq!(status.phase, OpsPhase::Succeeded);
    assert!(status.completion_time.is_some());
    assert_eq!(dispatch_count(&status), 1);
    assert_eq!(
        status.action_log.last().map(|e| e.status),
        Some(ActionStatus::Succeeded)
    );
}

#[tokio::test]
async fn test_backup_defaults_to_request_name() {
    let env = TestEnv::new();
    ready_cluster(&env, "orders", 1).await;
    env.records
        .put_ops(create_ops_request("nightly", NS, "orders", OpsType::Backup));

    ops_pass(&env, "nightly").await;

    let backup = env
        .children
        .object(&backup_api(), NS, "nightly")
        .expect("backup request");
    assert_eq!(backup.data["spec"]["cluster"]["name"], json!("orders"));
    assert_eq!(ops_status(&env, "nightly").phase, OpsPhase::Running);

    env.children
        .set_status(&backup_api(), NS, "nightly", json!({"phase": "completed"}));
    ops_pass(&env, "nightly").await;

    let status = ops_status(&env, "nightly");
    assert_eq!(status.phase, OpsPhase::Succeeded);
    assert_eq!(status.message.as_deref(), Some("backup completed"));
}

#[tokio::test]
async fn test_recreated_request_does_not_adopt_old_backup() {
    let env = TestEnv::new();
    ready_cluster(&env, "orders", 1).await;
    env.records
        .put_ops(create_ops_request("nightly", NS, "orders", OpsType::Backup));
    ops_pass(&env, "nightly").await;
    env.children
        .set_status(&backup_api(), NS, "nightly", json!({"phase": "completed"}));
    ops_pass(&env, "nightly").await;
    assert_eq!(ops_status(&env, "nightly").phase, OpsPhase::Succeeded);

    // Deleted and submitted again under the same name
    let creates = env.children.creates();
    let mut again = create_ops_request("nightly", NS, "orders", OpsType::Backup);
    again.metadata.uid = Some("nightly-uid-2".to_string());
    env.records.put_ops(again);
    ops_pass(&env, "nightly").await;

    let status = ops_status(&env, "nightly");
    assert_eq!(status.phase, OpsPhase::Failed);
    assert!(status.message.unwrap().contains("belongs to another request"));
    assert_eq!(env.children.creates(), creates);
}

#[tokio::test]
async fn test_failed_backup_reports_error() {
    let env = TestEnv::new();
    ready_cluster(&env, "orders", 1).await;
    env.records
        .put_ops(create_ops_request("nightly", NS, "orders", OpsType::Backup));
    ops_pass(&env, "nightly").await;

    env.children.set_status(
        &backup_api(),
        NS,
        "nightly",
        json!({"phase": "failed", "error": "bucket unreachable"}),
    );
    ops_pass(&env, "nightly").await;

    let status = ops_status(&env, "nightly");
    assert_eq!(status.phase, OpsPhase::Failed);
    assert!(status.message.unwrap().contains("bucket unreachable"));
}

#[tokio::test]
async fn test_volume_expansion_waits_for_instances_to_roll() {
    let env = TestEnv::new();
    ready_cluster(&env, "orders", 3).await;
    let mut ops = create_ops_request("grow", NS, "orders", OpsType::VolumeExpansion);
    ops.spec.volume_expansion = Some(VolumeExpansionSpec {
        size: "100Gi".to_string(),
    });
    env.records.put_ops(ops);

    ops_pass(&env, "grow").await;
    let child = env.children.object(&cluster_api(), NS, "orders").unwrap();
    assert_eq!(child.data["spec"]["storage"]["size"], json!("100Gi"));

    // The child has not reacted yet, so it is still healthy
    ops_pass(&env, "grow").await;
    assert_eq!(ops_status(&env, "grow").phase, OpsPhase::Running);

    let mut rolling = healthy_child_status("orders", 3);
    rolling["phase"] = json!("Waiting for the instances to become active");
    env.children.set_status(&cluster_api(), NS, "orders", rolling);
    ops_pass(&env, "grow").await;
    assert_eq!(ops_status(&env, "grow").phase, OpsPhase::Running);

    env.children
        .set_status(&cluster_api(), NS, "orders", healthy_child_status("orders", 3));
    ops_pass(&env, "grow").await;

    let status = ops_status(&env, "grow");
    assert_eq!(status.phase, OpsPhase::Succeeded);
    assert_eq!(status.message.as_deref(), Some("VolumeExpansion completed"));
    assert_eq!(dispatch_count(&status), 1);
}

#[tokio::test]
async fn test_stop_hibernates_child() {
    let env = TestEnv::new();
    ready_cluster(&env, "orders", 1).await;
    env.records
        .put_ops(create_ops_request("pause", NS, "orders", OpsType::Stop));

    ops_pass(&env, "pause").await;

    let child = env.children.object(&cluster_api(), NS, "orders").unwrap();
    assert_eq!(
        markers::get(&child, markers::HIBERNATION),
        Some(markers::HIBERNATION_ON)
    );
    assert_eq!(ops_status(&env, "pause").phase, OpsPhase::Running);

    env.children.set_status(
        &cluster_api(),
        NS,
        "orders",
        json!({
            "phase": "Cluster in healthy state",
            "conditions": [{"type": "cnpg.io/hibernation", "status": "True"}],
        }),
    );
    ops_pass(&env, "pause").await;
    assert_eq!(ops_status(&env, "pause").phase, OpsPhase::Succeeded);
}

#[tokio::test]
async fn test_missing_payload_fails_without_touching_child() {
    let env = TestEnv::new();
    ready_cluster(&env, "orders", 3).await;
    let replaces = env.children.replaces();
    env.records.put_ops(create_ops_request(
        "broken",
        NS,
        "orders",
        OpsType::HorizontalScaling,
    ));

    let action = ops_pass(&env, "broken").await;
    assert_eq!(action, Action::await_change());

    let status = ops_status(&env, "broken");
    assert_eq!(status.phase, OpsPhase::Failed);
    assert!(status.message.unwrap().contains("requires its payload"));
    assert!(status.completion_time.is_some());
    assert_eq!(dispatch_count(&ops_status(&env, "broken")), 0);
    assert_eq!(env.children.replaces(), replaces);
}

#[tokio::test]
async fn test_missing_cluster_fails_request() {
    let env = TestEnv::new();
    env.records
        .put_ops(create_scaling_request("orphan", NS, "ghost", 2));

    ops_pass(&env, "orphan").await;

    let status = ops_status(&env, "orphan");
    assert_eq!(status.phase, OpsPhase::Failed);
    assert_eq!(
        status.message.as_deref(),
        Some("target cluster not found: ghost")
    );
}

#[tokio::test]
async fn test_catalog_rejects_disabled_feature() {
    let env = TestEnv::new();
    ready_cluster(&env, "orders", 3).await;
    let replaces = env.children.replaces();
    env.records.put_engine(DatabaseEngine::new(
        "postgresql",
        DatabaseEngineSpec {
            type_: "postgresql".to_string(),
            provider: "cloudnative-pg".to_string(),
            supported_versions: vec!["16.4".to_string()],
            operator_version: None,
            default_config: Default::default(),
            features: EngineFeatures {
                horizontal_scaling: Some(false),
                ..Default::default()
            },
        },
    ));
    env.records
        .put_ops(create_scaling_request("orders-scale", NS, "orders", 5));

    ops_pass(&env, "orders-scale").await;

    let status = ops_status(&env, "orders-scale");
    assert_eq!(status.phase, OpsPhase::Failed);
    assert!(status.message.unwrap().contains("horizontalScaling is disabled"));
    assert_eq!(env.children.replaces(), replaces);
}

#[tokio::test]
async fn test_unimplemented_custom_operation_fails() {
    let env = TestEnv::new();
    ready_cluster(&env, "orders", 1).await;
    let mut ops = create_ops_request("vacuum", NS, "orders", OpsType::Custom);
    ops.spec.custom = Some(CustomOpsSpec {
        operation: "vacuum".to_string(),
        parameters: Default::default(),
    });
    env.records.put_ops(ops);

    ops_pass(&env, "vacuum").await;

    let status = ops_status(&env, "vacuum");
    assert_eq!(status.phase, OpsPhase::Failed);
    assert_eq!(
        status.message.as_deref(),
        Some("postgresql custom operation vacuum not implemented yet")
    );
}

#[tokio::test]
async fn test_finished_request_is_deleted_after_ttl() {
    let env = TestEnv::new();
    let mut ops = create_scaling_request("old-scale", NS, "orders", 5);
    ops.spec.ttl_seconds_after_finished = Some(30);
    ops.status = Some(OpsRequestStatus {
        phase: OpsPhase::Succeeded,
        start_time: Some("2024-01-01T09:59:00Z".to_string()),
        completion_time: Some("2024-01-01T10:00:00Z".to_string()),
        message: Some("HorizontalScaling completed".to_string()),
        action_log: vec![],
    });
    env.records.put_ops(ops);

    let action = ops_pass(&env, "old-scale").await;

    assert_eq!(action, Action::await_change());
    assert!(env.records.ops(NS, "old-scale").is_none());
}

#[tokio::test]
async fn test_finished_request_without_ttl_is_kept() {
    let env = TestEnv::new();
    let mut ops = create_scaling_request("old-scale", NS, "orders", 5);
    ops.status = Some(OpsRequestStatus {
        phase: OpsPhase::Failed,
        completion_time: Some("2024-01-01T10:00:00Z".to_string()),
        ..Default::default()
    });
    env.records.put_ops(ops);

    let action = ops_pass(&env, "old-scale").await;

    assert_eq!(action, Action::await_change());
    assert!(env.records.ops(NS, "old-scale").is_some());
    assert_eq!(env.records.status_writes(), 0);
}
