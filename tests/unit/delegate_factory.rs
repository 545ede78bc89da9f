//! Delegate resolution and the resolved CloudNativePG delegate

use dbaas_operator::crd::{BackupSource, DataSource};
use dbaas_operator::delegate::cnpg::model::cluster_api;
use dbaas_operator::delegate::{
    Delegate, DelegateError, DelegateFactory, create_or_update, run_pipeline,
};

use crate::common::*;

const NS: &str = "shop";

#[test]
fn test_postgresql_resolves() {
    let env = TestEnv::new();
    assert!(env.ctx.delegates.resolve("postgresql").is_ok());
}

#[test]
fn test_planned_engines_are_not_implemented() {
    let env = TestEnv::new();
    for engine in ["mongodb", "mysql", "kafka"] {
        let err = env.ctx.delegates.resolve(engine).err().expect("unsupported");
        assert!(err.is_unsupported());
        assert_eq!(err.to_string(), format!("{engine} provider not implemented yet"));
    }
}

#[test]
fn test_unknown_engine_is_rejected() {
    let env = TestEnv::new();
    let err = env.ctx.delegates.resolve("oracle").err().expect("unknown");
    assert!(matches!(err, DelegateError::UnknownEngine(ref e) if e == "oracle"));
}

#[tokio::test]
async fn test_child_is_owned_by_record() {
    let env = TestEnv::new();
    let cluster = create_test_cluster("orders", NS, 2);
    let delegate = env.ctx.delegates.resolve("postgresql").unwrap();

    let child = run_pipeline(delegate.applier(&cluster).await.unwrap()).unwrap();
    assert_eq!(child.api, cluster_api());

    let owners = child.object.metadata.owner_references.clone().unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].uid, TEST_UID);
    assert_eq!(owners[0].kind, "DatabaseCluster");
    assert_eq!(owners[0].controller, Some(true));

    create_or_update(env.children.as_ref(), &child).await.unwrap();
    assert!(env.children.object(&cluster_api(), NS, "orders").is_some());
}

#[tokio::test]
async fn test_restore_postpones_until_child_is_healthy() {
    let env = TestEnv::new();
    let mut cluster = create_test_cluster("orders", NS, 1);
    cluster.spec.data_source = Some(DataSource {
        backup_source: Some(BackupSource {
            backup_name: "nightly".to_string(),
        }),
        clone_source: None,
    });
    let delegate = env.ctx.delegates.resolve("postgresql").unwrap();

    // No child yet: the first pass creates it
    assert_eq!(delegate.pre_reconcile(&cluster).await.unwrap(), None);

    let child = run_pipeline(delegate.applier(&cluster).await.unwrap()).unwrap();
    delegate.apply(&child).await.unwrap();
    env.children.set_status(
        &cluster_api(),
        NS,
        "orders",
        serde_json::json!({"phase": "Setting up primary"}),
    );
    assert!(delegate.pre_reconcile(&cluster).await.unwrap().is_some());

    env.children
        .set_status(&cluster_api(), NS, "orders", healthy_child_status("orders", 1));
    assert_eq!(delegate.pre_reconcile(&cluster).await.unwrap(), None);
}
