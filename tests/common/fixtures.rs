//! Test fixtures and builders for DatabaseCluster and OpsRequest records
//!
//! For simple tests, use the convenience functions:
//! ```rust,ignore
//! let cluster = create_test_cluster("orders", "shop", 3);
//! let scale = create_scaling_request("orders-scale", "shop", "orders", 5);
//! ```
//!
//! For anything else, use the builder:
//! ```rust,ignore
//! let cluster = DatabaseClusterBuilder::new("orders", "shop")
//!     .with_size(3)
//!     .with_monitoring()
//!     .build();
//! ```

use kube::core::ObjectMeta;
use serde_json::{Value, json};

use dbaas_operator::crd::{
    ConfigParameter, DatabaseCluster, DatabaseClusterSpec, EngineSpec, HorizontalScalingSpec,
    LocalObjectReference, MonitoringSpec, OpsRequest, OpsRequestSpec, OpsType, ProxySpec,
    StorageSpec,
};

pub const TEST_UID: &str = "test-uid-12345";

// =============================================================================
// Convenience Functions
// =============================================================================

/// A PostgreSQL cluster with the given size and nothing optional set
pub fn create_test_cluster(name: &str, namespace: &str, size: i32) -> DatabaseCluster {
    DatabaseClusterBuilder::new(name, namespace)
        .with_size(size)
        .build()
}

/// An OpsRequest of the given type with no payload
pub fn create_ops_request(name: &str, namespace: &str, cluster: &str, type_: OpsType) -> OpsRequest {
    OpsRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("{name}-uid")),
            ..Default::default()
        },
        spec: OpsRequestSpec {
            cluster_ref: LocalObjectReference {
                name: cluster.to_string(),
            },
            type_,
            switchover: None,
            horizontal_scaling: None,
            vertical_scaling: None,
            volume_expansion: None,
            reconfiguring: None,
            upgrade: None,
            backup: None,
            restore: None,
            expose: None,
            rebuild_instance: None,
            custom: None,
            ttl_seconds_after_finished: None,
        },
        status: None,
    }
}

/// A HorizontalScaling request with its payload set
pub fn create_scaling_request(
    name: &str,
    namespace: &str,
    cluster: &str,
    replicas: i32,
) -> OpsRequest {
    let mut ops = create_ops_request(name, namespace, cluster, OpsType::HorizontalScaling);
    ops.spec.horizontal_scaling = Some(HorizontalScalingSpec { replicas });
    ops
}

/// Status block of a healthy CloudNativePG cluster with `instances` members
pub fn healthy_child_status(cluster: &str, instances: i32) -> Value {
    let names: Vec<String> = (1..=instances).map(|i| format!("{cluster}-{i}")).collect();
    json!({
        "phase": "Cluster in healthy state",
        "instances": instances,
        "readyInstances": instances,
        "currentPrimary": format!("{cluster}-1"),
        "instanceNames": names,
    })
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for DatabaseCluster test records
pub struct DatabaseClusterBuilder {
    name: String,
    namespace: String,
    generation: i64,
    spec: DatabaseClusterSpec,
}

impl DatabaseClusterBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            generation: 1,
            spec: DatabaseClusterSpec {
                engine: EngineSpec {
                    type_: "postgresql".to_string(),
                    version: "16.4".to_string(),
                    engine_ref: None,
                },
                cluster_size: 1,
                resources: None,
                storage: StorageSpec {
                    size: "10Gi".to_string(),
                    storage_class_name: None,
                },
                backup: None,
                monitoring: None,
                proxy: None,
                expose: None,
                pod_scheduling_policy: None,
                config: vec![],
                data_source: None,
            },
        }
    }

    pub fn with_size(mut self, size: i32) -> Self {
        self.spec.cluster_size = size;
        self
    }

    pub fn with_engine(mut self, type_: &str, version: &str) -> Self {
        self.spec.engine.type_ = type_.to_string();
        self.spec.engine.version = version.to_string();
        self
    }

    pub fn with_monitoring(mut self) -> Self {
        self.spec.monitoring = Some(MonitoringSpec {
            enabled: true,
            monitoring_config_ref: None,
        });
        self
    }

    pub fn with_proxy(mut self, replicas: i32) -> Self {
        self.spec.proxy = Some(ProxySpec {
            enabled: true,
            type_: None,
            replicas,
            resources: None,
        });
        self
    }

    pub fn with_config(mut self, name: &str, value: &str) -> Self {
        self.spec.config.push(ConfigParameter {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = generation;
        self
    }

    pub fn build(self) -> DatabaseCluster {
        DatabaseCluster {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: Some(TEST_UID.to_string()),
                generation: Some(self.generation),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: self.spec,
            status: None,
        }
    }
}
