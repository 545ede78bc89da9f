use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::controller::store::{KubeRecordStore, RecordStore};
use crate::delegate::{DelegateFactory, EngineRegistry, KubeDynamicClient};
use crate::health::HealthState;

/// Shared context for both controllers
#[derive(Clone)]
pub struct Context {
    /// The operator's own records
    pub records: Arc<dyn RecordStore>,
    /// Engine type to delegate lookup
    pub delegates: Arc<dyn DelegateFactory>,
    pub config: OperatorConfig,
    /// Metrics sink, absent in tests
    pub health: Option<Arc<HealthState>>,
}

impl Context {
    /// Context wired to a live Kubernetes API
    pub fn new(client: Client, config: OperatorConfig, health: Option<Arc<HealthState>>) -> Self {
        let children = Arc::new(KubeDynamicClient::new(client.clone()));
        let delegates = Arc::new(EngineRegistry::new(
            children,
            config.postgres_image_repository.clone(),
        ));
        Self {
            records: Arc::new(KubeRecordStore::new(client)),
            delegates,
            config,
            health,
        }
    }

    pub fn from_parts(
        records: Arc<dyn RecordStore>,
        delegates: Arc<dyn DelegateFactory>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            records,
            delegates,
            config,
            health: None,
        }
    }
}
