//! Static lookup from engine type to delegate

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use super::cnpg::CnpgDelegate;
use super::{Delegate, DelegateError, DynamicClient};

/// Engine identifier served by the CloudNativePG delegate
pub const POSTGRESQL: &str = "postgresql";

/// Engines that are recognized but have no delegate yet
const PLANNED_ENGINES: [&str; 3] = ["mongodb", "mysql", "kafka"];

/// Resolves a delegate for an engine type
#[cfg_attr(test, automock)]
pub trait DelegateFactory: Send + Sync {
    fn resolve(&self, engine_type: &str) -> Result<Arc<dyn Delegate>, DelegateError>;
}

/// The built-in engine table.
///
/// Every resolution builds a fresh delegate that only closes over the child
/// system client and static settings.
#[derive(Clone)]
pub struct EngineRegistry {
    client: Arc<dyn DynamicClient>,
    postgres_image_repository: String,
}

impl EngineRegistry {
    pub fn new(client: Arc<dyn DynamicClient>, postgres_image_repository: impl Into<String>) -> Self {
        Self {
            client,
            postgres_image_repository: postgres_image_repository.into(),
        }
    }
}

impl DelegateFactory for EngineRegistry {
    fn resolve(&self, engine_type: &str) -> Result<Arc<dyn Delegate>, DelegateError> {
        match engine_type {
            POSTGRESQL => Ok(Arc::new(CnpgDelegate::new(
                self.client.clone(),
                self.postgres_image_repository.clone(),
            ))),
            planned if PLANNED_ENGINES.contains(&planned) => {
                Err(DelegateError::unsupported(planned, "provider"))
            }
            other => Err(DelegateError::UnknownEngine(other.to_string())),
        }
    }
}
