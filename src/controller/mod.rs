pub mod cluster_reconciler;
pub mod context;
pub mod error;
pub mod ops_reconciler;
pub mod status;
pub mod store;
pub mod validation;

pub use cluster_reconciler::{FINALIZER, cluster_error_policy, reconcile_cluster};
pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use ops_reconciler::{TtlDecision, ops_error_policy, reconcile_ops, ttl_decision};
pub use status::{ConditionBuilder, deleting_status, finalize_status, spec_changed};
pub use store::{KubeRecordStore, RecordStore};
pub use validation::{MAX_REPLICAS, MIN_REPLICAS, select_engine, validate_capability, validate_payload};
