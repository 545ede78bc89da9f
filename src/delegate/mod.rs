//! Engine delegates
//!
//! A delegate realizes DatabaseCluster and OpsRequest records against an
//! engine-specific child system. It has four independent responsibilities:
//!
//! - an [`Applier`] pipeline that builds the child record step by step
//! - a status mapper that turns the child's observed state into a
//!   [`DatabaseClusterStatus`]
//! - cleanup of the child record
//! - an [`OperationsHandler`] for day-2 operations
//!
//! Delegates are resolved per reconciliation through a [`DelegateFactory`]
//! and keep no mutable state between calls.

pub mod child;
pub mod cnpg;
mod error;
pub mod factory;

pub use child::{
    ApplyOutcome, ChildRecord, DynamicClient, KubeDynamicClient, LAST_APPLIED, create_or_update,
    last_applied, needs_replace, replacement, stamped,
};
pub use error::DelegateError;
pub use factory::{DelegateFactory, EngineRegistry};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    CustomOpsSpec, DatabaseCluster, DatabaseClusterStatus, ExposeSpec, HorizontalScalingSpec,
    OpsRequest, OpsRequestStatus, RebuildInstanceSpec, ReconfiguringSpec, RestoreSpec,
    SwitchoverSpec, UpgradeSpec, VerticalScalingSpec, VolumeExpansionSpec,
};

pub type DelegateResult<T> = std::result::Result<T, DelegateError>;

/// The contract every engine delegate satisfies
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Ask for the pass to be postponed without mutating anything
    async fn pre_reconcile(&self, cluster: &DatabaseCluster) -> DelegateResult<Option<Duration>>;

    /// Start a child-record builder for this cluster
    async fn applier(&self, cluster: &DatabaseCluster) -> DelegateResult<Box<dyn Applier>>;

    /// Create the child record, or update it when it already exists
    async fn apply(&self, child: &ChildRecord) -> DelegateResult<ApplyOutcome>;

    /// Map the current child state onto a full unified status
    async fn status(&self, cluster: &DatabaseCluster) -> DelegateResult<DatabaseClusterStatus>;

    /// Remove the child record. Succeeds when it is already gone.
    async fn cleanup(&self, cluster: &DatabaseCluster) -> DelegateResult<()>;

    fn operations(&self) -> Arc<dyn OperationsHandler>;
}

/// Named steps of the child-record pipeline, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyStep {
    Metadata,
    Engine,
    Proxy,
    Monitoring,
    PodSchedulingPolicy,
    Backup,
    DataSource,
    DataImport,
}

impl ApplyStep {
    pub const ORDER: [ApplyStep; 8] = [
        ApplyStep::Metadata,
        ApplyStep::Engine,
        ApplyStep::Proxy,
        ApplyStep::Monitoring,
        ApplyStep::PodSchedulingPolicy,
        ApplyStep::Backup,
        ApplyStep::DataSource,
        ApplyStep::DataImport,
    ];
}

impl std::fmt::Display for ApplyStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplyStep::Metadata => "metadata",
            ApplyStep::Engine => "engine",
            ApplyStep::Proxy => "proxy",
            ApplyStep::Monitoring => "monitoring",
            ApplyStep::PodSchedulingPolicy => "pod scheduling policy",
            ApplyStep::Backup => "backup",
            ApplyStep::DataSource => "data source",
            ApplyStep::DataImport => "data import",
        };
        f.write_str(s)
    }
}

/// Builder for a child record.
///
/// Each step mutates the same in-progress record. Later steps may rely on
/// what earlier steps set, so steps run strictly in [`ApplyStep::ORDER`].
pub trait Applier: Send {
    fn metadata(&mut self) -> DelegateResult<()>;
    fn engine(&mut self) -> DelegateResult<()>;
    fn proxy(&mut self) -> DelegateResult<()>;
    fn monitoring(&mut self) -> DelegateResult<()>;
    fn pod_scheduling_policy(&mut self) -> DelegateResult<()>;
    fn backup(&mut self) -> DelegateResult<()>;
    fn data_source(&mut self) -> DelegateResult<()>;
    fn data_import(&mut self) -> DelegateResult<()>;

    /// Consume the builder and expose the finished child record
    fn finish(self: Box<Self>) -> DelegateResult<ChildRecord>;
}

/// Run every applier step in order and return the finished child record.
///
/// The first failing step aborts the pipeline; no partial record is returned.
pub fn run_pipeline(mut applier: Box<dyn Applier>) -> DelegateResult<ChildRecord> {
    for step in ApplyStep::ORDER {
        let result = match step {
            ApplyStep::Metadata => applier.metadata(),
            ApplyStep::Engine => applier.engine(),
            ApplyStep::Proxy => applier.proxy(),
            ApplyStep::Monitoring => applier.monitoring(),
            ApplyStep::PodSchedulingPolicy => applier.pod_scheduling_policy(),
            ApplyStep::Backup => applier.backup(),
            ApplyStep::DataSource => applier.data_source(),
            ApplyStep::DataImport => applier.data_import(),
        };
        result.map_err(|source| DelegateError::Step {
            step,
            source: Box::new(source),
        })?;
    }
    applier.finish()
}

/// Day-2 operations. Each method receives its already-validated payload.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OperationsHandler: Send + Sync {
    async fn start(&self, cluster: &DatabaseCluster) -> DelegateResult<()>;
    async fn stop(&self, cluster: &DatabaseCluster) -> DelegateResult<()>;
    async fn restart(&self, cluster: &DatabaseCluster) -> DelegateResult<()>;
    async fn switchover(&self, cluster: &DatabaseCluster, spec: &SwitchoverSpec)
    -> DelegateResult<()>;
    async fn horizontal_scaling(
        &self,
        cluster: &DatabaseCluster,
        spec: &HorizontalScalingSpec,
    ) -> DelegateResult<()>;
    async fn vertical_scaling(
        &self,
        cluster: &DatabaseCluster,
        spec: &VerticalScalingSpec,
    ) -> DelegateResult<()>;
    async fn volume_expansion(
        &self,
        cluster: &DatabaseCluster,
        spec: &VolumeExpansionSpec,
    ) -> DelegateResult<()>;
    async fn reconfigure(
        &self,
        cluster: &DatabaseCluster,
        spec: &ReconfiguringSpec,
    ) -> DelegateResult<()>;
    async fn upgrade(&self, cluster: &DatabaseCluster, spec: &UpgradeSpec) -> DelegateResult<()>;

    /// Create the backup request for `ops` in the child system, named by
    /// [`OpsRequest::backup_name`]
    async fn backup(&self, cluster: &DatabaseCluster, ops: &OpsRequest) -> DelegateResult<()>;
    async fn restore(&self, cluster: &DatabaseCluster, spec: &RestoreSpec) -> DelegateResult<()>;
    async fn expose(&self, cluster: &DatabaseCluster, spec: &ExposeSpec) -> DelegateResult<()>;
    async fn rebuild_instance(
        &self,
        cluster: &DatabaseCluster,
        spec: &RebuildInstanceSpec,
    ) -> DelegateResult<()>;
    async fn custom(&self, cluster: &DatabaseCluster, spec: &CustomOpsSpec) -> DelegateResult<()>;

    /// Report the full status of a dispatched operation
    async fn status(
        &self,
        cluster: &DatabaseCluster,
        ops: &OpsRequest,
    ) -> DelegateResult<OpsRequestStatus>;
}
