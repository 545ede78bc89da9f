//! Reference delegate backed by the CloudNativePG operator

mod applier;
pub mod markers;
pub mod model;
mod operations;
mod status;

pub use applier::{CnpgApplier, LABEL_CLUSTER, LABEL_ENGINE, child_labels, image_name};
pub use operations::{
    CnpgOperations, LABEL_OPS_REQUEST, Observation, backup_progress, cluster_progress, next_status,
};
pub use status::{map_phase, map_status, pooler_name};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject};
use tracing::{debug, info};

use self::model::{ClusterStatus, backup_api, cluster_api, pooler_api, section};
use crate::crd::{BackupStorage, BackupStorageSpec, DatabaseCluster, DatabaseClusterStatus};
use crate::delegate::{
    Applier, ApplyOutcome, ChildRecord, Delegate, DelegateError, DelegateResult, DynamicClient,
    OperationsHandler, create_or_update,
};

/// How long to postpone a pass while a restore-from-backup child settles
const RESTORE_SETTLE_DELAY: Duration = Duration::from_secs(5);

pub struct CnpgDelegate {
    client: Arc<dyn DynamicClient>,
    image_repository: String,
}

impl CnpgDelegate {
    pub fn new(client: Arc<dyn DynamicClient>, image_repository: impl Into<String>) -> Self {
        Self {
            client,
            image_repository: image_repository.into(),
        }
    }

    async fn child(&self, cluster: &DatabaseCluster) -> DelegateResult<Option<DynamicObject>> {
        let ns = cluster.namespace().unwrap_or_default();
        Ok(self
            .client
            .get(&cluster_api(), &ns, &cluster.name_any())
            .await?)
    }

    async fn backup_storage(
        &self,
        cluster: &DatabaseCluster,
    ) -> DelegateResult<Option<BackupStorageSpec>> {
        let Some(name) = cluster
            .spec
            .backup
            .as_ref()
            .filter(|b| b.enabled)
            .and_then(|b| b.backup_storage_ref.as_deref())
        else {
            return Ok(None);
        };
        let ns = cluster.namespace().unwrap_or_default();
        let api = ApiResource::erase::<BackupStorage>(&());
        let Some(object) = self.client.get(&api, &ns, name).await? else {
            // The applier reports the missing reference
            return Ok(None);
        };
        let spec = object.data.get("spec").cloned().ok_or_else(|| {
            DelegateError::Invalid(format!("backup storage {name} has no spec"))
        })?;
        Ok(Some(serde_json::from_value(spec)?))
    }
}

#[async_trait]
impl Delegate for CnpgDelegate {
    async fn pre_reconcile(&self, cluster: &DatabaseCluster) -> DelegateResult<Option<Duration>> {
        let restoring = cluster
            .spec
            .data_source
            .as_ref()
            .is_some_and(|d| d.backup_source.is_some());
        if !restoring {
            return Ok(None);
        }
        let Some(child) = self.child(cluster).await? else {
            return Ok(None);
        };
        let observed: ClusterStatus = section(&child, "status")?;
        if observed.is_healthy() {
            return Ok(None);
        }
        debug!(
            cluster = %cluster.name_any(),
            phase = observed.phase.as_deref().unwrap_or(""),
            "Restore in progress, postponing pass"
        );
        Ok(Some(RESTORE_SETTLE_DELAY))
    }

    async fn applier(&self, cluster: &DatabaseCluster) -> DelegateResult<Box<dyn Applier>> {
        let existing = self.child(cluster).await?;
        let backup_storage = self.backup_storage(cluster).await?;
        Ok(Box::new(CnpgApplier::new(
            cluster.clone(),
            existing,
            backup_storage,
            self.image_repository.clone(),
        )))
    }

    async fn apply(&self, child: &ChildRecord) -> DelegateResult<ApplyOutcome> {
        let mut outcome = create_or_update(self.client.as_ref(), child).await?;
        if outcome != ApplyOutcome::Unchanged {
            info!(child = %child.object.name_any(), ?outcome, "Applied child cluster");
        }

        for companion in &child.companions {
            let applied = create_or_update(self.client.as_ref(), companion).await?;
            if applied != ApplyOutcome::Unchanged {
                info!(
                    kind = %companion.api.kind,
                    name = %companion.object.name_any(),
                    outcome = ?applied,
                    "Applied companion record"
                );
                if outcome == ApplyOutcome::Unchanged {
                    outcome = ApplyOutcome::Updated;
                }
            }
        }

        // A pooler left over from a proxy that has since been disabled
        let has_pooler = child.companions.iter().any(|c| c.api == pooler_api());
        if !has_pooler {
            let ns = child.object.namespace().unwrap_or_default();
            let name = pooler_name(&child.object.name_any());
            if self.client.delete(&pooler_api(), &ns, &name).await? {
                info!(pooler = %name, "Deleted pooler");
            }
        }
        Ok(outcome)
    }

    async fn status(&self, cluster: &DatabaseCluster) -> DelegateResult<DatabaseClusterStatus> {
        let ns = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let child = self.child(cluster).await?;
        let pooler = if cluster.spec.proxy.as_ref().is_some_and(|p| p.enabled) {
            self.client
                .get(&pooler_api(), &ns, &pooler_name(&name))
                .await?
        } else {
            None
        };
        let backups = if cluster.spec.backup.as_ref().is_some_and(|b| b.enabled) {
            self.client
                .list(&backup_api(), &ns, &format!("{LABEL_CLUSTER}={name}"))
                .await?
        } else {
            Vec::new()
        };
        map_status(cluster, child.as_ref(), pooler.as_ref(), &backups)
    }

    async fn cleanup(&self, cluster: &DatabaseCluster) -> DelegateResult<()> {
        let ns = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        self.client
            .delete(&pooler_api(), &ns, &pooler_name(&name))
            .await?;
        if self.client.delete(&cluster_api(), &ns, &name).await? {
            info!(child = %name, "Deleted child cluster");
        } else {
            debug!(child = %name, "Child cluster already gone");
        }
        Ok(())
    }

    fn operations(&self) -> Arc<dyn OperationsHandler> {
        Arc::new(CnpgOperations::new(
            self.client.clone(),
            self.image_repository.clone(),
        ))
    }
}
