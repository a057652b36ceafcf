use std::sync::Arc;

use async_trait::async_trait;

use vcsync_common::{Error, LABEL_EXTEND_DEPLOYMENT_NAME, LABEL_EXTEND_DEPLOYMENT_UID};

use super::{PodMutateContext, PodMutator};
use crate::clients::TenantClusters;
use crate::projector::labels_mut;

/// Labels host pods of Deployment-managed ReplicaSets with their Deployment
pub struct ExtensionMetaMutator {
    tenants: Arc<dyn TenantClusters>,
}

impl ExtensionMetaMutator {
    /// Create the mutator over the tenant cluster registry
    pub fn new(tenants: Arc<dyn TenantClusters>) -> Self {
        Self { tenants }
    }
}

#[async_trait]
impl PodMutator for ExtensionMetaMutator {
    fn name(&self) -> &'static str {
        "extension-metadata"
    }

    async fn mutate(&self, ctx: &mut PodMutateContext) -> Result<(), Error> {
        let Some(owner) = ctx
            .tenant
            .metadata
            .owner_references
            .as_ref()
            .and_then(|o| o.first())
            .filter(|o| o.kind == "ReplicaSet")
        else {
            return Ok(());
        };
        let namespace = ctx.tenant.metadata.namespace.clone().unwrap_or_default();

        let replica_set = self
            .tenants
            .get_replica_set(&ctx.cluster, &namespace, &owner.name)
            .await
            .map_err(|e| {
                Error::mutation(
                    self.name(),
                    format!(
                        "cluster {} failed to get replicaset {}/{}: {}",
                        ctx.cluster, namespace, owner.name, e
                    ),
                )
            })?;

        // A ReplicaSet without an owner is standalone
        let Some(deployment) = replica_set
            .metadata
            .owner_references
            .as_ref()
            .and_then(|o| o.first())
        else {
            return Ok(());
        };

        let labels = labels_mut(&mut ctx.pod.metadata);
        labels.insert(
            LABEL_EXTEND_DEPLOYMENT_NAME.to_string(),
            deployment.name.clone(),
        );
        labels.insert(
            LABEL_EXTEND_DEPLOYMENT_UID.to_string(),
            deployment.uid.clone(),
        );
        Ok(())
    }
}
