//! Host cluster access backed by kube-rs watch caches

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vcsync_common::Error;

use super::{find_service_account_secret, HostCluster};

/// Host cluster client with reflector caches for pods, claims and services
pub struct KubeHostCluster {
    client: Client,
    pods: Store<Pod>,
    pvcs: Store<PersistentVolumeClaim>,
    services: Store<Service>,
}

impl KubeHostCluster {
    /// Start the host watches and return the client over their caches
    ///
    /// The watches stop when `token` is cancelled.
    pub fn spawn(client: Client, token: CancellationToken) -> Self {
        let (pods, pod_writer) = reflector::store();
        let (pvcs, pvc_writer) = reflector::store();
        let (services, service_writer) = reflector::store();

        spawn_reflector(Api::<Pod>::all(client.clone()), pod_writer, token.clone());
        spawn_reflector(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            pvc_writer,
            token.clone(),
        );
        spawn_reflector(Api::<Service>::all(client.clone()), service_writer, token);

        Self {
            client,
            pods,
            pvcs,
            services,
        }
    }
}

/// Keep `writer` populated from a cluster-wide watch until cancelled
pub(crate) fn spawn_reflector<K>(api: Api<K>, writer: Writer<K>, token: CancellationToken)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let kind = K::kind(&());
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer);
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(%kind, error = %e, "Host watch error, will retry"),
                    None => break,
                },
            }
        }
        debug!(%kind, "Host watch stopped");
    });
}

fn cached<K>(store: &Store<K>, namespace: &str, name: &str) -> Option<Arc<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store.get(&ObjectRef::new(name).within(namespace))
}

fn object_name<K: Resource>(object: &K) -> Result<String, Error> {
    object
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::validation_for_field("metadata.name", "object has no name"))
}

#[async_trait]
impl HostCluster for KubeHostCluster {
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        cached(&self.pods, namespace, name)
    }

    fn list_pods(&self) -> Vec<Arc<Pod>> {
        self.pods.state()
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn update_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&object_name(pod)?, &PostParams::default(), pod)
            .await?)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, params).await?;
        Ok(())
    }

    fn get_pvc(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>> {
        cached(&self.pvcs, namespace, name)
    }

    fn list_pvcs(&self) -> Vec<Arc<PersistentVolumeClaim>> {
        self.pvcs.state()
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pvc).await?)
    }

    async fn update_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&object_name(pvc)?, &PostParams::default(), pvc)
            .await?)
    }

    async fn delete_pvc(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, params).await?;
        Ok(())
    }

    fn list_services(&self, namespace: &str) -> Vec<Arc<Service>> {
        self.services
            .state()
            .into_iter()
            .filter(|s| s.namespace().as_deref() == Some(namespace))
            .collect()
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn service_account_secret(
        &self,
        namespace: &str,
        service_account: &str,
    ) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secrets = api.list(&ListParams::default()).await?;
        Ok(find_service_account_secret(secrets.items, service_account))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn add_secret_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        let Some(patch) = owner_patch(&secret.metadata, owner) else {
            return Ok(());
        };
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn wait_for_cache_sync(&self) -> Result<(), Error> {
        let sync_error = |e: reflector::store::WriterDropped| {
            Error::internal_with_context("host_cache", format!("host watch ended: {e}"))
        };
        self.pods.wait_until_ready().await.map_err(sync_error)?;
        self.pvcs.wait_until_ready().await.map_err(sync_error)?;
        self.services.wait_until_ready().await.map_err(sync_error)?;
        Ok(())
    }
}

/// Merge patch appending an owner reference, or `None` if already present
///
/// The observed resourceVersion rides along so a concurrent owner change
/// fails with a conflict instead of being overwritten.
fn owner_patch(meta: &ObjectMeta, owner: &OwnerReference) -> Option<serde_json::Value> {
    let mut owners = meta.owner_references.clone().unwrap_or_default();
    if owners.iter().any(|o| o.uid == owner.uid) {
        return None;
    }
    owners.push(owner.clone());
    Some(serde_json::json!({
        "metadata": {
            "ownerReferences": owners,
            "resourceVersion": meta.resource_version,
        }
    }))
}
