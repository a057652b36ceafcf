//! Tenant cluster registry backed by kube-rs clients and reflector stores

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, ServiceAccount};
use kube::api::{Api, ListParams};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::{Client, Resource};
use tracing::info;

use vcsync_common::events::TenantEventRecorder;
use vcsync_common::{host_namespace, Error, MASTER_SERVICE_NAMESPACE};

use super::{find_service_account_secret, TenantClusters};

/// Everything needed to register one tenant cluster
pub struct TenantRegistration {
    /// Cluster name, used as the host namespace prefix
    pub name: String,
    /// Client for the tenant API server
    pub client: Client,
    /// DNS domain of the tenant cluster
    pub domain: String,
    /// Base64 CA bundle of the tenant API server
    pub certificate_authority: String,
}

/// Cache writers for one tenant cluster, driven by the event source
pub struct TenantWatch {
    /// Cluster name
    pub cluster: String,
    /// Client for the tenant API server
    pub client: Client,
    /// Pod cache writer
    pub pods: Writer<Pod>,
    /// Claim cache writer
    pub pvcs: Writer<PersistentVolumeClaim>,
}

struct TenantCluster {
    client: Client,
    domain: String,
    certificate_authority: String,
    pods: Store<Pod>,
    pvcs: Store<PersistentVolumeClaim>,
    events: TenantEventRecorder,
}

/// Registry of tenant clusters
#[derive(Default)]
pub struct KubeTenantClusters {
    clusters: BTreeMap<String, TenantCluster>,
}

impl KubeTenantClusters {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tenant cluster, returning the writers for its caches
    ///
    /// The name must map to valid host namespaces.
    pub fn register(&mut self, registration: TenantRegistration) -> Result<TenantWatch, Error> {
        host_namespace(&registration.name, MASTER_SERVICE_NAMESPACE)?;
        if self.clusters.contains_key(&registration.name) {
            return Err(Error::validation_for_field(
                "cluster",
                format!("tenant cluster {} registered twice", registration.name),
            ));
        }

        let (pods, pod_writer) = reflector::store();
        let (pvcs, pvc_writer) = reflector::store();
        self.clusters.insert(
            registration.name.clone(),
            TenantCluster {
                client: registration.client.clone(),
                domain: registration.domain,
                certificate_authority: registration.certificate_authority,
                pods,
                pvcs,
                events: TenantEventRecorder::new(registration.client.clone(), &registration.name),
            },
        );
        info!(cluster = %registration.name, "Registered tenant cluster");

        Ok(TenantWatch {
            cluster: registration.name,
            client: registration.client,
            pods: pod_writer,
            pvcs: pvc_writer,
        })
    }

    fn cluster(&self, name: &str) -> Result<&TenantCluster, Error> {
        self.clusters
            .get(name)
            .ok_or_else(|| Error::cluster(name, "tenant cluster is not registered"))
    }
}

fn cached<K>(store: &Store<K>, namespace: &str, name: &str) -> Option<Arc<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store.get(&ObjectRef::new(name).within(namespace))
}

#[async_trait]
impl TenantClusters for KubeTenantClusters {
    fn cluster_names(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }

    fn cluster_domain(&self, cluster: &str) -> Result<String, Error> {
        Ok(self.cluster(cluster)?.domain.clone())
    }

    fn certificate_authority(&self, cluster: &str) -> Result<String, Error> {
        Ok(self.cluster(cluster)?.certificate_authority.clone())
    }

    fn list_pods(&self, cluster: &str) -> Result<Vec<Arc<Pod>>, Error> {
        Ok(self.cluster(cluster)?.pods.state())
    }

    fn get_pod(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<Pod>>, Error> {
        Ok(cached(&self.cluster(cluster)?.pods, namespace, name))
    }

    fn list_pvcs(&self, cluster: &str) -> Result<Vec<Arc<PersistentVolumeClaim>>, Error> {
        Ok(self.cluster(cluster)?.pvcs.state())
    }

    fn get_pvc(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<PersistentVolumeClaim>>, Error> {
        Ok(cached(&self.cluster(cluster)?.pvcs, namespace, name))
    }

    async fn get_replica_set(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, Error> {
        let api: Api<ReplicaSet> = Api::namespaced(self.cluster(cluster)?.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_service_account(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, Error> {
        let api: Api<ServiceAccount> =
            Api::namespaced(self.cluster(cluster)?.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn get_secret(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.cluster(cluster)?.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn service_account_secret(
        &self,
        cluster: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.cluster(cluster)?.client.clone(), namespace);
        let secrets = api.list(&ListParams::default()).await?;
        Ok(find_service_account_secret(secrets.items, service_account))
    }

    async fn publish_warning(&self, cluster: &str, pod: &Pod, reason: &str, message: &str) {
        let Ok(tenant) = self.cluster(cluster) else {
            return;
        };
        tenant.events.warn(&pod.object_ref(&()), reason, message).await;
    }

    async fn wait_for_cache_sync(&self) -> Result<(), Error> {
        for (name, tenant) in &self.clusters {
            let sync_error = |e: reflector::store::WriterDropped| {
                Error::cluster(name.clone(), format!("tenant watch ended: {e}"))
            };
            tenant.pods.wait_until_ready().await.map_err(sync_error)?;
            tenant.pvcs.wait_until_ready().await.map_err(sync_error)?;
            info!(cluster = %name, "Tenant caches synced");
        }
        Ok(())
    }
}
