//! Access to the tenant control planes and the host control plane
//!
//! Both sides are reached through traits so that reconcilers and checkers can
//! be exercised against mocks. Methods named `get_*`/`list_*` without `async`
//! read the local watch caches; async methods talk to the API server.

mod host;
mod tenant;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DeleteParams;

#[cfg(test)]
use mockall::automock;

use vcsync_common::Error;

pub use host::KubeHostCluster;
pub use tenant::{KubeTenantClusters, TenantRegistration, TenantWatch};

/// Read access to every registered tenant cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantClusters: Send + Sync {
    /// Names of all registered tenant clusters
    fn cluster_names(&self) -> Vec<String>;

    /// DNS domain configured for the cluster
    fn cluster_domain(&self, cluster: &str) -> Result<String, Error>;

    /// Base64 CA bundle of the cluster's API server
    fn certificate_authority(&self, cluster: &str) -> Result<String, Error>;

    /// All pods in the cluster's cache
    fn list_pods(&self, cluster: &str) -> Result<Vec<Arc<Pod>>, Error>;

    /// One pod from the cluster's cache
    fn get_pod(&self, cluster: &str, namespace: &str, name: &str)
        -> Result<Option<Arc<Pod>>, Error>;

    /// All claims in the cluster's cache
    fn list_pvcs(&self, cluster: &str) -> Result<Vec<Arc<PersistentVolumeClaim>>, Error>;

    /// One claim from the cluster's cache
    fn get_pvc(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<PersistentVolumeClaim>>, Error>;

    /// Fetch a replica set from the tenant API server
    async fn get_replica_set(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, Error>;

    /// Fetch a service account from the tenant API server
    async fn get_service_account(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, Error>;

    /// Fetch a secret from the tenant API server
    async fn get_secret(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, Error>;

    /// Find the token secret annotated with the given service account
    async fn service_account_secret(
        &self,
        cluster: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<Option<Secret>, Error>;

    /// Record a warning event against a tenant pod
    async fn publish_warning(&self, cluster: &str, pod: &Pod, reason: &str, message: &str);

    /// Wait until every cluster's caches finished their initial list
    async fn wait_for_cache_sync(&self) -> Result<(), Error>;
}

/// Read and write access to the host cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostCluster: Send + Sync {
    /// One pod from the host cache
    fn get_pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;

    /// All pods in the host cache
    fn list_pods(&self) -> Vec<Arc<Pod>>;

    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Replace a pod, guarded by its resourceVersion
    async fn update_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), Error>;

    /// One claim from the host cache
    fn get_pvc(&self, namespace: &str, name: &str) -> Option<Arc<PersistentVolumeClaim>>;

    /// All claims in the host cache
    fn list_pvcs(&self) -> Vec<Arc<PersistentVolumeClaim>>;

    /// Create a claim
    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error>;

    /// Replace a claim, guarded by its resourceVersion
    async fn update_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error>;

    /// Delete a claim
    async fn delete_pvc(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), Error>;

    /// All services in a host namespace, from the host cache
    fn list_services(&self, namespace: &str) -> Vec<Arc<Service>>;

    /// Fetch a service from the host API server
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Find the projected token secret annotated with the given service account
    async fn service_account_secret(
        &self,
        namespace: &str,
        service_account: &str,
    ) -> Result<Option<Secret>, Error>;

    /// Create a secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Add an owner reference to an existing secret
    async fn add_secret_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: &OwnerReference,
    ) -> Result<(), Error>;

    /// Wait until the host caches finished their initial list
    async fn wait_for_cache_sync(&self) -> Result<(), Error>;
}

/// Pick the token secret of a service account out of a secret listing
///
/// Prefers secrets of type `kubernetes.io/service-account-token`.
pub(crate) fn find_service_account_secret(
    secrets: Vec<Secret>,
    service_account: &str,
) -> Option<Secret> {
    let mut matching: Vec<Secret> = secrets
        .into_iter()
        .filter(|s| {
            s.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(vcsync_common::ANNOTATION_SERVICE_ACCOUNT_NAME))
                .is_some_and(|sa| sa == service_account)
        })
        .collect();
    matching.sort_by_key(|s| s.type_.as_deref() != Some(SERVICE_ACCOUNT_TOKEN_TYPE));
    matching.into_iter().next()
}

/// Secret type of service account token secrets
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
