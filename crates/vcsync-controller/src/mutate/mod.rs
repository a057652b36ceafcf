//! Pod mutation pipeline
//!
//! A host pod draft is transformed by an ordered list of independent
//! [`PodMutator`]s sharing one mutable [`PodMutateContext`]. The first failing
//! mutator aborts the pipeline; the caller then discards the draft, so a
//! partially mutated pod never reaches the host API server.
//!
//! Order used by the pod reconciler:
//!
//! 1. [`DefaultMutator`] - env, host alias, token volume, DNS, subdomain
//! 2. [`AutomountMutator`] - optional service account token opt-out
//! 3. [`ExtensionMetaMutator`] - Deployment labels for ReplicaSet pods
//! 4. [`KubeconfigMutator`] - optional tenant kubeconfig volume

mod credentials;
mod default;
mod dns;
pub mod envvars;
mod extension;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use tracing::debug;

use vcsync_common::Error;

pub use credentials::{AutomountMutator, KubeconfigMutator};
pub use default::DefaultMutator;
pub use dns::{mutate_dns, omit_duplicates};
pub use extension::ExtensionMetaMutator;

/// Data gathered before mutation, shared by all mutators
#[derive(Debug, Clone, Default)]
pub struct SideData {
    /// Host services visible to the pod (virtual API server namespace and the pod's own)
    pub services: Vec<Arc<Service>>,
    /// Name of the tenant service account token secret
    pub tenant_secret: String,
    /// Name of the host secret projected from it
    pub host_secret: String,
    /// Cluster DNS server address, if the tenant runs one
    pub name_server: Option<String>,
    /// Tenant cluster DNS domain
    pub cluster_domain: String,
}

/// Per-reconcile scratch state
pub struct PodMutateContext {
    /// Tenant cluster name
    pub cluster: String,
    /// Tenant pod being projected
    pub tenant: Arc<Pod>,
    /// Host pod draft, mutated in place
    pub pod: Pod,
    /// Side data for the mutators
    pub side: SideData,
}

/// One step of the mutation pipeline
#[async_trait]
pub trait PodMutator: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// Transform the draft in `ctx`
    async fn mutate(&self, ctx: &mut PodMutateContext) -> Result<(), Error>;
}

/// Run `mutators` in order, stopping at the first failure
pub async fn mutate(
    ctx: &mut PodMutateContext,
    mutators: &[Box<dyn PodMutator>],
) -> Result<(), Error> {
    for mutator in mutators {
        mutator.mutate(ctx).await?;
        debug!(mutator = mutator.name(), "Applied pod mutator");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ServicePort, ServiceSpec};

    pub fn tenant_pod(name: &str, namespace: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some(namespace.to_string());
        pod.metadata.uid = Some(format!("{name}-uid"));
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("nginx:1.27".to_string()),
                ..Default::default()
            }],
            dns_policy: Some("ClusterFirst".to_string()),
            ..Default::default()
        });
        pod
    }

    pub fn service(namespace: &str, name: &str, ip: &str, ports: &[(&str, i32)]) -> Arc<Service> {
        let mut service = Service::default();
        service.metadata.name = Some(name.to_string());
        service.metadata.namespace = Some(namespace.to_string());
        service.spec = Some(ServiceSpec {
            cluster_ip: Some(ip.to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: (!port_name.is_empty()).then(|| port_name.to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        });
        Arc::new(service)
    }

    pub fn context(tenant: Pod, host_namespace: &str) -> PodMutateContext {
        let mut pod = tenant.clone();
        pod.metadata.namespace = Some(host_namespace.to_string());
        pod.metadata.uid = None;
        PodMutateContext {
            cluster: "west".to_string(),
            tenant: Arc::new(tenant),
            pod,
            side: SideData {
                services: vec![service("4-west-default", "kubernetes", "10.0.0.1", &[("https", 443)])],
                tenant_secret: "default-token-tenant".to_string(),
                host_secret: "default-token-host".to_string(),
                name_server: Some("10.0.0.10".to_string()),
                cluster_domain: "cluster.local".to_string(),
            },
        }
    }
}
