//! Tenant kubeconfig secrets for host pods
//!
//! When enabled, every host pod gets a kubeconfig that authenticates to the
//! tenant API server as the pod's service account. The secret is created in
//! the pod's host namespace before the pod and later owned by the host pod,
//! so the host garbage collector removes it with the pod.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use tracing::debug;

use vcsync_common::{BackReference, Error};

use crate::clients::{TenantClusters, SERVICE_ACCOUNT_TOKEN_TYPE};

/// Server address of the virtual API server as seen from host pods
pub const TENANT_API_SERVER: &str = "https://kubernetes.default";

/// Key holding the kubeconfig in the secret
pub const KUBECONFIG_KEY: &str = "kubeconfig";

const TOKEN_KEY: &str = "token";

/// Name of the kubeconfig secret for a tenant pod
pub fn secret_name(tenant_pod: &Pod) -> Result<String, Error> {
    let uid = tenant_pod
        .metadata
        .uid
        .as_deref()
        .ok_or_else(|| Error::validation_for_field("metadata.uid", "tenant pod has no uid"))?;
    Ok(format!("vc-kubeconfig-{uid}"))
}

/// Render a token kubeconfig for a service account
pub fn render(service_account: &str, token: &str, certificate_authority: &str) -> Result<String, Error> {
    let config = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "current-context": service_account,
        "clusters": [{
            "name": service_account,
            "cluster": {
                "server": TENANT_API_SERVER,
                "certificate-authority-data": certificate_authority,
            },
        }],
        "contexts": [{
            "name": service_account,
            "context": {
                "cluster": service_account,
                "user": service_account,
            },
        }],
        "users": [{
            "name": service_account,
            "user": { "token": token },
        }],
    });
    serde_yaml::to_string(&config).map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
}

fn token_of(secret: &Secret) -> Option<Result<String, Error>> {
    if secret.type_.as_deref() != Some(SERVICE_ACCOUNT_TOKEN_TYPE) {
        return None;
    }
    let token = secret.data.as_ref().and_then(|d| d.get(TOKEN_KEY));
    Some(match token {
        Some(ByteString(bytes)) => String::from_utf8(bytes.clone())
            .map_err(|e| Error::serialization_for_kind("Secret", format!("token is not utf-8: {e}"))),
        None => Err(Error::not_ready(
            "Secret",
            secret.name_any(),
            "service account token secret has no token data",
        )),
    })
}

/// Build the kubeconfig of a tenant service account
///
/// Token secrets referenced by the service account are tried first, then any
/// token secret annotated with its name.
pub async fn for_service_account(
    tenants: &dyn TenantClusters,
    cluster: &str,
    namespace: &str,
    service_account: &str,
) -> Result<String, Error> {
    let account = tenants
        .get_service_account(cluster, namespace, service_account)
        .await?;

    for reference in account.secrets.iter().flatten() {
        let Some(name) = reference.name.as_deref() else {
            continue;
        };
        let secret = match tenants.get_secret(cluster, namespace, name).await {
            Ok(Some(secret)) => secret,
            Ok(None) => continue,
            Err(e) => {
                debug!(cluster, namespace, secret = name, error = %e, "Skipping unreadable service account secret");
                continue;
            }
        };
        if let Some(token) = token_of(&secret) {
            return render(service_account, &token?, &tenants.certificate_authority(cluster)?);
        }
    }

    if let Some(secret) = tenants
        .service_account_secret(cluster, namespace, service_account)
        .await?
    {
        if let Some(token) = token_of(&secret) {
            return render(service_account, &token?, &tenants.certificate_authority(cluster)?);
        }
    }

    Err(Error::not_ready(
        "ServiceAccount",
        service_account,
        "no service account token secret found",
    ))
}

/// Build the host secret holding a tenant pod's kubeconfig
pub fn build_secret(
    cluster: &str,
    host_namespace: &str,
    tenant_pod: &Pod,
    kubeconfig: String,
) -> Result<Secret, Error> {
    let tenant_namespace = tenant_pod.namespace().ok_or_else(|| {
        Error::validation_for_field("metadata.namespace", "tenant pod has no namespace")
    })?;
    let mut secret = Secret {
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            KUBECONFIG_KEY.to_string(),
            ByteString(kubeconfig.into_bytes()),
        )])),
        ..Default::default()
    };
    secret.metadata.name = Some(secret_name(tenant_pod)?);
    secret.metadata.namespace = Some(host_namespace.to_string());
    BackReference::new(cluster, tenant_namespace).stamp(&mut secret.metadata);
    Ok(secret)
}

/// Owner reference making a host pod own its kubeconfig secret
pub fn owner_reference(host_pod: &Pod) -> Option<OwnerReference> {
    host_pod.controller_owner_ref(&()).map(|mut owner| {
        owner.controller = None;
        owner.block_owner_deletion = None;
        owner
    })
}
