use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EnvVar, HostAlias, Pod};

use vcsync_common::Error;

use super::dns::mutate_dns;
use super::envvars::service_env;
use super::{PodMutateContext, PodMutator};

/// Hostnames of the virtual API server inside tenant pods
pub const API_SERVER_HOSTNAMES: [&str; 3] =
    ["kubernetes", "kubernetes.default", "kubernetes.default.svc"];

/// Baseline rewrite every host pod receives
pub struct DefaultMutator;

#[async_trait]
impl PodMutator for DefaultMutator {
    fn name(&self) -> &'static str {
        "default"
    }

    async fn mutate(&self, ctx: &mut PodMutateContext) -> Result<(), Error> {
        let host_namespace = ctx.pod.metadata.namespace.clone().unwrap_or_default();
        let tenant_namespace = ctx.tenant.metadata.namespace.clone().unwrap_or_default();

        ctx.pod.status = None;
        let spec = ctx.pod.spec.get_or_insert_with(Default::default);
        spec.node_name = None;

        let (api_server, service_env) = service_env(
            &ctx.cluster,
            &host_namespace,
            spec.enable_service_links,
            &ctx.side.services,
        )?;
        let api_server = api_server.ok_or_else(|| {
            Error::mutation(
                self.name(),
                format!(
                    "virtual API server service of cluster {} has no cluster IP",
                    ctx.cluster
                ),
            )
        })?;
        spec.host_aliases.get_or_insert_with(Vec::new).push(HostAlias {
            hostnames: Some(API_SERVER_HOSTNAMES.iter().map(|h| h.to_string()).collect()),
            ip: api_server,
        });

        let containers = spec
            .containers
            .iter_mut()
            .chain(spec.init_containers.iter_mut().flatten());
        for container in containers {
            mutate_container_env(container, &ctx.tenant, &service_env);
            rename_secret_mounts(container, &ctx.side.tenant_secret, &ctx.side.host_secret);
        }

        for volume in spec.volumes.iter_mut().flatten() {
            if volume.name != ctx.side.tenant_secret {
                continue;
            }
            volume.name = ctx.side.host_secret.clone();
            if let Some(secret) = volume.secret.as_mut() {
                secret.secret_name = Some(ctx.side.host_secret.clone());
            }
        }

        mutate_dns(
            spec,
            &ctx.cluster,
            &tenant_namespace,
            &ctx.side.cluster_domain,
            ctx.side.name_server.as_deref(),
        );

        spec.subdomain = None;
        Ok(())
    }
}

/// Merge service env into a container; user-declared names win
fn mutate_container_env(
    container: &mut Container,
    tenant: &Pod,
    service_env: &BTreeMap<String, String>,
) {
    let env = container.env.get_or_insert_with(Vec::new);
    let mut declared = HashSet::new();
    for var in env.iter_mut() {
        resolve_downward_field(var, tenant);
        declared.insert(var.name.clone());
    }
    for (name, value) in service_env {
        if !declared.contains(name) {
            env.push(EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            });
        }
    }
    if env.is_empty() {
        container.env = None;
    }
}

/// Replace a `metadata.*` field reference with the tenant's literal value
///
/// Host-side field references would resolve to host identity.
fn resolve_downward_field(var: &mut EnvVar, tenant: &Pod) {
    let Some(field_path) = var
        .value_from
        .as_ref()
        .and_then(|v| v.field_ref.as_ref())
        .map(|f| f.field_path.as_str())
    else {
        return;
    };
    if !field_path.starts_with("metadata") {
        return;
    }
    match field_path {
        "metadata.name" => var.value = tenant.metadata.name.clone(),
        "metadata.namespace" => var.value = tenant.metadata.namespace.clone(),
        "metadata.uid" => var.value = tenant.metadata.uid.clone(),
        _ => {}
    }
    var.value_from = None;
}

fn rename_secret_mounts(container: &mut Container, from: &str, to: &str) {
    for mount in container.volume_mounts.iter_mut().flatten() {
        if mount.name == from {
            mount.name = to.to_string();
        }
    }
}
