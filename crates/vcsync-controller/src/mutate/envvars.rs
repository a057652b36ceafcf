//! Service environment variables, as the kubelet injects them
//!
//! For each visible service `NAME` with cluster IP `IP`:
//!
//! ```text
//! NAME_SERVICE_HOST=IP
//! NAME_SERVICE_PORT=<first port>
//! NAME_SERVICE_PORT_<PORTNAME>=<port>          (named ports)
//! NAME_PORT=<proto>://IP:<first port>
//! NAME_PORT_<port>_<PROTO>=<proto>://IP:<port>
//! NAME_PORT_<port>_<PROTO>_PROTO=<proto>
//! NAME_PORT_<port>_<PROTO>_PORT=<port>
//! NAME_PORT_<port>_<PROTO>_ADDR=IP
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use vcsync_common::{host_namespace, Error, MASTER_SERVICE_NAME, MASTER_SERVICE_NAMESPACE};

/// Cluster IP of a service, unless headless or unallocated
pub fn service_ip(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
}

fn env_name(name: &str) -> String {
    name.replace('-', "_").to_uppercase()
}

fn join_host_port(ip: &str, port: i32) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

/// Environment variables for a set of services
pub fn from_services<'a>(services: impl IntoIterator<Item = &'a Service>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for service in services {
        let Some(ip) = service_ip(service) else {
            continue;
        };
        let prefix = env_name(&service.name_any());
        let ports = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_deref())
            .unwrap_or_default();

        env.insert(format!("{prefix}_SERVICE_HOST"), ip.to_string());
        if let Some(first) = ports.first() {
            env.insert(format!("{prefix}_SERVICE_PORT"), first.port.to_string());
        }
        for port in ports {
            if let Some(port_name) = port.name.as_deref().filter(|n| !n.is_empty()) {
                env.insert(
                    format!("{prefix}_SERVICE_PORT_{}", env_name(port_name)),
                    port.port.to_string(),
                );
            }
        }

        for (i, port) in ports.iter().enumerate() {
            let protocol = port.protocol.as_deref().unwrap_or("TCP");
            let lower = protocol.to_lowercase();
            let url = format!("{lower}://{}", join_host_port(ip, port.port));
            if i == 0 {
                env.insert(format!("{prefix}_PORT"), url.clone());
            }
            let port_prefix = format!("{prefix}_PORT_{}_{}", port.port, protocol.to_uppercase());
            env.insert(format!("{port_prefix}_PROTO"), lower);
            env.insert(format!("{port_prefix}_PORT"), port.port.to_string());
            env.insert(format!("{port_prefix}_ADDR"), ip.to_string());
            env.insert(port_prefix, url);
        }
    }
    env
}

/// Virtual API server address and service environment for a host pod
///
/// The virtual API server service from the cluster's mapped `default`
/// namespace is always included. Services in the pod's own host namespace are
/// included only when service links are enabled.
pub fn service_env(
    cluster: &str,
    pod_namespace: &str,
    enable_service_links: Option<bool>,
    services: &[Arc<Service>],
) -> Result<(Option<String>, BTreeMap<String, String>), Error> {
    let master_namespace = host_namespace(cluster, MASTER_SERVICE_NAMESPACE)?;
    let mut api_server = None;
    let mut selected: BTreeMap<String, &Service> = BTreeMap::new();

    for service in services {
        let Some(ip) = service_ip(service) else {
            continue;
        };
        let name = service.name_any();
        let namespace = service.namespace().unwrap_or_default();
        if namespace == master_namespace && name == MASTER_SERVICE_NAME {
            api_server = Some(ip.to_string());
            selected.entry(name).or_insert(service.as_ref());
        } else if namespace == pod_namespace && enable_service_links == Some(true) {
            selected.insert(name, service.as_ref());
        }
    }

    Ok((api_server, from_services(selected.into_values())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutate::test_support::service;

    #[test]
    fn test_kubelet_variable_set() {
        let svc = service("ns", "redis-primary", "10.0.0.5", &[("", 6379), ("metrics", 9121)]);
        let env = from_services([svc.as_ref()]);

        assert_eq!(env["REDIS_PRIMARY_SERVICE_HOST"], "10.0.0.5");
        assert_eq!(env["REDIS_PRIMARY_SERVICE_PORT"], "6379");
        assert_eq!(env["REDIS_PRIMARY_SERVICE_PORT_METRICS"], "9121");
        assert_eq!(env["REDIS_PRIMARY_PORT"], "tcp://10.0.0.5:6379");
        assert_eq!(env["REDIS_PRIMARY_PORT_9121_TCP"], "tcp://10.0.0.5:9121");
        assert_eq!(env["REDIS_PRIMARY_PORT_9121_TCP_PROTO"], "tcp");
        assert_eq!(env["REDIS_PRIMARY_PORT_9121_TCP_PORT"], "9121");
        assert_eq!(env["REDIS_PRIMARY_PORT_9121_TCP_ADDR"], "10.0.0.5");
    }

    #[test]
    fn test_ipv6_addresses_are_bracketed() {
        let svc = service("ns", "dns", "fd00::10", &[("", 53)]);
        let env = from_services([svc.as_ref()]);
        assert_eq!(env["DNS_PORT"], "tcp://[fd00::10]:53");
    }

    #[test]
    fn test_headless_services_are_skipped() {
        let headless = service("ns", "db", "None", &[("", 5432)]);
        let pending = service("ns", "cache", "", &[("", 11211)]);
        assert!(from_services([headless.as_ref(), pending.as_ref()]).is_empty());
    }

    #[test]
    fn test_master_service_always_included() {
        let services = vec![
            service("4-west-default", "kubernetes", "10.0.0.1", &[("https", 443)]),
            service("4-west-team-a", "web", "10.0.0.20", &[("", 80)]),
        ];

        let (api, env) = service_env("west", "4-west-team-a", Some(false), &services).expect("env");
        assert_eq!(api.as_deref(), Some("10.0.0.1"));
        assert_eq!(env["KUBERNETES_SERVICE_HOST"], "10.0.0.1");
        assert!(!env.contains_key("WEB_SERVICE_HOST"));

        let (_, env) = service_env("west", "4-west-team-a", Some(true), &services).expect("env");
        assert_eq!(env["WEB_SERVICE_HOST"], "10.0.0.20");
    }

    #[test]
    fn test_other_clusters_master_service_ignored() {
        let services = vec![service("4-east-default", "kubernetes", "10.9.0.1", &[("https", 443)])];
        let (api, env) = service_env("west", "4-west-team-a", Some(true), &services).expect("env");
        assert!(api.is_none());
        assert!(env.is_empty());
    }
}
