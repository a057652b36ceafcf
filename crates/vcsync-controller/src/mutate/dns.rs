//! DNS policy rewriting for host pods
//!
//! Host pods cannot use the host cluster DNS, so cluster-first policies are
//! turned into a static config pointing at the tenant's DNS service.
//!
//! | policy                               | result                                  |
//! |--------------------------------------|-----------------------------------------|
//! | `None`                               | untouched                               |
//! | `ClusterFirstWithHostNet`            | static tenant config, policy `None`     |
//! | `ClusterFirst`, not host-networked   | static tenant config, policy `None`     |
//! | `ClusterFirst`, host-networked       | policy `None`                           |
//! | `Default`                            | policy `None`                           |
//!
//! Without a tenant DNS server the cluster-first cases fall back to `Default`.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{PodDNSConfig, PodDNSConfigOption, PodSpec};
use tracing::info;

const DNS_NONE: &str = "None";
const DNS_DEFAULT: &str = "Default";
const DNS_CLUSTER_FIRST: &str = "ClusterFirst";
const DNS_CLUSTER_FIRST_WITH_HOST_NET: &str = "ClusterFirstWithHostNet";

/// Keep the first occurrence of every entry, preserving order
pub fn omit_duplicates(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Rewrite the DNS settings of a host pod spec
///
/// `namespace` is the tenant namespace, used for the search path.
pub fn mutate_dns(
    spec: &mut PodSpec,
    cluster: &str,
    namespace: &str,
    cluster_domain: &str,
    name_server: Option<&str>,
) {
    let policy = spec
        .dns_policy
        .clone()
        .unwrap_or_else(|| DNS_CLUSTER_FIRST.to_string());
    let host_network = spec.host_network.unwrap_or(false);

    match policy.as_str() {
        DNS_NONE => {}
        DNS_CLUSTER_FIRST_WITH_HOST_NET => {
            cluster_first(spec, cluster, namespace, cluster_domain, name_server)
        }
        DNS_CLUSTER_FIRST if !host_network => {
            cluster_first(spec, cluster, namespace, cluster_domain, name_server)
        }
        DNS_CLUSTER_FIRST | DNS_DEFAULT => spec.dns_policy = Some(DNS_NONE.to_string()),
        _ => {}
    }
}

fn cluster_first(
    spec: &mut PodSpec,
    cluster: &str,
    namespace: &str,
    cluster_domain: &str,
    name_server: Option<&str>,
) {
    let Some(name_server) = name_server.filter(|ns| !ns.is_empty()) else {
        info!(
            cluster,
            "Tenant cluster has no DNS service, falling back to Default DNS policy"
        );
        spec.dns_policy = Some(DNS_DEFAULT.to_string());
        return;
    };

    let mut nameservers = vec![name_server.to_string()];
    let mut searches = if cluster_domain.is_empty() {
        Vec::new()
    } else {
        vec![
            format!("{namespace}.svc.{cluster_domain}"),
            format!("svc.{cluster_domain}"),
            cluster_domain.to_string(),
        ]
    };

    if let Some(existing) = spec.dns_config.take() {
        nameservers = omit_duplicates(
            existing
                .nameservers
                .unwrap_or_default()
                .into_iter()
                .chain(nameservers),
        );
        searches = omit_duplicates(
            existing
                .searches
                .unwrap_or_default()
                .into_iter()
                .chain(searches),
        );
    }

    spec.dns_policy = Some(DNS_NONE.to_string());
    spec.dns_config = Some(PodDNSConfig {
        nameservers: Some(nameservers),
        searches: (!searches.is_empty()).then_some(searches),
        options: Some(vec![PodDNSConfigOption {
            name: Some("ndots".to_string()),
            value: Some("5".to_string()),
        }]),
    });
}
