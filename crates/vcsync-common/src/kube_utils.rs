//! Kubernetes client construction for the host and tenant control planes

use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connect timeout for API server connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read timeout for API server responses
///
/// Watches are long-polls, so this must exceed the server-side watch timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(330);

/// Create a kube client from optional kubeconfig path
///
/// With no path the in-cluster or `KUBECONFIG` configuration is inferred.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = read_kubeconfig(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig {}: {}", path.display(), e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

fn read_kubeconfig(path: &Path) -> Result<Kubeconfig, Error> {
    Kubeconfig::read_from(path).map_err(|e| {
        Error::internal_with_context(
            "create_client",
            format!("failed to read kubeconfig {}: {}", path.display(), e),
        )
    })
}

/// Base64-encoded CA bundle of the current context's cluster
///
/// Inline `certificate-authority-data` is returned as-is; a
/// `certificate-authority` file reference is read and encoded.
pub fn certificate_authority_data(kubeconfig: &Kubeconfig) -> Result<String, Error> {
    let context_name = kubeconfig.current_context.as_deref().ok_or_else(|| {
        Error::validation_for_field("current-context", "kubeconfig has no current context")
    })?;
    let cluster_name = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .and_then(|c| c.context.as_ref())
        .map(|c| c.cluster.clone())
        .ok_or_else(|| {
            Error::validation_for_field(
                "contexts",
                format!("context {context_name} not found in kubeconfig"),
            )
        })?;
    let cluster = kubeconfig
        .clusters
        .iter()
        .find(|c| c.name == cluster_name)
        .and_then(|c| c.cluster.as_ref())
        .ok_or_else(|| {
            Error::validation_for_field(
                "clusters",
                format!("cluster {cluster_name} not found in kubeconfig"),
            )
        })?;

    if let Some(data) = cluster.certificate_authority_data.as_ref() {
        return Ok(data.clone());
    }
    match cluster.certificate_authority.as_ref() {
        Some(path) => {
            let pem = std::fs::read(path).map_err(|e| {
                Error::internal_with_context(
                    "certificate_authority_data",
                    format!("failed to read CA file {path}: {e}"),
                )
            })?;
            Ok(STANDARD.encode(pem))
        }
        None => Err(Error::validation_for_field(
            "clusters",
            format!("cluster {cluster_name} has no certificate authority"),
        )),
    }
}

/// Read a kubeconfig file and return its current cluster's CA bundle
pub fn certificate_authority_from_file(path: &Path) -> Result<String, Error> {
    certificate_authority_data(&read_kubeconfig(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: west
clusters:
- name: west-cluster
  cluster:
    server: https://west.example:6443
    certificate-authority-data: Q0EtREFUQQ==
contexts:
- name: west
  context:
    cluster: west-cluster
    user: admin
users:
- name: admin
  user:
    token: abc
"#;

    #[test]
    fn test_inline_ca_is_returned() {
        let kubeconfig = Kubeconfig::from_yaml(KUBECONFIG).expect("valid kubeconfig");
        assert_eq!(
            certificate_authority_data(&kubeconfig).expect("ca present"),
            "Q0EtREFUQQ=="
        );
    }

    #[test]
    fn test_missing_context_is_validation_error() {
        let mut kubeconfig = Kubeconfig::from_yaml(KUBECONFIG).expect("valid kubeconfig");
        kubeconfig.current_context = Some("east".to_string());
        let err = certificate_authority_data(&kubeconfig).expect_err("unknown context");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_ca_is_validation_error() {
        let mut kubeconfig = Kubeconfig::from_yaml(KUBECONFIG).expect("valid kubeconfig");
        if let Some(cluster) = kubeconfig.clusters[0].cluster.as_mut() {
            cluster.certificate_authority_data = None;
        }
        assert!(certificate_authority_data(&kubeconfig).is_err());
    }

    #[test]
    fn test_ca_read_from_kubeconfig_file() {
        let path = std::env::temp_dir().join(format!("vcsync-kubeconfig-{}.yaml", std::process::id()));
        std::fs::write(&path, KUBECONFIG).expect("write kubeconfig");
        let ca = certificate_authority_from_file(&path);
        std::fs::remove_file(&path).expect("remove kubeconfig");
        assert_eq!(ca.expect("ca present"), "Q0EtREFUQQ==");

        let err = certificate_authority_from_file(&path).expect_err("file is gone");
        assert!(err.to_string().contains("failed to read kubeconfig"));
    }
}
