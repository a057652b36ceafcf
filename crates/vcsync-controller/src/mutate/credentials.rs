use async_trait::async_trait;
use k8s_openapi::api::core::v1::{SecretVolumeSource, Volume, VolumeMount};

use vcsync_common::Error;

use super::{PodMutateContext, PodMutator};

/// Prefix of the generated kubeconfig volume name
pub const KUBECONFIG_VOLUME_PREFIX: &str = "vc-kubeconfig-";

/// Forces `automountServiceAccountToken: false` when enabled
pub struct AutomountMutator {
    disable: bool,
}

impl AutomountMutator {
    /// Create the mutator; `disable` turns token auto-mount off on every pod
    pub fn new(disable: bool) -> Self {
        Self { disable }
    }
}

#[async_trait]
impl PodMutator for AutomountMutator {
    fn name(&self) -> &'static str {
        "automount-token"
    }

    async fn mutate(&self, ctx: &mut PodMutateContext) -> Result<(), Error> {
        if self.disable {
            ctx.pod
                .spec
                .get_or_insert_with(Default::default)
                .automount_service_account_token = Some(false);
        }
        Ok(())
    }
}

/// Mounts the tenant kubeconfig secret read-only into every container
pub struct KubeconfigMutator {
    secret_name: String,
    mount_path: String,
}

impl KubeconfigMutator {
    /// Mount host secret `secret_name` at `mount_path`
    pub fn new(secret_name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            secret_name: secret_name.into(),
            mount_path: mount_path.into(),
        }
    }
}

#[async_trait]
impl PodMutator for KubeconfigMutator {
    fn name(&self) -> &'static str {
        "tenant-kubeconfig"
    }

    async fn mutate(&self, ctx: &mut PodMutateContext) -> Result<(), Error> {
        let volume_name = format!("{KUBECONFIG_VOLUME_PREFIX}{}", uuid::Uuid::new_v4());
        let spec = ctx.pod.spec.get_or_insert_with(Default::default);

        spec.volumes.get_or_insert_with(Vec::new).push(Volume {
            name: volume_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });

        let mount = VolumeMount {
            name: volume_name,
            mount_path: self.mount_path.clone(),
            read_only: Some(true),
            ..Default::default()
        };
        let containers = spec
            .containers
            .iter_mut()
            .chain(spec.init_containers.iter_mut().flatten());
        for container in containers {
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(mount.clone());
        }
        Ok(())
    }
}
