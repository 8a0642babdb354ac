use derive_builder::Builder;
use kube::core::ObjectMeta;

use crate::{DEFAULT_FEDERATION_NAMESPACE, DEFAULT_HOST_CLUSTER_NAME};

pub mod kubefedcluster;
pub mod rbac;
pub mod secret;

const CONTROLLER_MANAGER_PREFIX: &str = "kubefed-controller-manager";

/// How much of the member cluster the federation may touch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FederationScope {
    /// limited to the federation namespace, plus health checks
    NamespaceScoped,
    #[default]
    ClusterScoped,
}

/// Names and generates everything binding one member to one host.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct FederationMembership {
    pub cluster_name: String,
    #[builder(default = "DEFAULT_HOST_CLUSTER_NAME.to_owned()")]
    pub host_cluster_name: String,
    /// federation namespace, the same on host and member
    #[builder(default = "DEFAULT_FEDERATION_NAMESPACE.to_owned()")]
    pub namespace: String,
    #[builder(default)]
    pub scope: FederationScope,
}

impl FederationMembership {
    pub fn service_account_name(&self) -> String {
        format!("{}-{}", self.cluster_name, self.host_cluster_name)
    }

    pub fn role_name(&self) -> String {
        format!(
            "{CONTROLLER_MANAGER_PREFIX}:{}",
            self.service_account_name()
        )
    }

    pub fn health_check_role_name(&self) -> String {
        format!(
            "{CONTROLLER_MANAGER_PREFIX}:{}:healthcheck-{}",
            self.namespace,
            self.service_account_name()
        )
    }

    pub fn token_secret_name(&self) -> String {
        format!("{}-token", self.service_account_name())
    }

    pub fn host_secret_name(&self) -> String {
        format!("{}-secret", self.cluster_name)
    }

    pub fn generate_namespaced_metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.to_owned()),
            ..Default::default()
        }
    }

    pub fn generate_cluster_metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            ..Default::default()
        }
    }
}
