pub mod allocations;
pub mod credentials;
pub mod federation;
pub mod helpers;
pub mod kubernetes;
pub mod resources;

pub const RESOURCE_GROUP: &str = "cluster.kubesphere.io";
pub const FEDERATION_GROUP: &str = "core.kubefed.io";

pub const DEFAULT_HOST_CLUSTER_NAME: &str = "host";
pub const DEFAULT_FEDERATION_NAMESPACE: &str = "kube-federation-system";
pub const DEFAULT_PROXY_NAMESPACE: &str = "kubesphere-system";
pub const DEFAULT_KUBECONFIG_NAMESPACE: &str = "kubesphere-controls-system";
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
