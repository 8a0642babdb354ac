use std::collections::BTreeMap;

/// Marks the cluster running the control plane.
pub const HOST_CLUSTER_LABEL: &str = "cluster-role.kubesphere.io/host";
/// Ties a legacy CSR to the user whose kubeconfig it completes.
pub const USERNAME_LABEL: &str = "kubesphere.io/username";

pub fn get_user_labels(username: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(USERNAME_LABEL.to_owned(), username.to_owned())])
}

pub fn get_proxy_selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), "tower".to_owned()),
        ("app".to_owned(), "tower".to_owned()),
    ])
}

pub fn get_proxy_service_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), "tower".to_owned()),
        ("app".to_owned(), "tower".to_owned()),
        ("cluster.kubesphere.io/name".to_owned(), cluster_name.to_owned()),
    ])
}
