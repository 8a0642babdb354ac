use std::collections::BTreeMap;

/// Carries the PEM private key of a CSR back to whoever asked for it.
pub const PRIVATE_KEY_ANNOTATION: &str = "kubesphere.io/private-key";
/// Set to "true" to unregister a cluster even when its member is unreachable.
pub const FORCE_DELETION_ANNOTATION: &str = "cluster.kubesphere.io/force-deletion";
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

pub fn get_private_key_annotations(private_key_pem: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        PRIVATE_KEY_ANNOTATION.to_owned(),
        private_key_pem.to_owned(),
    )])
}

pub fn get_service_account_annotations(service_account: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        SERVICE_ACCOUNT_NAME_ANNOTATION.to_owned(),
        service_account.to_owned(),
    )])
}
