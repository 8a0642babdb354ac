use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::core::ObjectMeta;

use crate::resources::annotations::get_service_account_annotations;

use super::FederationMembership;

pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
pub const TOKEN_KEY: &str = "token";
pub const CA_CERT_KEY: &str = "ca.crt";

impl FederationMembership {
    /// Member-side secret the API server fills with the account's token.
    pub fn generate_token_secret(&self) -> Secret {
        generate_service_account_token_secret(
            &self.namespace,
            &self.service_account_name(),
            self.token_secret_name(),
        )
    }

    /// Host-side copy of the member credentials the federation connects with.
    pub fn generate_host_secret(&self, token: &[u8], ca_bundle: Option<&[u8]>) -> Secret {
        let mut data = BTreeMap::from([(TOKEN_KEY.to_owned(), ByteString(token.to_vec()))]);
        if let Some(ca_bundle) = ca_bundle {
            data.insert(CA_CERT_KEY.to_owned(), ByteString(ca_bundle.to_vec()));
        }

        Secret {
            metadata: self.generate_namespaced_metadata(self.host_secret_name()),
            data: Some(data),
            ..Default::default()
        }
    }
}

pub fn generate_service_account_token_secret(
    namespace: &str,
    service_account: &str,
    name: String,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_owned()),
            annotations: Some(get_service_account_annotations(service_account)),
            ..Default::default()
        },
        type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_owned()),
        ..Default::default()
    }
}

/// Returns the token and CA bundle of a populated token secret.
pub fn extract_token_data(secret: &Secret) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
    let data = secret.data.as_ref()?;
    let token = data.get(TOKEN_KEY).filter(|token| !token.0.is_empty())?;
    let ca_bundle = data.get(CA_CERT_KEY).map(|ca| ca.0.clone());

    Some((token.0.clone(), ca_bundle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::federation::FederationMembershipBuilder;

    #[test]
    fn host_secret_carries_token_and_ca() {
        let membership = FederationMembershipBuilder::default()
            .cluster_name("member")
            .build()
            .unwrap();

        let secret = membership.generate_host_secret(b"token", Some(b"ca"));

        assert_eq!(secret.metadata.name.as_deref(), Some("member-secret"));
        assert_eq!(
            extract_token_data(&secret),
            Some((b"token".to_vec(), Some(b"ca".to_vec())))
        );
    }

    #[test]
    fn unpopulated_token_secret_has_no_token_data() {
        let membership = FederationMembershipBuilder::default()
            .cluster_name("member")
            .build()
            .unwrap();

        let secret = membership.generate_token_secret();

        assert_eq!(secret.type_.as_deref(), Some(SERVICE_ACCOUNT_TOKEN_TYPE));
        assert_eq!(extract_token_data(&secret), None);
    }
}
