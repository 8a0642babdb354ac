use crate::resources::crd::v1beta1::kubefedcluster::{
    KubeFedCluster, KubeFedClusterSpec, LocalSecretReference, DISABLE_ALL_TLS_VALIDATIONS,
};

use super::FederationMembership;

impl FederationMembership {
    pub fn generate_kubefed_cluster(
        &self,
        api_endpoint: &str,
        ca_bundle: Option<&[u8]>,
        insecure: bool,
    ) -> KubeFedCluster {
        KubeFedCluster {
            metadata: self.generate_namespaced_metadata(self.cluster_name.to_owned()),
            spec: KubeFedClusterSpec {
                api_endpoint: api_endpoint.to_owned(),
                ca_bundle: ca_bundle.map(|ca| data_encoding::BASE64.encode(ca)),
                secret_ref: LocalSecretReference {
                    name: self.host_secret_name(),
                },
                disabled_tls_validations: insecure
                    .then(|| vec![DISABLE_ALL_TLS_VALIDATIONS.to_owned()]),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::resources::federation::FederationMembershipBuilder;

    #[test]
    fn insecure_members_disable_tls_validation() {
        let membership = FederationMembershipBuilder::default()
            .cluster_name("member")
            .build()
            .unwrap();

        let secure = membership.generate_kubefed_cluster("https://member:6443", Some(b"ca"), false);
        let insecure = membership.generate_kubefed_cluster("https://member:6443", None, true);

        assert_eq!(secure.spec.ca_bundle.as_deref(), Some("Y2E="));
        assert_eq!(secure.spec.disabled_tls_validations, None);
        assert_eq!(secure.spec.secret_ref.name, "member-secret");
        assert_eq!(
            insecure.spec.disabled_tls_validations,
            Some(vec!["*".to_owned()])
        );
    }
}
