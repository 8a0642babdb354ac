use std::collections::BTreeMap;

use k8s_openapi::api::{certificates::v1::CertificateSigningRequest, core::v1::ConfigMap};
use kube::core::ObjectMeta;
use log::info;

use crate::{
    helpers::get_secs_since_unix_epoch,
    kubernetes::{
        operations::{create_or_reuse, try_get_resource, try_remove_resource},
        ObjectStore,
    },
    resources::labels::{get_user_labels, USERNAME_LABEL},
};

use super::{
    csr::{
        csr_name, generate_certificate_signing_request, issued_certificate, stashed_private_key,
        CertificateRequest,
    },
    kubeconfig::{assemble_kubeconfig, KubeconfigDocument},
    CredentialManager, CredentialsError,
};

/// Data key holding the kubeconfig document.
pub const KUBECONFIG_KEY: &str = "config";

pub fn user_kubeconfig_name(username: &str) -> String {
    format!("kubeconfig-{username}")
}

pub fn csr_username(csr: &CertificateSigningRequest) -> Option<&str> {
    csr.metadata
        .labels
        .as_ref()?
        .get(USERNAME_LABEL)
        .map(String::as_str)
}

impl CredentialManager {
    fn generate_user_config_map(&self, username: &str, kubeconfig: Vec<u8>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(user_kubeconfig_name(username)),
                namespace: Some(self.kubeconfig_namespace.to_owned()),
                labels: Some(get_user_labels(username)),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                KUBECONFIG_KEY.to_owned(),
                String::from_utf8_lossy(&kubeconfig).into_owned(),
            )])),
            ..Default::default()
        }
    }

    /// Stores a credential-less kubeconfig for `username` and requests its
    /// client certificate. The CSR reconciler fills the credentials in.
    pub async fn create_user_kubeconfig(
        &self,
        host: &impl ObjectStore,
        username: &str,
    ) -> Result<ConfigMap, CredentialsError> {
        let name = user_kubeconfig_name(username);
        if let Some(existing) =
            try_get_resource::<ConfigMap>(host, Some(&self.kubeconfig_namespace), &name).await?
        {
            return Ok(existing);
        }

        let server = self.host_api_server.as_deref().ok_or_else(|| {
            CredentialsError::InvalidKubeconfig("host API server isn't configured".to_owned())
        })?;
        let kubeconfig = assemble_kubeconfig(username, server, &self.host_ca_bundle, &[], &[])?;
        let config_map = create_or_reuse(
            host,
            &self.generate_user_config_map(username, kubeconfig),
            false,
        )
        .await?;

        let request = CertificateRequest::generate(username, &[])?;
        let csr = generate_certificate_signing_request(
            &csr_name(username, get_secs_since_unix_epoch()),
            &request,
            &self.csr.signer_name,
            Some(get_user_labels(username)),
        );
        create_or_reuse(host, &csr, false).await?;

        Ok(config_map)
    }

    pub async fn get_user_kubeconfig(
        &self,
        host: &impl ObjectStore,
        username: &str,
    ) -> Result<Option<Vec<u8>>, CredentialsError> {
        let config_map = try_get_resource::<ConfigMap>(
            host,
            Some(&self.kubeconfig_namespace),
            &user_kubeconfig_name(username),
        )
        .await?;

        Ok(config_map
            .and_then(|config_map| config_map.data)
            .and_then(|mut data| data.remove(KUBECONFIG_KEY))
            .map(String::into_bytes))
    }

    /// Copies a signed certificate into its user's kubeconfig and deletes
    /// the CSR. Returns `false` while the CSR is still waiting for the signer.
    pub async fn complete_user_kubeconfig(
        &self,
        host: &impl ObjectStore,
        csr: &CertificateSigningRequest,
    ) -> Result<bool, CredentialsError> {
        let csr_name = csr.metadata.name.clone().unwrap_or_default();
        let username = csr_username(csr).ok_or_else(|| {
            CredentialsError::InvalidKubeconfig(format!("CSR '{csr_name}' has no user label"))
        })?;
        let certificate = match issued_certificate(csr) {
            Some(certificate) => certificate,
            None => return Ok(false),
        };
        let private_key = stashed_private_key(csr).ok_or_else(|| {
            CredentialsError::InvalidKubeconfig(format!("CSR '{csr_name}' has no private key"))
        })?;

        let mut config_map: ConfigMap = host
            .get(
                Some(&self.kubeconfig_namespace),
                &user_kubeconfig_name(username),
            )
            .await?;
        let current = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(KUBECONFIG_KEY))
            .cloned()
            .unwrap_or_default();
        let mut kubeconfig = KubeconfigDocument::from_bytes(current.as_bytes())?;
        kubeconfig.set_client_credentials(certificate, private_key.as_bytes())?;

        config_map.data.get_or_insert_with(BTreeMap::new).insert(
            KUBECONFIG_KEY.to_owned(),
            String::from_utf8_lossy(&kubeconfig.to_bytes()?).into_owned(),
        );
        host.update(&config_map).await?;

        info!("Kubeconfig of user '{username}' is ready");
        try_remove_resource::<CertificateSigningRequest>(host, None, &csr_name).await?;

        Ok(true)
    }
}
