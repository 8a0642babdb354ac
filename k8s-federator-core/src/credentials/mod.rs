use std::time::Duration;

use thiserror::Error;

use crate::{
    kubernetes::{poll::PollSettings, StoreError},
    DEFAULT_KUBECONFIG_NAMESPACE,
};

use self::token::TokenError;

pub mod certificate;
pub mod csr;
pub mod encoding;
pub mod kubeconfig;
pub mod renewal;
pub mod token;
pub mod user;

pub const CLIENT_SIGNER_NAME: &str = "kubernetes.io/kube-apiserver-client";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("CSR '{}' wasn't signed within {:?}!", .0, .1)]
    IssuanceTimeout(String, Duration),
    #[error("Couldn't approve CSR '{}', it was modified in the meantime!", .0)]
    ApprovalConflict(String),
    #[error("Signer refused to issue a certificate for CSR '{}'! Reason: {}", .0, .1)]
    PolicyDenied(String, String),
    #[error("Couldn't generate a certificate request! Reason: {}", .0)]
    KeyGeneration(#[from] rcgen::Error),
    #[error("Couldn't parse the certificate! Reason: {}", .0)]
    InvalidCertificate(String),
    #[error("Couldn't process the kubeconfig! Reason: {}", .0)]
    InvalidKubeconfig(String),
    #[error("Couldn't obtain a service account token! Reason: {}", .0)]
    Token(#[from] TokenError),
    #[error("Kubernetes API request failed! Reason: {}", .0)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrSettings {
    pub signer_name: String,
    pub poll: PollSettings,
}

impl Default for CsrSettings {
    fn default() -> Self {
        Self {
            signer_name: CLIENT_SIGNER_NAME.to_owned(),
            poll: PollSettings::new(Duration::from_secs(3), Duration::from_secs(60)),
        }
    }
}

/// Issues, renews and stores client credentials.
#[derive(Debug, Clone)]
pub struct CredentialManager {
    pub csr: CsrSettings,
    pub token_poll: PollSettings,
    /// namespace of the legacy per-user kubeconfig config maps
    pub kubeconfig_namespace: String,
    /// host API server written into user kubeconfigs, `None` disables them
    pub host_api_server: Option<String>,
    pub host_ca_bundle: Vec<u8>,
}

impl Default for CredentialManager {
    fn default() -> Self {
        Self {
            csr: CsrSettings::default(),
            token_poll: PollSettings::new(Duration::from_secs(1), Duration::from_secs(30)),
            kubeconfig_namespace: DEFAULT_KUBECONFIG_NAMESPACE.to_owned(),
            host_api_server: None,
            host_ca_bundle: Vec::new(),
        }
    }
}
