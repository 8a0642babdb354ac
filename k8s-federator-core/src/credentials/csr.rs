use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::{
    api::certificates::v1::{
        CertificateSigningRequest, CertificateSigningRequestCondition,
        CertificateSigningRequestSpec,
    },
    apimachinery::pkg::apis::meta::v1::Time,
    ByteString,
};
use kube::core::ObjectMeta;
use log::{info, warn};
use x509_parser::{
    certification_request::X509CertificationRequest, pem::parse_x509_pem, prelude::FromDer,
};

use crate::{
    helpers::get_secs_since_unix_epoch,
    kubernetes::{
        poll::{poll_until, PollError},
        ObjectStore, StoreError,
    },
    resources::annotations::{get_private_key_annotations, PRIVATE_KEY_ANNOTATION},
};

use super::{
    encoding::{encode_certification_request, encode_subject, generate_key_pair, to_pem},
    CredentialManager, CredentialsError, CsrSettings,
};

const CSR_USAGES: [&str; 3] = ["digital signature", "key encipherment", "client auth"];
const APPROVED: &str = "Approved";
const DENIED: &str = "Denied";
const FAILED: &str = "Failed";
const CSR_PEM_LABEL: &str = "CERTIFICATE REQUEST";

/// Freshly generated key pair and the PKCS#10 request for it.
pub struct CertificateRequest {
    key_pem: String,
    csr_pem: String,
}

impl CertificateRequest {
    pub fn generate(username: &str, groups: &[String]) -> Result<Self, CredentialsError> {
        let key_pair = generate_key_pair()?;
        let subject = encode_subject(username, groups);
        let request = encode_certification_request(&subject, &key_pair)?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_pem: to_pem(CSR_PEM_LABEL, &request),
        })
    }

    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

/// A signed client certificate along with its private key, both PEM.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub csr_name: String,
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

pub fn csr_name(username: &str, unix_secs: u64) -> String {
    format!("{username}-csr-{unix_secs}")
}

pub fn generate_certificate_signing_request(
    name: &str,
    request: &CertificateRequest,
    signer_name: &str,
    labels: Option<BTreeMap<String, String>>,
) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels,
            annotations: Some(get_private_key_annotations(request.private_key_pem())),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(request.csr_pem().as_bytes().to_vec()),
            signer_name: signer_name.to_owned(),
            usages: Some(CSR_USAGES.iter().map(|usage| (*usage).to_owned()).collect()),
            ..Default::default()
        },
        status: None,
    }
}

/// DER SubjectPublicKeyInfo of a PEM encoded PKCS#10 request.
pub fn request_public_key(csr_pem: &[u8]) -> Result<Vec<u8>, CredentialsError> {
    let (_, pem) = parse_x509_pem(csr_pem)
        .map_err(|err| CredentialsError::InvalidCertificate(err.to_string()))?;
    let (_, request) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|err| CredentialsError::InvalidCertificate(err.to_string()))?;

    Ok(request.certification_request_info.subject_pki.raw.to_vec())
}

fn find_condition<'a>(
    csr: &'a CertificateSigningRequest,
    type_: &str,
) -> Option<&'a CertificateSigningRequestCondition> {
    csr.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|condition| condition.type_ == type_ && condition.status == "True")
}

pub fn is_approved(csr: &CertificateSigningRequest) -> bool {
    find_condition(csr, APPROVED).is_some()
}

/// Message of the condition that stopped the CSR from being signed, if any.
pub fn rejection(csr: &CertificateSigningRequest) -> Option<String> {
    find_condition(csr, DENIED)
        .or_else(|| find_condition(csr, FAILED))
        .map(|condition| {
            condition
                .message
                .clone()
                .or_else(|| condition.reason.clone())
                .unwrap_or_else(|| condition.type_.to_owned())
        })
}

pub fn issued_certificate(csr: &CertificateSigningRequest) -> Option<&[u8]> {
    csr.status
        .as_ref()?
        .certificate
        .as_ref()
        .map(|certificate| certificate.0.as_slice())
        .filter(|certificate| !certificate.is_empty())
}

pub fn stashed_private_key(csr: &CertificateSigningRequest) -> Option<&str> {
    csr.metadata
        .annotations
        .as_ref()?
        .get(PRIVATE_KEY_ANNOTATION)
        .map(String::as_str)
}

/// Marks the CSR approved, leaving already approved ones alone.
pub async fn approve_certificate_signing_request(
    store: &impl ObjectStore,
    csr: &CertificateSigningRequest,
) -> Result<CertificateSigningRequest, CredentialsError> {
    let name = csr.metadata.name.clone().unwrap_or_default();
    if is_approved(csr) {
        return Ok(csr.clone());
    }

    let mut approved = csr.clone();
    approved
        .status
        .get_or_insert_with(Default::default)
        .conditions
        .get_or_insert_with(Vec::new)
        .push(CertificateSigningRequestCondition {
            type_: APPROVED.to_owned(),
            status: "True".to_owned(),
            reason: Some("AutoApproved".to_owned()),
            message: Some("Approved by the cluster federation controller".to_owned()),
            last_update_time: Some(Time(Utc::now())),
            ..Default::default()
        });

    info!("Approving '{name}' CertificateSigningRequest...");

    store
        .approve_certificate_signing_request(&approved)
        .await
        .map_err(|err| match err {
            StoreError::Conflict { .. } => CredentialsError::ApprovalConflict(name.to_owned()),
            err => err.into(),
        })
}

/// Polls the CSR until the signer publishes a certificate.
pub async fn wait_for_certificate(
    store: &impl ObjectStore,
    name: &str,
    settings: &CsrSettings,
) -> Result<Vec<u8>, CredentialsError> {
    let result = poll_until(settings.poll, move || async move {
        let csr = store.get::<CertificateSigningRequest>(None, name).await?;
        if let Some(reason) = rejection(&csr) {
            return Err(CredentialsError::PolicyDenied(name.to_owned(), reason));
        }

        Ok::<_, CredentialsError>(issued_certificate(&csr).map(<[u8]>::to_vec))
    })
    .await;

    match result {
        Ok(certificate) => Ok(certificate),
        Err(PollError::Timeout(timeout)) => {
            warn!("'{name}' CertificateSigningRequest wasn't signed in time");
            Err(CredentialsError::IssuanceTimeout(name.to_owned(), timeout))
        }
        Err(PollError::Aborted(err)) => Err(err),
    }
}

impl CredentialManager {
    /// Requests, self-approves and waits for a client certificate.
    pub async fn issue_client_certificate(
        &self,
        store: &impl ObjectStore,
        username: &str,
        groups: &[String],
    ) -> Result<IssuedCertificate, CredentialsError> {
        let request = CertificateRequest::generate(username, groups)?;
        let name = csr_name(username, get_secs_since_unix_epoch());
        let csr =
            generate_certificate_signing_request(&name, &request, &self.csr.signer_name, None);

        info!("Creating '{name}' CertificateSigningRequest for user '{username}'...");
        let created = store.create(&csr).await?;
        approve_certificate_signing_request(store, &created).await?;
        let certificate = wait_for_certificate(store, &name, &self.csr).await?;

        Ok(IssuedCertificate {
            csr_name: name,
            certificate,
            private_key: request.private_key_pem().as_bytes().to_vec(),
        })
    }
}
