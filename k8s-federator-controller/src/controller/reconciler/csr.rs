use std::sync::Arc;

use async_trait::async_trait;
use k8s_federator_core::{
    credentials::{
        csr::{approve_certificate_signing_request, is_approved, rejection},
        user::csr_username,
    },
    kubernetes::{operations::try_get_resource, ClusterConnector, ObjectStore},
};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use log::{info, warn};

use crate::controller::runner::{Action, Reconcile};

use super::{context::ReconcilerContext, error::ReconcilerError};

/// Approves the CSRs behind user kubeconfigs and hands the issued
/// certificates over to them.
pub struct CsrReconciler<S, C> {
    context: Arc<ReconcilerContext<S, C>>,
}

impl<S, C> CsrReconciler<S, C> {
    pub fn new(context: Arc<ReconcilerContext<S, C>>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl<S, C> Reconcile for CsrReconciler<S, C>
where
    S: ObjectStore + 'static,
    C: ClusterConnector + 'static,
{
    type Error = ReconcilerError;

    fn kind(&self) -> &'static str {
        "CertificateSigningRequest"
    }

    async fn reconcile(&self, key: &str) -> Result<Action, ReconcilerError> {
        reconcile_csr(key, &self.context).await
    }
}

pub async fn reconcile_csr<S, C>(
    name: &str,
    context: &ReconcilerContext<S, C>,
) -> Result<Action, ReconcilerError>
where
    S: ObjectStore,
{
    let csr =
        match try_get_resource::<CertificateSigningRequest>(&context.host, None, name).await? {
            Some(csr) => csr,
            None => return Ok(Action::await_change()),
        };

    // only requests issued for user kubeconfigs are ours
    if csr_username(&csr).is_none() {
        return Ok(Action::await_change());
    }

    if let Some(reason) = rejection(&csr) {
        warn!("CertificateSigningRequest '{name}' was rejected: {reason}");
        return Ok(Action::await_change());
    }

    let csr = match is_approved(&csr) {
        true => csr,
        false => approve_certificate_signing_request(&context.host, &csr).await?,
    };

    match context
        .credentials
        .complete_user_kubeconfig(&context.host, &csr)
        .await?
    {
        true => {
            info!("Kubeconfig for CertificateSigningRequest '{name}' is complete");
            Ok(Action::await_change())
        }
        false => Ok(Action::requeue(context.credentials.csr.poll.interval)),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use k8s_federator_core::{
        allocations::OsRandom,
        credentials::{kubeconfig::KubeconfigDocument, CredentialManager},
        kubernetes::memory::{
            MemoryConnector, MemoryStore, SignerDecision, TestCertificateAuthority,
        },
    };
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::ObjectMeta;

    use super::*;
    use crate::{
        availability::StaticAgentProbe, config::ControllerConfig, events::RecordingEventSink,
    };

    fn context(host: Arc<MemoryStore>) -> ReconcilerContext<Arc<MemoryStore>, MemoryConnector> {
        ReconcilerContext {
            host,
            connector: MemoryConnector::new(),
            config: ControllerConfig::default(),
            credentials: CredentialManager {
                host_api_server: Some("https://host.example.com:6443".to_owned()),
                host_ca_bundle: b"host-ca".to_vec(),
                ..Default::default()
            },
            random: Arc::new(OsRandom),
            events: Arc::new(RecordingEventSink::default()),
            agent_probe: Arc::new(StaticAgentProbe(true)),
        }
    }

    async fn only_csr_name(host: &MemoryStore) -> String {
        let csrs: Vec<CertificateSigningRequest> = host.list(None).await.unwrap();
        assert_eq!(csrs.len(), 1);

        csrs[0].metadata.name.clone().unwrap()
    }

    #[tokio::test]
    async fn user_csr_is_approved_and_delivered() {
        let host = Arc::new(MemoryStore::new());
        let ca = Arc::new(TestCertificateAuthority::new().unwrap());
        host.set_signer(ca.signer(Duration::days(365)));
        let context = context(host.clone());
        context
            .credentials
            .create_user_kubeconfig(&host, "alice")
            .await
            .unwrap();
        let name = only_csr_name(&host).await;

        let action = reconcile_csr(&name, &context).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(host.count::<CertificateSigningRequest>(), 0);
        let raw = context
            .credentials
            .get_user_kubeconfig(&host, "alice")
            .await
            .unwrap()
            .unwrap();
        let document = KubeconfigDocument::from_bytes(&raw).unwrap();
        assert!(document.client_certificate().unwrap().is_some());
        assert!(document.client_key().unwrap().is_some());
    }

    #[tokio::test]
    async fn pending_signature_is_polled() {
        let host = Arc::new(MemoryStore::new());
        host.set_signer(Arc::new(|_: &CertificateSigningRequest| SignerDecision::Ignore));
        let context = context(host.clone());
        context
            .credentials
            .create_user_kubeconfig(&host, "bob")
            .await
            .unwrap();
        let name = only_csr_name(&host).await;

        let action = reconcile_csr(&name, &context).await.unwrap();

        assert_eq!(action, Action::requeue(context.credentials.csr.poll.interval));
        let csr: CertificateSigningRequest = host.get(None, &name).await.unwrap();
        assert!(is_approved(&csr));
    }

    #[tokio::test]
    async fn foreign_csr_is_left_alone() {
        let host = Arc::new(MemoryStore::new());
        host.insert(&CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some("node-csr".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        });
        let context = context(host.clone());

        reconcile_csr("node-csr", &context).await.unwrap();

        let csr: CertificateSigningRequest = host.get(None, "node-csr").await.unwrap();
        assert!(!is_approved(&csr));
        assert_eq!(host.count::<ConfigMap>(), 0);
    }
}
