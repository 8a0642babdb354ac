use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{ClusterRoleBinding, RoleRef, Subject},
};
use kube::core::ObjectMeta;
use log::{info, warn};

use crate::{
    kubernetes::{operations::create_or_reuse, ObjectStore},
    resources::crd::v1alpha1::cluster::{
        Cluster, ClusterConditionType, ConditionStatus, ConnectionType,
    },
    KUBE_SYSTEM_NAMESPACE,
};

use super::{
    certificate::ClientCertificate, kubeconfig::KubeconfigDocument,
    token::ensure_service_account_token, CredentialManager, CredentialsError,
};

pub const EXPIRY_THRESHOLD_DAYS: i64 = 7;
pub const CLUSTER_ADMIN_SERVICE_ACCOUNT: &str = "kubesphere-cluster-admin";
const CLUSTER_ADMIN_CLUSTER_ROLE: &str = "cluster-admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// proxy-mode and host clusters manage their own credentials
    Exempt,
    /// no usable certificate, the expiry condition was dropped
    NoCertificate,
    /// the certificate is good for more than the threshold
    Valid,
    Renewed,
    /// cluster-admin certificates can't be reissued, a token took their place
    SwitchedToToken,
}

fn set_expiry_condition(
    cluster: &mut Cluster,
    certificate: &ClientCertificate,
    expiring: bool,
    now: DateTime<Utc>,
) {
    cluster.set_condition(
        ClusterConditionType::KubeConfigCertExpiresInSevenDays,
        ConditionStatus::from(expiring),
        "",
        &certificate
            .not_after
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        now,
    );
}

fn generate_cluster_admin_service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ADMIN_SERVICE_ACCOUNT.to_owned()),
            namespace: Some(KUBE_SYSTEM_NAMESPACE.to_owned()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn generate_cluster_admin_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ADMIN_SERVICE_ACCOUNT.to_owned()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "ClusterRole".to_owned(),
            name: CLUSTER_ADMIN_CLUSTER_ROLE.to_owned(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: CLUSTER_ADMIN_SERVICE_ACCOUNT.to_owned(),
            namespace: Some(KUBE_SYSTEM_NAMESPACE.to_owned()),
            ..Default::default()
        }]),
    }
}

impl CredentialManager {
    /// Rotates the client certificate in the cluster's kubeconfig once it
    /// gets within a week of expiring, keeping the expiry condition current.
    ///
    /// Only `cluster` is modified; persisting it is up to the caller.
    pub async fn renew_if_expiring_soon(
        &self,
        cluster: &mut Cluster,
        member: &impl ObjectStore,
        now: DateTime<Utc>,
    ) -> Result<RenewalOutcome, CredentialsError> {
        if cluster.spec.connection.type_ == ConnectionType::Proxy || cluster.is_host_cluster() {
            return Ok(RenewalOutcome::Exempt);
        }

        if cluster.spec.connection.kubeconfig.is_empty() {
            cluster.remove_condition(ClusterConditionType::KubeConfigCertExpiresInSevenDays);
            return Ok(RenewalOutcome::NoCertificate);
        }

        let mut kubeconfig = KubeconfigDocument::from_bytes(&cluster.spec.connection.kubeconfig)?;
        let certificate = match kubeconfig.client_certificate()? {
            Some(pem) => ClientCertificate::from_pem(&pem)?,
            None => {
                cluster.remove_condition(ClusterConditionType::KubeConfigCertExpiresInSevenDays);
                return Ok(RenewalOutcome::NoCertificate);
            }
        };

        if certificate.is_expired(now) {
            warn!(
                "Kubeconfig certificate of '{}' cluster expired at {}, it can't be renewed",
                cluster.metadata.name.as_deref().unwrap_or_default(),
                certificate.not_after
            );
            cluster.remove_condition(ClusterConditionType::KubeConfigCertExpiresInSevenDays);
            return Ok(RenewalOutcome::NoCertificate);
        }

        if !certificate.expires_within_days(now, EXPIRY_THRESHOLD_DAYS) {
            set_expiry_condition(cluster, &certificate, false, now);
            return Ok(RenewalOutcome::Valid);
        }

        set_expiry_condition(cluster, &certificate, true, now);
        info!(
            "Kubeconfig certificate of '{}' cluster expires at {}, renewing...",
            cluster.metadata.name.as_deref().unwrap_or_default(),
            certificate.not_after
        );

        let outcome = if certificate.is_cluster_admin() {
            self.switch_to_token(&mut kubeconfig, member).await?
        } else {
            let username = certificate.common_name.clone().unwrap_or_default();
            match self
                .issue_client_certificate(member, &username, &certificate.organizations)
                .await
            {
                Ok(issued) => {
                    kubeconfig.set_client_credentials(&issued.certificate, &issued.private_key)?;
                    let renewed = ClientCertificate::from_pem(&issued.certificate)?;
                    set_expiry_condition(
                        cluster,
                        &renewed,
                        renewed.expires_within_days(now, EXPIRY_THRESHOLD_DAYS),
                        now,
                    );
                    RenewalOutcome::Renewed
                }
                Err(CredentialsError::PolicyDenied(name, reason)) => {
                    warn!("Signer refused '{name}' ({reason}), falling back to a token");
                    self.switch_to_token(&mut kubeconfig, member).await?
                }
                Err(err) => return Err(err),
            }
        };

        if outcome == RenewalOutcome::SwitchedToToken {
            cluster.remove_condition(ClusterConditionType::KubeConfigCertExpiresInSevenDays);
        }
        cluster.spec.connection.kubeconfig = kubeconfig.to_bytes()?;

        Ok(outcome)
    }

    async fn switch_to_token(
        &self,
        kubeconfig: &mut KubeconfigDocument,
        member: &impl ObjectStore,
    ) -> Result<RenewalOutcome, CredentialsError> {
        create_or_reuse(member, &generate_cluster_admin_service_account(), false).await?;
        create_or_reuse(member, &generate_cluster_admin_binding(), false).await?;

        let token = ensure_service_account_token(
            member,
            KUBE_SYSTEM_NAMESPACE,
            CLUSTER_ADMIN_SERVICE_ACCOUNT,
            &format!("{CLUSTER_ADMIN_SERVICE_ACCOUNT}-token"),
            self.token_poll,
        )
        .await?;
        let token = String::from_utf8(token.token)
            .map_err(|err| CredentialsError::InvalidKubeconfig(err.to_string()))?;

        kubeconfig.set_token(&token)?;

        Ok(RenewalOutcome::SwitchedToToken)
    }
}
