use k8s_openapi::api::{
    core::v1::{Namespace, Secret, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
};
use log::{info, warn};

use crate::{
    kubernetes::{operations::try_remove_resource, ObjectStore, StoreError, StoreResource},
    resources::{crd::v1beta1::kubefedcluster::KubeFedCluster, federation::FederationMembership},
    KUBE_SYSTEM_NAMESPACE,
};

use super::{FederationError, UnjoinOptions};

/// Applies the failure policy of a single unjoin run.
struct Cleanup {
    force: bool,
}

impl Cleanup {
    fn check<T>(&self, step: &str, result: Result<T, StoreError>) -> Result<(), FederationError> {
        match result {
            Ok(_) => Ok(()),
            Err(err) if self.force => {
                warn!("Couldn't {step}, ignoring since deletion is forced! Reason: {err}");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn remove<K: StoreResource>(
        &self,
        store: &impl ObjectStore,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), FederationError> {
        let result = try_remove_resource::<K>(store, namespace, name).await;

        self.check(&format!("remove '{name}'"), result)
    }
}

async fn kube_system_uid(store: &impl ObjectStore) -> Result<Option<String>, StoreError> {
    let namespace: Namespace = store.get(None, KUBE_SYSTEM_NAMESPACE).await?;

    Ok(namespace.metadata.uid)
}

/// Whether both stores are backed by the same physical cluster.
async fn is_same_cluster(
    host: &impl ObjectStore,
    member: &impl ObjectStore,
) -> Result<bool, StoreError> {
    let host_uid = kube_system_uid(host).await?;
    let member_uid = kube_system_uid(member).await?;

    Ok(host_uid.is_some() && host_uid == member_uid)
}

async fn remove_member_resources(
    cleanup: &Cleanup,
    host: &impl ObjectStore,
    member: &impl ObjectStore,
    membership: &FederationMembership,
) -> Result<(), FederationError> {
    let namespace = membership.namespace.as_str();
    let role_name = membership.role_name();
    let health_check_role_name = membership.health_check_role_name();

    cleanup
        .remove::<ClusterRoleBinding>(member, None, &role_name)
        .await?;
    cleanup
        .remove::<ClusterRole>(member, None, &role_name)
        .await?;
    cleanup
        .remove::<RoleBinding>(member, Some(namespace), &role_name)
        .await?;
    cleanup
        .remove::<Role>(member, Some(namespace), &role_name)
        .await?;
    cleanup
        .remove::<ClusterRoleBinding>(member, None, &health_check_role_name)
        .await?;
    cleanup
        .remove::<ClusterRole>(member, None, &health_check_role_name)
        .await?;

    cleanup
        .remove::<Secret>(member, Some(namespace), &membership.token_secret_name())
        .await?;
    cleanup
        .remove::<ServiceAccount>(member, Some(namespace), &membership.service_account_name())
        .await?;

    match is_same_cluster(host, member).await {
        Ok(true) => {
            info!("Member is the host cluster itself, keeping namespace '{namespace}'");
            Ok(())
        }
        Ok(false) => cleanup.remove::<Namespace>(member, None, namespace).await,
        Err(err) => cleanup.check("compare kube-system namespaces", Err::<(), _>(err)),
    }
}

/// Reverts a join, tolerating whatever part of it is already gone.
///
/// `member` may be absent when the member cluster can't be reached, only the
/// host side is cleaned up then.
pub async fn unjoin_cluster<H, M>(
    host: &H,
    member: Option<&M>,
    options: &UnjoinOptions,
) -> Result<(), FederationError>
where
    H: ObjectStore,
    M: ObjectStore,
{
    let membership = &options.membership;
    let cleanup = Cleanup {
        force: options.force_deletion,
    };

    info!(
        "Removing '{}' cluster from the '{}' federation...",
        membership.cluster_name, membership.host_cluster_name
    );

    match member {
        Some(member) if !options.skip_member_cluster_resources => {
            remove_member_resources(&cleanup, host, member, membership).await?
        }
        _ => info!(
            "Skipping member side cleanup of '{}' cluster",
            membership.cluster_name
        ),
    }

    cleanup
        .remove::<Secret>(
            host,
            Some(&membership.namespace),
            &membership.host_secret_name(),
        )
        .await?;
    cleanup
        .remove::<KubeFedCluster>(host, Some(&membership.namespace), &membership.cluster_name)
        .await?;

    info!("Cluster '{}' left the federation", membership.cluster_name);

    Ok(())
}
