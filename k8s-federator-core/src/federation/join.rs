use k8s_openapi::api::{
    core::v1::{Namespace, Secret, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding, RoleRef, Subject},
};
use kube::core::ObjectMeta;
use log::info;

use crate::{
    credentials::token::ensure_service_account_token,
    helpers::pretty_type_name,
    kubernetes::{
        operations::{
            create_or_reuse, create_or_update_resource, try_get_resource, try_remove_resource,
        },
        ObjectStore, StoreError, StoreResource,
    },
    resources::{
        crd::v1beta1::kubefedcluster::KubeFedCluster,
        federation::{FederationMembership, FederationScope},
    },
};

use super::{FederationError, JoinOptions};

/// RBAC bindings, whose role reference can't change once created.
trait Binding: StoreResource {
    fn role_ref(&self) -> &RoleRef;
    fn subjects(&self) -> &Option<Vec<Subject>>;
    fn subjects_mut(&mut self) -> &mut Option<Vec<Subject>>;
}

impl Binding for RoleBinding {
    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn subjects(&self) -> &Option<Vec<Subject>> {
        &self.subjects
    }

    fn subjects_mut(&mut self) -> &mut Option<Vec<Subject>> {
        &mut self.subjects
    }
}

impl Binding for ClusterRoleBinding {
    fn role_ref(&self) -> &RoleRef {
        &self.role_ref
    }

    fn subjects(&self) -> &Option<Vec<Subject>> {
        &self.subjects
    }

    fn subjects_mut(&mut self) -> &mut Option<Vec<Subject>> {
        &mut self.subjects
    }
}

/// Creates the binding, updates its subjects, or recreates it when the
/// stored role reference differs from the desired one.
async fn ensure_binding<B: Binding>(
    store: &impl ObjectStore,
    desired: &B,
    error_on_existing: bool,
) -> Result<B, StoreError> {
    let name = desired.meta().name.clone().unwrap_or_default();
    let namespace = desired.meta().namespace.clone();

    if let Some(existing) = try_get_resource::<B>(store, namespace.as_deref(), &name).await? {
        if error_on_existing {
            return Err(StoreError::already_exists::<B>(&name));
        }

        if existing.role_ref() != desired.role_ref() {
            info!(
                "'{name}' {} points at a different role, recreating it...",
                pretty_type_name::<B>()
            );
            try_remove_resource::<B>(store, namespace.as_deref(), &name).await?;

            return store.create(desired).await;
        }
    }

    create_or_update_resource(store, desired, error_on_existing, |existing, desired| {
        if existing.subjects() == desired.subjects() {
            return false;
        }
        *existing.subjects_mut() = desired.subjects().clone();
        true
    })
    .await
}

async fn ensure_cluster_role(
    store: &impl ObjectStore,
    desired: &ClusterRole,
    error_on_existing: bool,
) -> Result<ClusterRole, StoreError> {
    create_or_update_resource(store, desired, error_on_existing, |existing, desired| {
        if existing.rules == desired.rules {
            return false;
        }
        existing.rules = desired.rules.clone();
        true
    })
    .await
}

async fn ensure_role(
    store: &impl ObjectStore,
    desired: &Role,
    error_on_existing: bool,
) -> Result<Role, StoreError> {
    create_or_update_resource(store, desired, error_on_existing, |existing, desired| {
        if existing.rules == desired.rules {
            return false;
        }
        existing.rules = desired.rules.clone();
        true
    })
    .await
}

async fn ensure_namespace(store: &impl ObjectStore, name: &str) -> Result<Namespace, StoreError> {
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            ..Default::default()
        },
        ..Default::default()
    };

    info!("Ensuring namespace '{name}' is created...");
    create_or_reuse(store, &namespace, false).await
}

async fn grant_access(
    member: &impl ObjectStore,
    membership: &FederationMembership,
    error_on_existing: bool,
) -> Result<(), StoreError> {
    match membership.scope {
        FederationScope::ClusterScoped => {
            ensure_cluster_role(member, &membership.generate_cluster_role(), error_on_existing)
                .await?;
            ensure_binding(
                member,
                &membership.generate_cluster_role_binding(),
                error_on_existing,
            )
            .await?;
        }
        FederationScope::NamespaceScoped => {
            ensure_role(member, &membership.generate_role(), error_on_existing).await?;
            ensure_binding(member, &membership.generate_role_binding(), error_on_existing).await?;
            ensure_cluster_role(
                member,
                &membership.generate_health_check_cluster_role(),
                error_on_existing,
            )
            .await?;
            ensure_binding(
                member,
                &membership.generate_health_check_cluster_role_binding(),
                error_on_existing,
            )
            .await?;
        }
    }

    Ok(())
}

/// Registers the member cluster with the federation running on the host.
///
/// Every step can be rerun: existing objects are reused or brought up to
/// date unless `error_on_existing` asks for a strict first join.
pub async fn join_cluster_for_namespace(
    host: &impl ObjectStore,
    member: &impl ObjectStore,
    options: &JoinOptions,
) -> Result<KubeFedCluster, FederationError> {
    let membership = &options.membership;
    let namespace = membership.namespace.as_str();
    let service_account_name = membership.service_account_name();

    info!(
        "Joining '{}' cluster to the '{}' federation...",
        membership.cluster_name, membership.host_cluster_name
    );

    if options.error_on_existing
        && try_get_resource::<ServiceAccount>(member, Some(namespace), &service_account_name)
            .await?
            .is_some()
    {
        return Err(FederationError::ServiceAccountExists(service_account_name));
    }

    ensure_namespace(member, namespace).await?;
    create_or_reuse(
        member,
        &membership.generate_service_account(),
        options.error_on_existing,
    )
    .await?;
    grant_access(member, membership, options.error_on_existing).await?;

    let token = ensure_service_account_token(
        member,
        namespace,
        &service_account_name,
        &membership.token_secret_name(),
        options.token_poll,
    )
    .await?;

    ensure_namespace(host, namespace).await?;
    let secret = membership.generate_host_secret(&token.token, token.ca_bundle.as_deref());
    create_or_update_resource(
        host,
        &secret,
        options.error_on_existing,
        |existing: &mut Secret, desired| {
            if existing.data == desired.data {
                return false;
            }
            existing.data = desired.data.clone();
            true
        },
    )
    .await?;

    let ca_bundle = options.ca_bundle.as_deref().or(token.ca_bundle.as_deref());
    let kubefed_cluster =
        membership.generate_kubefed_cluster(&options.api_endpoint, ca_bundle, options.insecure);
    let kubefed_cluster = create_or_update_resource(
        host,
        &kubefed_cluster,
        options.error_on_existing,
        |existing: &mut KubeFedCluster, desired| {
            if existing.spec == desired.spec {
                return false;
            }
            existing.spec = desired.spec.clone();
            true
        },
    )
    .await?;

    info!("Cluster '{}' joined the federation", membership.cluster_name);

    Ok(kubefed_cluster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        federation::JoinOptionsBuilder,
        kubernetes::memory::MemoryStore,
        resources::federation::FederationMembershipBuilder,
    };

    fn options(scope: FederationScope) -> JoinOptions {
        let membership = FederationMembershipBuilder::default()
            .cluster_name("member")
            .scope(scope)
            .build()
            .unwrap();

        JoinOptionsBuilder::default()
            .membership(membership)
            .api_endpoint("https://member.example.com:6443")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn join_registers_member_with_token() {
        let host = MemoryStore::new();
        let member = MemoryStore::new().with_ca_bundle(b"member-ca");
        let options = options(FederationScope::ClusterScoped);

        let kubefed_cluster = join_cluster_for_namespace(&host, &member, &options)
            .await
            .unwrap();

        assert_eq!(kubefed_cluster.spec.secret_ref.name, "member-secret");
        assert_eq!(kubefed_cluster.spec.ca_bundle.as_deref(), Some("bWVtYmVyLWNh"));
        let secret: Secret = host
            .get(Some("kube-federation-system"), "member-secret")
            .await
            .unwrap();
        assert_eq!(
            secret.data.unwrap()["token"].0,
            b"token-member-host".to_vec()
        );
        assert!(member.contains::<ServiceAccount>(Some("kube-federation-system"), "member-host"));
        assert!(member.contains::<ClusterRoleBinding>(
            None,
            "kubefed-controller-manager:member-host"
        ));
        assert!(member.contains::<Namespace>(None, "kube-federation-system"));
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let host = MemoryStore::new();
        let member = MemoryStore::new();
        let options = options(FederationScope::NamespaceScoped);

        join_cluster_for_namespace(&host, &member, &options).await.unwrap();
        let binding: RoleBinding = member
            .get(Some("kube-federation-system"), &options.membership.role_name())
            .await
            .unwrap();
        join_cluster_for_namespace(&host, &member, &options).await.unwrap();
        let rejoined: RoleBinding = member
            .get(Some("kube-federation-system"), &options.membership.role_name())
            .await
            .unwrap();

        assert_eq!(binding.metadata.uid, rejoined.metadata.uid);
        assert_eq!(binding.metadata.resource_version, rejoined.metadata.resource_version);
        assert_eq!(member.count::<ServiceAccount>(), 1);
        assert_eq!(member.count::<Role>(), 1);
        assert_eq!(member.count::<RoleBinding>(), 1);
        assert_eq!(member.count::<ClusterRole>(), 1);
        assert_eq!(member.count::<ClusterRoleBinding>(), 1);
        assert_eq!(host.count::<Secret>(), 1);
        assert_eq!(host.count::<KubeFedCluster>(), 1);
    }

    #[tokio::test]
    async fn mismatched_role_ref_is_recreated() {
        let host = MemoryStore::new();
        let member = MemoryStore::new();
        let options = options(FederationScope::ClusterScoped);
        let mut stale = options.membership.generate_cluster_role_binding();
        stale.role_ref.name = "view".to_owned();
        let stale = member.create(&stale).await.unwrap();

        join_cluster_for_namespace(&host, &member, &options).await.unwrap();
        let binding: ClusterRoleBinding = member
            .get(None, &options.membership.role_name())
            .await
            .unwrap();

        assert_eq!(binding.role_ref.name, options.membership.role_name());
        assert_ne!(binding.metadata.uid, stale.metadata.uid);
        assert_eq!(member.count::<ClusterRoleBinding>(), 1);
    }

    #[tokio::test]
    async fn strict_join_rejects_existing_service_account() {
        let host = MemoryStore::new();
        let member = MemoryStore::new();
        let mut options = options(FederationScope::ClusterScoped);
        member
            .create(&options.membership.generate_service_account())
            .await
            .unwrap();
        options.error_on_existing = true;

        let result = join_cluster_for_namespace(&host, &member, &options).await;

        assert!(matches!(
            result,
            Err(FederationError::ServiceAccountExists(name)) if name == "member-host"
        ));
        assert_eq!(host.count::<KubeFedCluster>(), 0);
    }

    #[tokio::test]
    async fn insecure_members_skip_tls_validation() {
        let host = MemoryStore::new();
        let member = MemoryStore::new();
        let mut options = options(FederationScope::ClusterScoped);
        options.insecure = true;

        let kubefed_cluster = join_cluster_for_namespace(&host, &member, &options)
            .await
            .unwrap();

        assert_eq!(
            kubefed_cluster.spec.disabled_tls_validations,
            Some(vec!["*".to_owned()])
        );
    }
}
