use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_federator_core::{
    allocations::{allocate_proxy_ports, generate_token, ProxyPorts},
    credentials::{kubeconfig::KubeconfigDocument, renewal::RenewalOutcome},
    federation::{
        join::join_cluster_for_namespace, unjoin::unjoin_cluster, JoinOptions, JoinOptionsBuilder,
        UnjoinOptions,
    },
    kubernetes::{
        operations::{create_or_update_resource, try_get_resource, try_remove_resource},
        ClusterConnector, ObjectStore, StoreError,
    },
    resources::{
        crd::v1alpha1::cluster::{
            Cluster, ClusterConditionType, ClusterLifecycle, ConditionStatus, ConnectionType,
        },
        federation::{FederationMembership, FederationMembershipBuilder},
        proxy::ProxyRelease,
    },
    KUBE_SYSTEM_NAMESPACE,
};
use k8s_openapi::api::core::v1::{Namespace, Node, ObjectReference, Service};
use kube::{runtime::events::EventType, Resource, ResourceExt};
use log::{debug, info, warn};

use crate::{
    controller::runner::{Action, Reconcile},
    events::reasons,
};

use super::{context::ReconcilerContext, error::ReconcilerError};

const JOINED_MESSAGE: &str = "Cluster has joined the federation control plane successfully";
const READY_MESSAGE: &str = "Cluster is available now";

pub struct ClusterReconciler<S, C> {
    context: Arc<ReconcilerContext<S, C>>,
}

impl<S, C> ClusterReconciler<S, C> {
    pub fn new(context: Arc<ReconcilerContext<S, C>>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl<S, C> Reconcile for ClusterReconciler<S, C>
where
    S: ObjectStore + 'static,
    C: ClusterConnector + 'static,
{
    type Error = ReconcilerError;

    fn kind(&self) -> &'static str {
        "Cluster"
    }

    async fn reconcile(&self, key: &str) -> Result<Action, ReconcilerError> {
        reconcile_cluster(key, &self.context).await
    }
}

pub async fn reconcile_cluster<S, C>(
    name: &str,
    context: &ReconcilerContext<S, C>,
) -> Result<Action, ReconcilerError>
where
    S: ObjectStore,
    C: ClusterConnector,
{
    let cluster = match try_get_resource::<Cluster>(&context.host, None, name).await? {
        Some(cluster) => cluster,
        None => return Ok(Action::await_change()),
    };

    debug!("Cluster '{name}': {}", cluster.phase());

    let cluster = match cluster.lifecycle() {
        ClusterLifecycle::Released => return Ok(Action::await_change()),
        ClusterLifecycle::PendingCleanup => {
            cleanup_cluster(cluster, context).await?;
            return Ok(Action::await_change());
        }
        ClusterLifecycle::Unregistered => register_finalizer(cluster, &context.host).await?,
        ClusterLifecycle::Active => cluster,
    };

    let original = cluster.clone();
    let mut cluster = cluster;
    let result = sync_cluster(&mut cluster, context).await;

    // conditions recorded by a failed step are worth keeping
    persist_cluster(&context.host, &original, cluster).await?;
    result?;

    Ok(Action::requeue(context.config.resync))
}

async fn register_finalizer(
    mut cluster: Cluster,
    host: &impl ObjectStore,
) -> Result<Cluster, StoreError> {
    info!("Registering finalizer on '{}' cluster...", cluster.name_any());

    cluster.add_finalizer();
    host.update(&cluster).await
}

/// Writes spec and metadata, then the status, skipping whatever didn't change.
async fn persist_cluster(
    host: &impl ObjectStore,
    original: &Cluster,
    mut cluster: Cluster,
) -> Result<Cluster, StoreError> {
    let status = cluster.status.clone();

    if cluster.spec != original.spec || cluster.metadata != original.metadata {
        cluster = host.update(&cluster).await?;
    }

    if status != original.status {
        cluster.status = status;
        cluster = host.update_status(&cluster).await?;
    }

    Ok(cluster)
}

async fn sync_cluster<S, C>(
    cluster: &mut Cluster,
    context: &ReconcilerContext<S, C>,
) -> Result<(), ReconcilerError>
where
    S: ObjectStore,
    C: ClusterConnector,
{
    let name = cluster.name_any();

    if cluster.spec.connection.needs_proxy_initialization() {
        return initialize_proxy(cluster, context).await;
    }

    if cluster.spec.connection.type_ == ConnectionType::Proxy {
        ensure_proxy_service(&context.host, &proxy_release(cluster, context)).await?;
    }

    if cluster.spec.connection.kubeconfig.is_empty() {
        info!("Cluster '{name}' has no kubeconfig yet, waiting...");
        return Ok(());
    }

    let member = connect_member(cluster, context).await?;
    verify_member_identity(cluster, &member, context).await?;
    sync_federation(cluster, &member, context).await?;

    let readiness = sync_readiness(cluster, &member, context).await;
    let renewal = renew_credentials(cluster, &member, context).await;

    readiness.and(renewal)
}

async fn renew_credentials<S, C>(
    cluster: &mut Cluster,
    member: &impl ObjectStore,
    context: &ReconcilerContext<S, C>,
) -> Result<(), ReconcilerError> {
    let name = cluster.name_any();

    match context
        .credentials
        .renew_if_expiring_soon(cluster, member, Utc::now())
        .await?
    {
        RenewalOutcome::Renewed => info!("Renewed kubeconfig certificate of '{name}' cluster"),
        RenewalOutcome::SwitchedToToken => {
            info!("Kubeconfig of '{name}' cluster now uses a service account token")
        }
        _ => (),
    }

    Ok(())
}

fn proxy_release<S, C>(cluster: &Cluster, context: &ReconcilerContext<S, C>) -> ProxyRelease {
    let connection = &cluster.spec.connection;

    ProxyRelease::new(&cluster.name_any(), &context.config.proxy_namespace).with_ports(
        connection.kubernetes_api_server_port,
        connection.kubesphere_api_server_port,
    )
}

/// Assigns ports, token and endpoints to a proxy-mode cluster.
///
/// Already allocated values are never replaced.
async fn initialize_proxy<S, C>(
    cluster: &mut Cluster,
    context: &ReconcilerContext<S, C>,
) -> Result<(), ReconcilerError>
where
    S: ObjectStore,
{
    info!("Initializing proxy connection of '{}' cluster...", cluster.name_any());

    let connection = &mut cluster.spec.connection;
    let ports = match connection.kubernetes_api_server_port {
        0 => allocate_proxy_ports(&context.host, context.random.as_ref()).await?,
        port => ProxyPorts::from_kubernetes_port(port),
    };
    connection.kubernetes_api_server_port = ports.kubernetes;
    connection.kubesphere_api_server_port = ports.kubesphere;

    if connection.token.as_deref().map_or(true, str::is_empty) {
        connection.token = Some(generate_token(context.random.as_ref()));
    }

    let release = proxy_release(cluster, context);
    cluster.spec.connection.kubernetes_api_endpoint = Some(release.kubernetes_api_endpoint());
    cluster.spec.connection.kubesphere_api_endpoint = Some(release.kubesphere_api_endpoint());

    ensure_proxy_service(&context.host, &release).await?;

    cluster.set_condition(
        ClusterConditionType::Initialized,
        ConditionStatus::True,
        "",
        "Cluster has been initialized",
        Utc::now(),
    );

    Ok(())
}

async fn ensure_proxy_service(
    host: &impl ObjectStore,
    release: &ProxyRelease,
) -> Result<Service, StoreError> {
    create_or_update_resource(host, &release.generate_service(), false, |existing, desired| {
        let desired_spec = desired.spec.clone().unwrap_or_default();
        let spec = existing.spec.get_or_insert_with(Default::default);
        if spec.ports == desired_spec.ports && spec.selector == desired_spec.selector {
            return false;
        }

        spec.ports = desired_spec.ports;
        spec.selector = desired_spec.selector;
        true
    })
    .await
}

async fn connect_member<S, C>(
    cluster: &Cluster,
    context: &ReconcilerContext<S, C>,
) -> Result<C::Store, StoreError>
where
    C: ClusterConnector,
{
    let connection = &cluster.spec.connection;
    let endpoint_override = match connection.type_ {
        ConnectionType::Direct => None,
        ConnectionType::Proxy => connection.kubernetes_api_endpoint.as_deref(),
    };

    context
        .connector
        .connect(&connection.kubeconfig, endpoint_override)
        .await
}

/// Records the member's kube-system UID on first contact and refuses to go
/// on if a later kubeconfig leads somewhere else.
async fn verify_member_identity<S, C>(
    cluster: &mut Cluster,
    member: &impl ObjectStore,
    context: &ReconcilerContext<S, C>,
) -> Result<(), ReconcilerError> {
    let kube_system: Namespace = member.get(None, KUBE_SYSTEM_NAMESPACE).await?;
    let found = kube_system.metadata.uid.unwrap_or_default();

    match cluster.status.as_ref().and_then(|status| status.uid.clone()) {
        Some(expected) if !expected.is_empty() && expected != found => {
            let error = ReconcilerError::ClusterSwapped {
                cluster: cluster.name_any(),
                found,
                expected,
            };
            context
                .events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Warning,
                    reasons::CLUSTER_SWAPPED,
                    &error.to_string(),
                )
                .await;

            Err(error)
        }
        Some(expected) if !expected.is_empty() => Ok(()),
        _ => {
            cluster.status_mut().uid = Some(found);
            Ok(())
        }
    }
}

fn membership<S, C>(
    cluster: &Cluster,
    context: &ReconcilerContext<S, C>,
) -> Result<FederationMembership, ReconcilerError> {
    FederationMembershipBuilder::default()
        .cluster_name(cluster.name_any())
        .host_cluster_name(context.config.host_cluster_name.as_str())
        .namespace(context.config.federation_namespace.as_str())
        .build()
        .map_err(|err| ReconcilerError::InvalidOptions(err.to_string()))
}

fn join_options<S, C>(
    cluster: &Cluster,
    context: &ReconcilerContext<S, C>,
) -> Result<JoinOptions, ReconcilerError> {
    let connection = &cluster.spec.connection;
    let kubeconfig = KubeconfigDocument::from_bytes(&connection.kubeconfig)?;

    let (api_endpoint, ca_bundle, insecure) = match connection.type_ {
        ConnectionType::Proxy => (connection.kubernetes_api_endpoint.clone(), None, true),
        ConnectionType::Direct => (
            kubeconfig.current_server().map(str::to_owned),
            kubeconfig.ca_bundle()?,
            kubeconfig.is_insecure(),
        ),
    };
    let api_endpoint = api_endpoint.ok_or_else(|| {
        ReconcilerError::InvalidOptions(format!(
            "'{}' cluster has no API endpoint",
            cluster.name_any()
        ))
    })?;

    JoinOptionsBuilder::default()
        .membership(membership(cluster, context)?)
        .api_endpoint(api_endpoint)
        .ca_bundle(ca_bundle)
        .insecure(insecure)
        .token_poll(context.credentials.token_poll)
        .build()
        .map_err(|err| ReconcilerError::InvalidOptions(err.to_string()))
}

async fn sync_federation<S, C>(
    cluster: &mut Cluster,
    member: &impl ObjectStore,
    context: &ReconcilerContext<S, C>,
) -> Result<(), ReconcilerError>
where
    S: ObjectStore,
{
    let now = Utc::now();
    let object = cluster.object_ref(&());

    if cluster.spec.join_federation {
        if cluster.is_condition_true(ClusterConditionType::Federated) {
            return Ok(());
        }

        let options = join_options(cluster, context)?;
        match join_cluster_for_namespace(&context.host, member, &options).await {
            Ok(_) => {
                cluster.set_condition(
                    ClusterConditionType::Federated,
                    ConditionStatus::True,
                    "",
                    JOINED_MESSAGE,
                    now,
                );
                context
                    .events
                    .publish(&object, EventType::Normal, reasons::JOIN_FEDERATION, JOINED_MESSAGE)
                    .await;

                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                cluster.set_condition(
                    ClusterConditionType::Federated,
                    ConditionStatus::False,
                    reasons::JOIN_FEDERATION_FAILED,
                    &message,
                    now,
                );
                context
                    .events
                    .publish(
                        &object,
                        EventType::Warning,
                        reasons::JOIN_FEDERATION_FAILED,
                        &message,
                    )
                    .await;

                Err(err.into())
            }
        }
    } else if cluster
        .get_condition(ClusterConditionType::Federated)
        .is_some()
    {
        let options = UnjoinOptions::new(membership(cluster, context)?)
            .force_deletion(cluster.is_force_deletion());

        unjoin(&object, Some(member), &options, context).await?;
        cluster.remove_condition(ClusterConditionType::Federated);

        Ok(())
    } else {
        Ok(())
    }
}

async fn unjoin<S, C, M>(
    object: &ObjectReference,
    member: Option<&M>,
    options: &UnjoinOptions,
    context: &ReconcilerContext<S, C>,
) -> Result<(), ReconcilerError>
where
    S: ObjectStore,
    M: ObjectStore,
{
    match unjoin_cluster(&context.host, member, options).await {
        Ok(()) => {
            context
                .events
                .publish(
                    object,
                    EventType::Normal,
                    reasons::UNJOIN_FEDERATION,
                    "Cluster has left the federation control plane",
                )
                .await;

            Ok(())
        }
        Err(err) => {
            context
                .events
                .publish(
                    object,
                    EventType::Warning,
                    reasons::UNJOIN_FEDERATION_FAILED,
                    &err.to_string(),
                )
                .await;

            Err(err.into())
        }
    }
}

async fn sync_readiness<S, C>(
    cluster: &mut Cluster,
    member: &impl ObjectStore,
    context: &ReconcilerContext<S, C>,
) -> Result<(), ReconcilerError> {
    let now = Utc::now();

    let available = match cluster.spec.connection.type_ {
        ConnectionType::Direct => true,
        ConnectionType::Proxy => {
            let endpoint = cluster
                .spec
                .connection
                .kubesphere_api_endpoint
                .clone()
                .unwrap_or_default();
            let available = context.agent_probe.is_available(&endpoint).await;
            let message = match available {
                true => "Cluster agent is available",
                false => "Cluster agent is unreachable",
            };
            cluster.set_condition(
                ClusterConditionType::AgentAvailable,
                available.into(),
                "",
                message,
                now,
            );

            available
        }
    };

    if !available {
        cluster.set_condition(
            ClusterConditionType::Ready,
            ConditionStatus::False,
            "AgentUnavailable",
            "Cluster agent is unreachable",
            now,
        );
        return Ok(());
    }

    let version = member.server_version().await;
    let nodes = member.list::<Node>(None).await;
    match (version, nodes) {
        (Ok(version), Ok(nodes)) => {
            let status = cluster.status_mut();
            status.kubernetes_version = Some(version);
            status.node_count = Some(i32::try_from(nodes.len()).unwrap_or(i32::MAX));
            cluster.set_condition(
                ClusterConditionType::Ready,
                ConditionStatus::True,
                "",
                READY_MESSAGE,
                now,
            );

            Ok(())
        }
        (Err(err), _) | (_, Err(err)) => {
            cluster.set_condition(
                ClusterConditionType::Ready,
                ConditionStatus::False,
                "ClusterUnreachable",
                &err.to_string(),
                now,
            );

            Err(err.into())
        }
    }
}

/// Unregisters a cluster marked for deletion and releases its finalizer.
async fn cleanup_cluster<S, C>(
    mut cluster: Cluster,
    context: &ReconcilerContext<S, C>,
) -> Result<(), ReconcilerError>
where
    S: ObjectStore,
    C: ClusterConnector,
{
    let name = cluster.name_any();
    let force = cluster.is_force_deletion();
    info!("Cluster '{name}' is being deleted, cleaning up...");

    let federated = cluster.spec.join_federation
        || cluster
            .get_condition(ClusterConditionType::Federated)
            .is_some();

    if federated {
        let member = match cluster.spec.connection.kubeconfig.is_empty() {
            true => None,
            false => match connect_member(&cluster, context).await {
                Ok(member) => Some(member),
                Err(err) if force => {
                    warn!("Couldn't reach '{name}' cluster, forcing deletion anyway! Reason: {err}");
                    None
                }
                Err(err) => return Err(err.into()),
            },
        };

        let options = UnjoinOptions::new(membership(&cluster, context)?)
            .force_deletion(force)
            .skip_member_cluster_resources(member.is_none());

        unjoin(&cluster.object_ref(&()), member.as_ref(), &options, context).await?;
    }

    if cluster.spec.connection.type_ == ConnectionType::Proxy {
        try_remove_resource::<Service>(
            &context.host,
            Some(&context.config.proxy_namespace),
            &proxy_release(&cluster, context).service_name(),
        )
        .await?;
    }

    cluster.remove_finalizer();
    context.host.update(&cluster).await?;

    info!("Cluster '{name}' has been cleaned up");

    Ok(())
}
