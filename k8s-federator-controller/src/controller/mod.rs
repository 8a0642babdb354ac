use std::sync::Arc;

use anyhow::Context;
use k8s_federator_core::{
    allocations::OsRandom,
    credentials::CredentialManager,
    kubernetes::client::{KubeConnector, KubeStore},
};
use kube::Client;
use log::{info, warn};
use tokio::join;

use crate::{
    availability::HttpAgentProbe, config::ControllerConfig, events::KubeEventSink,
    workqueue::WorkQueue,
};

use self::{
    cluster::start_cluster_controller, csr::start_csr_controller,
    reconciler::context::ReconcilerContext,
};

pub mod cluster;
pub mod csr;
pub mod reconciler;
pub mod runner;

pub const CONTROLLER_NAME: &str = "k8s-federator-controller";

pub async fn main_controller(client: Client, config: ControllerConfig) -> anyhow::Result<()> {
    let context = Arc::new(ReconcilerContext {
        host: KubeStore::new(client.clone()),
        connector: KubeConnector::default(),
        credentials: get_credential_manager(&config).await,
        random: Arc::new(OsRandom),
        events: Arc::new(KubeEventSink::new(client.clone(), CONTROLLER_NAME)),
        agent_probe: Arc::new(HttpAgentProbe::new().context("Couldn't create the agent probe!")?),
        config,
    });

    let cluster_queue = WorkQueue::default();
    let csr_queue = WorkQueue::default();

    let cluster_controller =
        start_cluster_controller(client.clone(), context.clone(), cluster_queue.clone());
    let csr_controller = start_csr_controller(client, context, csr_queue.clone());
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Couldn't listen for the shutdown signal! {err}");
            return;
        }

        info!("Shutting down, draining work queues...");
        cluster_queue.shutdown();
        csr_queue.shutdown();
    };

    join!(cluster_controller, csr_controller, shutdown);

    Ok(())
}

async fn get_credential_manager(config: &ControllerConfig) -> CredentialManager {
    let host_ca_bundle = match config.host_api_server {
        Some(_) => tokio::fs::read(&config.host_ca_file)
            .await
            .unwrap_or_else(|err| {
                warn!(
                    "Couldn't read host CA bundle from {}, user kubeconfigs won't carry it! {err}",
                    config.host_ca_file.display()
                );
                Vec::new()
            }),
        None => Vec::new(),
    };

    CredentialManager {
        kubeconfig_namespace: config.kubeconfig_namespace.to_owned(),
        host_api_server: config.host_api_server.to_owned(),
        host_ca_bundle,
        ..Default::default()
    }
}
