use std::sync::Arc;

use k8s_federator_core::{
    kubernetes::{ClusterConnector, ObjectStore},
    resources::crd::v1alpha1::cluster::Cluster,
};
use kube::{Api, Client};
use log::info;

use crate::workqueue::WorkQueue;

use super::{
    reconciler::{cluster::ClusterReconciler, context::ReconcilerContext},
    runner::{feed_queue, Runner},
};

pub async fn start_cluster_controller<S, C>(
    client: Client,
    context: Arc<ReconcilerContext<S, C>>,
    queue: WorkQueue<String>,
) where
    S: ObjectStore + 'static,
    C: ClusterConnector + 'static,
{
    info!("Creating cluster controller...");

    let runner = Runner::new(
        ClusterReconciler::new(context.clone()),
        queue.clone(),
        context.config.workers,
        context.config.max_retries,
    );
    let feed = feed_queue(Api::<Cluster>::all(client), queue);

    info!("Cluster controller created!");

    tokio::select! {
        _ = feed => (),
        _ = runner.run() => (),
    }
}
