use std::sync::Arc;

use k8s_federator_core::kubernetes::{ClusterConnector, ObjectStore};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::{Api, Client};
use log::info;

use crate::workqueue::WorkQueue;

use super::{
    reconciler::{context::ReconcilerContext, csr::CsrReconciler},
    runner::{feed_queue, Runner},
};

pub async fn start_csr_controller<S, C>(
    client: Client,
    context: Arc<ReconcilerContext<S, C>>,
    queue: WorkQueue<String>,
) where
    S: ObjectStore + 'static,
    C: ClusterConnector + 'static,
{
    info!("Creating CSR controller...");

    let runner = Runner::new(
        CsrReconciler::new(context.clone()),
        queue.clone(),
        context.config.workers,
        context.config.max_retries,
    );
    let feed = feed_queue(Api::<CertificateSigningRequest>::all(client), queue);

    info!("CSR controller created!");

    tokio::select! {
        _ = feed => (),
        _ = runner.run() => (),
    }
}
