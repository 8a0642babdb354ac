use k8s_federator_core::{
    allocations::AllocationsError, credentials::CredentialsError, federation::FederationError,
    kubernetes::StoreError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Kubernetes API request failed! Reason: {}", .0)]
    Store(#[from] StoreError),
    #[error("Couldn't allocate proxy ports! Reason: {}", .0)]
    Allocation(#[from] AllocationsError),
    #[error("Couldn't manage cluster credentials! Reason: {}", .0)]
    Credentials(#[from] CredentialsError),
    #[error("Couldn't update federation membership! Reason: {}", .0)]
    Federation(#[from] FederationError),
    #[error("Couldn't prepare federation options! Reason: {}", .0)]
    InvalidOptions(String),
    #[error("Kubeconfig of '{}' cluster points at a different cluster (kube-system '{}', expected '{}')!", .cluster, .found, .expected)]
    ClusterSwapped {
        cluster: String,
        found: String,
        expected: String,
    },
}
