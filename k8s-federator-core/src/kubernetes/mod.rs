use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::{
    certificates::v1::CertificateSigningRequest,
    core::v1::{ConfigMap, Namespace, Node, Secret, Service, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
};
use kube::{Api, Client, Resource};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::resources::crd::{v1alpha1::cluster::Cluster, v1beta1::kubefedcluster::KubeFedCluster};

pub mod client;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod operations;
pub mod poll;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{} '{}' doesn't exist!", .kind, .name)]
    NotFound { kind: String, name: String },
    #[error("{} '{}' already exists!", .kind, .name)]
    AlreadyExists { kind: String, name: String },
    #[error("{} '{}' was modified in the meantime!", .kind, .name)]
    Conflict { kind: String, name: String },
    #[error("Kubernetes API request failed! Reason: {}", .0)]
    Api(kube::Error),
    #[error("Couldn't (de)serialize the resource! Reason: {}", .0)]
    Serialization(serde_json::Error),
    #[error("Couldn't create a cluster client! Reason: {}", .0)]
    InvalidConfig(String),
}

impl StoreError {
    pub fn not_found<K: Resource<DynamicType = ()>>(name: &str) -> Self {
        Self::NotFound {
            kind: K::kind(&()).into_owned(),
            name: name.to_owned(),
        }
    }

    pub fn already_exists<K: Resource<DynamicType = ()>>(name: &str) -> Self {
        Self::AlreadyExists {
            kind: K::kind(&()).into_owned(),
            name: name.to_owned(),
        }
    }

    pub fn conflict<K: Resource<DynamicType = ()>>(name: &str) -> Self {
        Self::Conflict {
            kind: K::kind(&()).into_owned(),
            name: name.to_owned(),
        }
    }

    pub fn from_kube<K: Resource<DynamicType = ()>>(error: kube::Error, name: &str) -> Self {
        match error {
            kube::Error::Api(ref response) => match response.code {
                404 => Self::not_found::<K>(name),
                409 if response.reason == "AlreadyExists" => Self::already_exists::<K>(name),
                409 => Self::conflict::<K>(name),
                _ => Self::Api(error),
            },
            _ => Self::Api(error),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A Kubernetes type that can go through an [`ObjectStore`].
pub trait StoreResource:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const NAMESPACED: bool;

    fn scoped_api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_store_resource {
    ($($resource:ty),* $(,)?) => {
        $(
            impl StoreResource for $resource {
                const NAMESPACED: bool = true;

                fn scoped_api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(namespace) => Api::namespaced(client, namespace),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_store_resource {
    ($($resource:ty),* $(,)?) => {
        $(
            impl StoreResource for $resource {
                const NAMESPACED: bool = false;

                fn scoped_api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced_store_resource!(
    ConfigMap,
    Secret,
    Service,
    ServiceAccount,
    Role,
    RoleBinding,
    KubeFedCluster,
);

cluster_store_resource!(
    Namespace,
    Node,
    ClusterRole,
    ClusterRoleBinding,
    CertificateSigningRequest,
    Cluster,
);

/// Typed CRUD against a single API server.
///
/// Every write is compare-and-set on `metadata.resourceVersion` when the
/// passed object carries one; a stale version surfaces as
/// [`StoreError::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<K: StoreResource>(&self, namespace: Option<&str>, name: &str)
        -> Result<K, StoreError>;

    async fn list<K: StoreResource>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError>;

    async fn create<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError>;

    /// Replaces spec and metadata, leaves the status untouched.
    async fn update<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError>;

    /// Replaces the status subresource only.
    async fn update_status<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError>;

    /// Writes the conditions of `csr` through the approval subresource.
    async fn approve_certificate_signing_request(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, StoreError>;

    async fn delete<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError>;

    async fn server_version(&self) -> Result<String, StoreError>;
}

#[async_trait]
impl<T: ObjectStore> ObjectStore for Arc<T> {
    async fn get<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<K, StoreError> {
        (**self).get(namespace, name).await
    }

    async fn list<K: StoreResource>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        (**self).list(namespace).await
    }

    async fn create<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError> {
        (**self).create(resource).await
    }

    async fn update<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError> {
        (**self).update(resource).await
    }

    async fn update_status<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError> {
        (**self).update_status(resource).await
    }

    async fn approve_certificate_signing_request(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, StoreError> {
        (**self).approve_certificate_signing_request(csr).await
    }

    async fn delete<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        (**self).delete::<K>(namespace, name).await
    }

    async fn server_version(&self) -> Result<String, StoreError> {
        (**self).server_version().await
    }
}

/// Builds member cluster stores out of kubeconfig documents.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    type Store: ObjectStore;

    /// `endpoint_override` replaces the kubeconfig server (proxy mode) and
    /// disables TLS verification for it.
    async fn connect(
        &self,
        kubeconfig: &[u8],
        endpoint_override: Option<&str>,
    ) -> Result<Self::Store, StoreError>;
}
