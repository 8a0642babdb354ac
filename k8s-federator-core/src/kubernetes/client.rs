use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config,
};
use serde_json::json;

use super::{ClusterConnector, ObjectStore, StoreError, StoreResource};

const APPROVAL_SUBRESOURCE: &str = "approval";

/// [`ObjectStore`] backed by a live API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: StoreResource>(&self, namespace: Option<&str>) -> Api<K> {
        K::scoped_api(self.client.clone(), namespace)
    }
}

fn require_name<K: StoreResource>(resource: &K) -> Result<String, StoreError> {
    resource
        .meta()
        .name
        .clone()
        .ok_or_else(|| StoreError::InvalidConfig(format!("{} is missing a name!", K::kind(&()))))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<K, StoreError> {
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(|err| StoreError::from_kube::<K>(err, name))
    }

    async fn list<K: StoreResource>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        self.api::<K>(namespace)
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|err| StoreError::from_kube::<K>(err, "*"))
    }

    async fn create<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError> {
        let name = resource
            .meta()
            .name
            .clone()
            .or_else(|| resource.meta().generate_name.clone())
            .unwrap_or_default();

        self.api::<K>(resource.meta().namespace.as_deref())
            .create(&PostParams::default(), resource)
            .await
            .map_err(|err| StoreError::from_kube::<K>(err, &name))
    }

    async fn update<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError> {
        let name = require_name(resource)?;

        self.api::<K>(resource.meta().namespace.as_deref())
            .replace(&name, &PostParams::default(), resource)
            .await
            .map_err(|err| StoreError::from_kube::<K>(err, &name))
    }

    async fn update_status<K: StoreResource>(&self, resource: &K) -> Result<K, StoreError> {
        let name = require_name(resource)?;
        let status = serde_json::to_value(resource)
            .map_err(StoreError::Serialization)?
            .get("status")
            .cloned()
            .unwrap_or_default();
        // the resource version turns the merge patch into a compare-and-set
        let patch = json!({
            "metadata": { "resourceVersion": resource.meta().resource_version },
            "status": status,
        });

        self.api::<K>(resource.meta().namespace.as_deref())
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| StoreError::from_kube::<K>(err, &name))
    }

    async fn approve_certificate_signing_request(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, StoreError> {
        let name = require_name(csr)?;
        let data = serde_json::to_vec(csr).map_err(StoreError::Serialization)?;

        self.api::<CertificateSigningRequest>(None)
            .replace_subresource(APPROVAL_SUBRESOURCE, &name, &PostParams::default(), data)
            .await
            .map_err(|err| StoreError::from_kube::<CertificateSigningRequest>(err, &name))
    }

    async fn delete<K: StoreResource>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|err| StoreError::from_kube::<K>(err, name))
    }

    async fn server_version(&self) -> Result<String, StoreError> {
        self.client
            .apiserver_version()
            .await
            .map(|info| info.git_version)
            .map_err(StoreError::Api)
    }
}

/// Connects to member clusters with the kube client stack.
#[derive(Clone, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    type Store = KubeStore;

    async fn connect(
        &self,
        kubeconfig: &[u8],
        endpoint_override: Option<&str>,
    ) -> Result<KubeStore, StoreError> {
        let raw = std::str::from_utf8(kubeconfig)
            .map_err(|err| StoreError::InvalidConfig(err.to_string()))?;
        let kubeconfig =
            Kubeconfig::from_yaml(raw).map_err(|err| StoreError::InvalidConfig(err.to_string()))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|err| StoreError::InvalidConfig(err.to_string()))?;

        if let Some(endpoint) = endpoint_override {
            config.cluster_url = endpoint.parse().map_err(|_| {
                StoreError::InvalidConfig(format!("'{endpoint}' isn't a valid URL!"))
            })?;
            config.accept_invalid_certs = true;
        }

        let client = Client::try_from(config).map_err(StoreError::Api)?;

        Ok(KubeStore::new(client))
    }
}
