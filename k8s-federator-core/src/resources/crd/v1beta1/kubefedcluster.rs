use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Disables every TLS check the federation layer performs against a member.
pub const DISABLE_ALL_TLS_VALIDATIONS: &str = "*";

/// Registration of a member cluster with the federation control plane.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "core.kubefed.io",
    version = "v1beta1",
    kind = "KubeFedCluster",
    namespaced,
    derive = "Default",
    derive = "PartialEq"
)]
pub struct KubeFedClusterSpec {
    /// member API server URL
    #[serde(rename = "apiEndpoint")]
    pub api_endpoint: String,
    /// base64 encoded CA bundle of the member API server
    pub ca_bundle: Option<String>,
    /// host-side secret holding the member bearer token
    pub secret_ref: LocalSecretReference,
    pub disabled_tls_validations: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct LocalSecretReference {
    pub name: String,
}
