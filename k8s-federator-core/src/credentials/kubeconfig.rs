use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::CredentialsError;

const CLUSTER_NAME: &str = "local";
const DEFAULT_NAMESPACE: &str = "default";

type Extra = BTreeMap<String, serde_yaml::Value>;

/// A kubeconfig file, keeping every field it doesn't know about.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct KubeconfigDocument {
    #[serde(rename = "apiVersion")]
    pub api_version: Option<String>,
    pub kind: Option<String>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    pub current_context: Option<String>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server: Option<String>,
    pub certificate_authority_data: Option<String>,
    pub insecure_skip_tls_verify: Option<bool>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ContextEntry {
    pub cluster: String,
    pub user: String,
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: UserEntry,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    pub client_certificate_data: Option<String>,
    pub client_key_data: Option<String>,
    pub token: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

fn encode(data: &[u8]) -> Option<String> {
    (!data.is_empty()).then(|| data_encoding::BASE64.encode(data))
}

fn decode(data: &Option<String>) -> Result<Option<Vec<u8>>, CredentialsError> {
    data.as_deref()
        .filter(|data| !data.is_empty())
        .map(|data| {
            data_encoding::BASE64
                .decode(data.trim().as_bytes())
                .map_err(|err| CredentialsError::InvalidKubeconfig(err.to_string()))
        })
        .transpose()
}

/// Builds a kubeconfig with a single cluster, context and user.
///
/// Empty credentials are left out so the document can be completed later.
pub fn assemble_kubeconfig(
    username: &str,
    endpoint: &str,
    ca_bundle: &[u8],
    certificate: &[u8],
    private_key: &[u8],
) -> Result<Vec<u8>, CredentialsError> {
    let context_name = format!("{username}@{CLUSTER_NAME}");
    let document = KubeconfigDocument {
        api_version: Some("v1".to_owned()),
        kind: Some("Config".to_owned()),
        clusters: vec![NamedCluster {
            name: CLUSTER_NAME.to_owned(),
            cluster: ClusterEntry {
                server: Some(endpoint.to_owned()),
                certificate_authority_data: encode(ca_bundle),
                ..Default::default()
            },
        }],
        contexts: vec![NamedContext {
            name: context_name.to_owned(),
            context: ContextEntry {
                cluster: CLUSTER_NAME.to_owned(),
                user: username.to_owned(),
                namespace: Some(DEFAULT_NAMESPACE.to_owned()),
                ..Default::default()
            },
        }],
        current_context: Some(context_name),
        users: vec![NamedUser {
            name: username.to_owned(),
            user: UserEntry {
                client_certificate_data: encode(certificate),
                client_key_data: encode(private_key),
                ..Default::default()
            },
        }],
        ..Default::default()
    };

    document.to_bytes()
}

impl KubeconfigDocument {
    pub fn from_bytes(data: &[u8]) -> Result<Self, CredentialsError> {
        serde_yaml::from_slice(data)
            .map_err(|err| CredentialsError::InvalidKubeconfig(err.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CredentialsError> {
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .map_err(|err| CredentialsError::InvalidKubeconfig(err.to_string()))
    }

    pub fn current_context(&self) -> Option<&ContextEntry> {
        let name = self.current_context.as_deref()?;

        self.contexts
            .iter()
            .find(|context| context.name == name)
            .map(|context| &context.context)
    }

    pub fn current_cluster(&self) -> Option<&ClusterEntry> {
        let context = self.current_context()?;

        self.clusters
            .iter()
            .find(|cluster| cluster.name == context.cluster)
            .map(|cluster| &cluster.cluster)
    }

    pub fn current_server(&self) -> Option<&str> {
        self.current_cluster()?.server.as_deref()
    }

    pub fn current_user(&self) -> Option<&UserEntry> {
        let context = self.current_context()?;

        self.users
            .iter()
            .find(|user| user.name == context.user)
            .map(|user| &user.user)
    }

    fn current_user_mut(&mut self) -> Result<&mut UserEntry, CredentialsError> {
        let user_name = self
            .current_context()
            .map(|context| context.user.to_owned())
            .ok_or_else(|| {
                CredentialsError::InvalidKubeconfig("current context is missing".to_owned())
            })?;

        self.users
            .iter_mut()
            .find(|user| user.name == user_name)
            .map(|user| &mut user.user)
            .ok_or_else(|| {
                CredentialsError::InvalidKubeconfig(format!("user '{user_name}' is missing"))
            })
    }

    pub fn ca_bundle(&self) -> Result<Option<Vec<u8>>, CredentialsError> {
        match self.current_cluster() {
            Some(cluster) => decode(&cluster.certificate_authority_data),
            None => Ok(None),
        }
    }

    pub fn is_insecure(&self) -> bool {
        self.current_cluster()
            .and_then(|cluster| cluster.insecure_skip_tls_verify)
            .unwrap_or(false)
    }

    pub fn client_certificate(&self) -> Result<Option<Vec<u8>>, CredentialsError> {
        match self.current_user() {
            Some(user) => decode(&user.client_certificate_data),
            None => Ok(None),
        }
    }

    pub fn client_key(&self) -> Result<Option<Vec<u8>>, CredentialsError> {
        match self.current_user() {
            Some(user) => decode(&user.client_key_data),
            None => Ok(None),
        }
    }

    /// Swaps the current user's key pair, leaves everything else as it was.
    pub fn set_client_credentials(
        &mut self,
        certificate: &[u8],
        private_key: &[u8],
    ) -> Result<(), CredentialsError> {
        let user = self.current_user_mut()?;
        user.client_certificate_data = encode(certificate);
        user.client_key_data = encode(private_key);

        Ok(())
    }

    /// Makes the current user authenticate with a bearer token instead.
    pub fn set_token(&mut self, token: &str) -> Result<(), CredentialsError> {
        let user = self.current_user_mut()?;
        user.token = Some(token.to_owned());
        user.client_certificate_data = None;
        user.client_key_data = None;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXISTING: &str = r#"
apiVersion: v1
kind: Config
preferences: {}
clusters:
- name: member
  cluster:
    server: https://member.example.com:6443
    certificate-authority-data: Y2E=
    tls-server-name: member.internal
contexts:
- name: admin@member
  context:
    cluster: member
    user: admin
current-context: admin@member
users:
- name: admin
  user:
    client-certificate-data: Y2VydA==
    client-key-data: a2V5
"#;

    #[test]
    fn assembled_kubeconfig_round_trips() {
        let raw = assemble_kubeconfig(
            "alice",
            "https://host.example.com:6443",
            b"ca",
            b"cert",
            b"key",
        )
        .unwrap();

        let document = KubeconfigDocument::from_bytes(&raw).unwrap();

        assert_eq!(document.current_context.as_deref(), Some("alice@local"));
        assert_eq!(document.clusters.len(), 1);
        assert_eq!(document.contexts.len(), 1);
        assert_eq!(document.users.len(), 1);
        assert_eq!(
            document.current_server(),
            Some("https://host.example.com:6443")
        );
        assert_eq!(
            document.current_context().unwrap().namespace.as_deref(),
            Some("default")
        );
        assert_eq!(document.ca_bundle().unwrap(), Some(b"ca".to_vec()));
        assert_eq!(document.client_certificate().unwrap(), Some(b"cert".to_vec()));
        assert_eq!(document.client_key().unwrap(), Some(b"key".to_vec()));
    }

    #[test]
    fn replacing_credentials_keeps_other_fields() {
        let mut document = KubeconfigDocument::from_bytes(EXISTING.as_bytes()).unwrap();

        document
            .set_client_credentials(b"new-cert", b"new-key")
            .unwrap();
        let reparsed = KubeconfigDocument::from_bytes(&document.to_bytes().unwrap()).unwrap();

        assert_eq!(reparsed.client_certificate().unwrap(), Some(b"new-cert".to_vec()));
        assert_eq!(reparsed.client_key().unwrap(), Some(b"new-key".to_vec()));
        assert_eq!(reparsed.current_server(), Some("https://member.example.com:6443"));
        assert!(reparsed.extra.contains_key("preferences"));
        assert!(reparsed.clusters[0].cluster.extra.contains_key("tls-server-name"));
    }

    #[test]
    fn switching_to_token_drops_key_pair() {
        let mut document = KubeconfigDocument::from_bytes(EXISTING.as_bytes()).unwrap();

        document.set_token("secret-token").unwrap();

        let user = document.current_user().unwrap();
        assert_eq!(user.token.as_deref(), Some("secret-token"));
        assert_eq!(user.client_certificate_data, None);
        assert_eq!(document.client_key().unwrap(), None);
    }

    #[test]
    fn missing_context_is_rejected() {
        let mut document = KubeconfigDocument::from_bytes(EXISTING.as_bytes()).unwrap();
        document.current_context = Some("nope".to_owned());

        assert!(matches!(
            document.set_token("token"),
            Err(CredentialsError::InvalidKubeconfig(_))
        ));
    }
}
