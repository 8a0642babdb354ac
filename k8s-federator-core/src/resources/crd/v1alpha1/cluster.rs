use std::fmt::Display;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::resources::{annotations::FORCE_DELETION_ANNOTATION, labels::HOST_CLUSTER_LABEL};

/// Blocks removal of a `Cluster` until it has been unregistered.
pub const CLUSTER_FINALIZER: &str = "finalizer.cluster.kubesphere.io";

/// A member cluster registered with the control plane.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "cluster.kubesphere.io",
    version = "v1alpha1",
    kind = "Cluster",
    status = "ClusterStatus",
    derive = "Default",
    derive = "PartialEq"
)]
pub struct ClusterSpec {
    /// whether the cluster should be registered with the federation
    #[serde(default)]
    pub join_federation: bool,
    #[serde(default)]
    pub enable: bool,
    pub provider: Option<String>,
    #[serde(default)]
    pub connection: Connection,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(rename = "type", default)]
    pub type_: ConnectionType,
    #[serde(rename = "kubesphereAPIEndpoint")]
    pub kubesphere_api_endpoint: Option<String>,
    #[serde(rename = "kubernetesAPIEndpoint")]
    pub kubernetes_api_endpoint: Option<String>,
    /// kubeconfig document used to reach the member cluster
    #[serde(
        default,
        with = "crate::helpers::base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    #[schemars(with = "String")]
    pub kubeconfig: Vec<u8>,
    /// bearer token the proxy agent authenticates with
    pub token: Option<String>,
    /// only meaningful in proxy mode, stable once allocated
    #[serde(rename = "kubernetesAPIServerPort", default)]
    pub kubernetes_api_server_port: u16,
    #[serde(rename = "kubesphereAPIServerPort", default)]
    pub kubesphere_api_server_port: u16,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Direct,
    Proxy,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
    pub kubernetes_version: Option<String>,
    pub node_count: Option<i32>,
    /// UID of the member's kube-system namespace
    pub uid: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_update_time: Option<DateTime<Utc>>,
    pub last_transition_time: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        match value {
            true => ConditionStatus::True,
            false => ConditionStatus::False,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterConditionType {
    Initialized,
    Federated,
    Ready,
    AgentAvailable,
    KubeConfigCertExpiresInSevenDays,
}

impl ClusterConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterConditionType::Initialized => "Initialized",
            ClusterConditionType::Federated => "Federated",
            ClusterConditionType::Ready => "Ready",
            ClusterConditionType::AgentAvailable => "AgentAvailable",
            ClusterConditionType::KubeConfigCertExpiresInSevenDays => {
                "KubeConfigCertExpiresInSevenDays"
            }
        }
    }
}

impl Display for ClusterConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a `Cluster` stands with respect to its finalizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterLifecycle {
    /// alive, finalizer not yet registered
    Unregistered,
    Active,
    /// deletion requested, cleanup not confirmed yet
    PendingCleanup,
    /// deletion requested and nothing left for this controller to do
    Released,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterPhase {
    New,
    Initializing,
    AwaitingKubeconfig,
    Joining,
    Joined,
    Ready,
    Deleting,
}

impl Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::New => f.write_str("cluster was just created"),
            ClusterPhase::Initializing => f.write_str("waiting for proxy ports and token"),
            ClusterPhase::AwaitingKubeconfig => f.write_str("waiting for a kubeconfig"),
            ClusterPhase::Joining => f.write_str("joining the federation"),
            ClusterPhase::Joined => f.write_str("connected"),
            ClusterPhase::Ready => f.write_str("cluster is ready"),
            ClusterPhase::Deleting => f.write_str("cluster is being removed"),
        }
    }
}

impl Connection {
    pub fn needs_proxy_initialization(&self) -> bool {
        self.type_ == ConnectionType::Proxy
            && (self.kubernetes_api_server_port == 0
                || self.kubesphere_api_server_port == 0
                || self.token.as_deref().map_or(true, str::is_empty))
    }
}

impl Cluster {
    pub fn status_mut(&mut self) -> &mut ClusterStatus {
        self.status.get_or_insert_with(Default::default)
    }

    pub fn get_condition(&self, type_: ClusterConditionType) -> Option<&ClusterCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|condition| condition.type_ == type_.as_str())
    }

    pub fn is_condition_true(&self, type_: ClusterConditionType) -> bool {
        self.get_condition(type_)
            .map_or(false, |condition| condition.status == ConditionStatus::True)
    }

    /// Inserts or replaces the condition of the given type.
    ///
    /// Writing an identical condition is a no-op, and a condition that keeps
    /// its status keeps its `lastTransitionTime`.
    pub fn set_condition(
        &mut self,
        type_: ClusterConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let conditions = &mut self.status_mut().conditions;
        let reason = Some(reason.to_owned()).filter(|reason| !reason.is_empty());
        let message = Some(message.to_owned()).filter(|message| !message.is_empty());

        match conditions
            .iter_mut()
            .find(|condition| condition.type_ == type_.as_str())
        {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return;
                }
                if existing.status != status {
                    existing.last_transition_time = Some(now);
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
                existing.last_update_time = Some(now);
            }
            None => conditions.push(ClusterCondition {
                type_: type_.as_str().to_owned(),
                status,
                last_update_time: Some(now),
                last_transition_time: Some(now),
                reason,
                message,
            }),
        }
    }

    pub fn remove_condition(&mut self, type_: ClusterConditionType) {
        if let Some(status) = self.status.as_mut() {
            status
                .conditions
                .retain(|condition| condition.type_ != type_.as_str());
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map_or(false, |finalizers| {
                finalizers.iter().any(|finalizer| finalizer == CLUSTER_FINALIZER)
            })
    }

    pub fn lifecycle(&self) -> ClusterLifecycle {
        match (self.is_deleting(), self.has_finalizer()) {
            (false, false) => ClusterLifecycle::Unregistered,
            (false, true) => ClusterLifecycle::Active,
            (true, true) => ClusterLifecycle::PendingCleanup,
            (true, false) => ClusterLifecycle::Released,
        }
    }

    /// Appends the finalizer, returns `false` if it was already there.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }

        self.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(CLUSTER_FINALIZER.to_owned());

        true
    }

    /// Drops the finalizer keeping the order of everything else.
    pub fn remove_finalizer(&mut self) -> bool {
        if !self.has_finalizer() {
            return false;
        }

        if let Some(finalizers) = self.metadata.finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != CLUSTER_FINALIZER);
        }

        true
    }

    pub fn is_host_cluster(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .map_or(false, |labels| labels.contains_key(HOST_CLUSTER_LABEL))
    }

    pub fn is_force_deletion(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(FORCE_DELETION_ANNOTATION))
            .map_or(false, |value| value == "true")
    }

    pub fn phase(&self) -> ClusterPhase {
        match self.lifecycle() {
            ClusterLifecycle::PendingCleanup | ClusterLifecycle::Released => {
                return ClusterPhase::Deleting
            }
            ClusterLifecycle::Unregistered => return ClusterPhase::New,
            ClusterLifecycle::Active => (),
        }

        let connection = &self.spec.connection;
        if connection.needs_proxy_initialization() {
            ClusterPhase::Initializing
        } else if connection.kubeconfig.is_empty() {
            ClusterPhase::AwaitingKubeconfig
        } else if self.is_condition_true(ClusterConditionType::Ready) {
            ClusterPhase::Ready
        } else if self.spec.join_federation
            && !self.is_condition_true(ClusterConditionType::Federated)
        {
            ClusterPhase::Joining
        } else {
            ClusterPhase::Joined
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::CustomResourceExt;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn set_condition_keeps_one_condition_per_type() {
        let mut cluster = Cluster::new("member", ClusterSpec::default());

        cluster.set_condition(
            ClusterConditionType::Ready,
            ConditionStatus::False,
            "",
            "",
            at(0),
        );
        cluster.set_condition(
            ClusterConditionType::Ready,
            ConditionStatus::True,
            "Ready",
            "",
            at(10),
        );
        cluster.set_condition(
            ClusterConditionType::Federated,
            ConditionStatus::True,
            "",
            "",
            at(10),
        );

        let conditions = &cluster.status.as_ref().unwrap().conditions;
        assert_eq!(conditions.len(), 2);
        let ready = cluster.get_condition(ClusterConditionType::Ready).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.last_transition_time, Some(at(10)));
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut cluster = Cluster::new("member", ClusterSpec::default());

        cluster.set_condition(
            ClusterConditionType::AgentAvailable,
            ConditionStatus::True,
            "",
            "up",
            at(0),
        );
        cluster.set_condition(
            ClusterConditionType::AgentAvailable,
            ConditionStatus::True,
            "",
            "still up",
            at(60),
        );

        let condition = cluster
            .get_condition(ClusterConditionType::AgentAvailable)
            .unwrap();
        assert_eq!(condition.last_transition_time, Some(at(0)));
        assert_eq!(condition.last_update_time, Some(at(60)));
        assert_eq!(condition.message.as_deref(), Some("still up"));
    }

    #[test]
    fn identical_condition_is_a_noop() {
        let mut cluster = Cluster::new("member", ClusterSpec::default());
        cluster.set_condition(
            ClusterConditionType::Federated,
            ConditionStatus::True,
            "",
            "",
            at(0),
        );
        let before = cluster.clone();

        cluster.set_condition(
            ClusterConditionType::Federated,
            ConditionStatus::True,
            "",
            "",
            at(30),
        );

        assert_eq!(cluster, before);
    }

    #[test]
    fn lifecycle_follows_deletion_and_finalizer() {
        let mut cluster = Cluster::new("member", ClusterSpec::default());
        assert_eq!(cluster.lifecycle(), ClusterLifecycle::Unregistered);

        assert!(cluster.add_finalizer());
        assert!(!cluster.add_finalizer());
        assert_eq!(cluster.lifecycle(), ClusterLifecycle::Active);

        cluster.metadata.deletion_timestamp = Some(Time(at(0)));
        assert_eq!(cluster.lifecycle(), ClusterLifecycle::PendingCleanup);
        assert_eq!(cluster.phase(), ClusterPhase::Deleting);

        assert!(cluster.remove_finalizer());
        assert_eq!(cluster.lifecycle(), ClusterLifecycle::Released);
    }

    #[test]
    fn finalizer_removal_preserves_foreign_finalizers() {
        let mut cluster = Cluster::new("member", ClusterSpec::default());
        cluster.metadata.finalizers = Some(vec![
            "first".to_owned(),
            CLUSTER_FINALIZER.to_owned(),
            "last".to_owned(),
        ]);

        cluster.remove_finalizer();

        assert_eq!(
            cluster.metadata.finalizers,
            Some(vec!["first".to_owned(), "last".to_owned()])
        );
    }

    #[test]
    fn phase_reflects_connection_state() {
        let mut cluster = Cluster::new(
            "member",
            ClusterSpec {
                join_federation: true,
                connection: Connection {
                    type_: ConnectionType::Proxy,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        cluster.add_finalizer();
        assert_eq!(cluster.phase(), ClusterPhase::Initializing);

        cluster.spec.connection.kubernetes_api_server_port = 6001;
        cluster.spec.connection.kubesphere_api_server_port = 16001;
        cluster.spec.connection.token = Some("token".to_owned());
        assert_eq!(cluster.phase(), ClusterPhase::AwaitingKubeconfig);

        cluster.spec.connection.kubeconfig = b"apiVersion: v1".to_vec();
        assert_eq!(cluster.phase(), ClusterPhase::Joining);

        cluster.set_condition(
            ClusterConditionType::Federated,
            ConditionStatus::True,
            "",
            "",
            at(0) + Duration::seconds(1),
        );
        assert_eq!(cluster.phase(), ClusterPhase::Joined);
    }

    #[test]
    fn connection_uses_wire_field_names() {
        let connection = Connection {
            type_: ConnectionType::Proxy,
            kubeconfig: b"kubeconfig".to_vec(),
            kubernetes_api_server_port: 6000,
            kubesphere_api_server_port: 16000,
            ..Default::default()
        };

        let value = serde_json::to_value(&connection).unwrap();

        assert_eq!(value["type"], "proxy");
        assert_eq!(value["kubeconfig"], "a3ViZWNvbmZpZw==");
        assert_eq!(value["kubernetesAPIServerPort"], 6000);
        assert_eq!(value["kubesphereAPIServerPort"], 16000);

        let parsed: Connection = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, connection);
    }

    #[test]
    fn crd_is_cluster_scoped() {
        let crd = Cluster::crd();

        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.group, "cluster.kubesphere.io");
    }
}
