use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};
use log::warn;

pub mod reasons {
    pub const JOIN_FEDERATION: &str = "JoinFederation";
    pub const JOIN_FEDERATION_FAILED: &str = "JoinFederationFailed";
    pub const UNJOIN_FEDERATION: &str = "UnjoinFederation";
    pub const UNJOIN_FEDERATION_FAILED: &str = "UnjoinFederationFailed";
    pub const CLUSTER_SWAPPED: &str = "ClusterSwapped";
}

/// Operator-visible audit trail of what the controller did to an object.
///
/// Publishing never fails the reconcile, sinks log their own errors.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    );
}

/// Writes `events.k8s.io` Events to the host cluster.
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_owned(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        let event = Event {
            type_,
            reason: reason.to_owned(),
            note: Some(message.to_owned()),
            action: "Reconcile".to_owned(),
            secondary: None,
        };

        if let Err(err) = recorder.publish(event).await {
            warn!(
                "Couldn't publish '{reason}' event for '{}'! Reason: {err}",
                object.name.as_deref().unwrap_or_default()
            );
        }
    }
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub object: String,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps published events in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: std::sync::Mutex<Vec<RecordedEvent>>,
}

#[cfg(test)]
impl RecordingEventSink {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|event| event.reason)
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(RecordedEvent {
                object: object.name.clone().unwrap_or_default(),
                type_,
                reason: reason.to_owned(),
                message: message.to_owned(),
            });
    }
}
