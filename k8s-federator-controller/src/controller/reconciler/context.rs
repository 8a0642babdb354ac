use std::sync::Arc;

use k8s_federator_core::{allocations::RandomSource, credentials::CredentialManager};

use crate::{availability::AgentProbe, config::ControllerConfig, events::EventSink};

/// Everything the reconcilers share. `S` is the host cluster store and `C`
/// builds member cluster stores.
pub struct ReconcilerContext<S, C> {
    pub host: S,
    pub connector: C,
    pub config: ControllerConfig,
    pub credentials: CredentialManager,
    pub random: Arc<dyn RandomSource>,
    pub events: Arc<dyn EventSink>,
    pub agent_probe: Arc<dyn AgentProbe>,
}
