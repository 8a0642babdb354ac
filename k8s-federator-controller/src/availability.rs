use std::time::Duration;

use async_trait::async_trait;
use log::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tells whether the agent tunnel of a proxy-mode cluster is up.
#[async_trait]
pub trait AgentProbe: Send + Sync {
    async fn is_available(&self, endpoint: &str) -> bool;
}

/// Considers the agent available when its endpoint answers HTTP at all.
pub struct HttpAgentProbe {
    client: reqwest::Client,
}

impl HttpAgentProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .danger_accept_invalid_certs(true)
                .build()?,
        })
    }
}

#[async_trait]
impl AgentProbe for HttpAgentProbe {
    async fn is_available(&self, endpoint: &str) -> bool {
        match self.client.get(endpoint).send().await {
            Ok(response) => {
                debug!("Agent at {endpoint} answered with {}", response.status());
                true
            }
            Err(err) => {
                debug!("Agent at {endpoint} is unreachable: {err}");
                false
            }
        }
    }
}

/// Fixed answer, for clusters whose reachability is known upfront.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct StaticAgentProbe(pub bool);

#[cfg(test)]
#[async_trait]
impl AgentProbe for StaticAgentProbe {
    async fn is_available(&self, _endpoint: &str) -> bool {
        self.0
    }
}
