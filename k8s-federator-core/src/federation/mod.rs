use std::time::Duration;

use derive_builder::Builder;
use thiserror::Error;

use crate::{
    credentials::token::TokenError,
    kubernetes::{poll::PollSettings, StoreError},
    resources::federation::FederationMembership,
};

pub mod join;
pub mod unjoin;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("Service account '{}' already exists on the member cluster!", .0)]
    ServiceAccountExists(String),
    #[error("Couldn't obtain the member service account token! Reason: {}", .0)]
    Token(#[from] TokenError),
    #[error("Kubernetes API request failed! Reason: {}", .0)]
    Store(#[from] StoreError),
}

impl FederationError {
    pub fn is_already_exists(&self) -> bool {
        match self {
            FederationError::ServiceAccountExists(_) => true,
            FederationError::Store(err) => err.is_already_exists(),
            FederationError::Token(TokenError::Store(err)) => err.is_already_exists(),
            FederationError::Token(_) => false,
        }
    }
}

fn default_token_poll() -> PollSettings {
    PollSettings::new(Duration::from_secs(1), Duration::from_secs(30))
}

#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct JoinOptions {
    pub membership: FederationMembership,
    /// member API server as seen from the federation
    pub api_endpoint: String,
    #[builder(default)]
    pub ca_bundle: Option<Vec<u8>>,
    /// skip TLS validation of the member API server
    #[builder(default)]
    pub insecure: bool,
    /// fail on existing objects instead of reusing them
    #[builder(default)]
    pub error_on_existing: bool,
    #[builder(default = "default_token_poll()")]
    pub token_poll: PollSettings,
}

#[derive(Debug, Clone)]
pub struct UnjoinOptions {
    pub membership: FederationMembership,
    /// log and carry on when a step fails
    pub force_deletion: bool,
    /// only remove the host side of the registration
    pub skip_member_cluster_resources: bool,
}

impl UnjoinOptions {
    pub fn new(membership: FederationMembership) -> Self {
        Self {
            membership,
            force_deletion: false,
            skip_member_cluster_resources: false,
        }
    }

    pub fn force_deletion(self, force_deletion: bool) -> Self {
        Self {
            force_deletion,
            ..self
        }
    }

    pub fn skip_member_cluster_resources(self, skip: bool) -> Self {
        Self {
            skip_member_cluster_resources: skip,
            ..self
        }
    }
}
