use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use log::info;
use thiserror::Error;

use crate::{
    kubernetes::{
        operations::{create_or_reuse, try_get_resource},
        poll::{poll_until, PollError, PollSettings},
        ObjectStore, StoreError,
    },
    resources::federation::secret::{extract_token_data, generate_service_account_token_secret},
};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Token secret '{}' wasn't populated within {:?}!", .0, .1)]
    Timeout(String, Duration),
    #[error("Kubernetes API request failed! Reason: {}", .0)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccountToken {
    pub token: Vec<u8>,
    pub ca_bundle: Option<Vec<u8>>,
}

/// Makes sure `service_account` has a token secret and waits until the API
/// server fills it in.
pub async fn ensure_service_account_token(
    store: &impl ObjectStore,
    namespace: &str,
    service_account: &str,
    secret_name: &str,
    poll: PollSettings,
) -> Result<ServiceAccountToken, TokenError> {
    let secret =
        generate_service_account_token_secret(namespace, service_account, secret_name.to_owned());
    create_or_reuse(store, &secret, false).await?;

    info!("Waiting for '{secret_name}' token to be populated...");

    let result = poll_until(poll, move || async move {
        try_get_resource::<Secret>(store, Some(namespace), secret_name)
            .await
            .map(|secret| secret.as_ref().and_then(extract_token_data))
    })
    .await;

    match result {
        Ok((token, ca_bundle)) => Ok(ServiceAccountToken { token, ca_bundle }),
        Err(PollError::Timeout(timeout)) => {
            Err(TokenError::Timeout(secret_name.to_owned(), timeout))
        }
        Err(PollError::Aborted(err)) => Err(err.into()),
    }
}
