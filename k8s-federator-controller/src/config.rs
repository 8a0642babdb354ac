use std::{env::var, num::ParseIntError, path::PathBuf, time::Duration};

use k8s_federator_core::{
    DEFAULT_FEDERATION_NAMESPACE, DEFAULT_HOST_CLUSTER_NAME, DEFAULT_KUBECONFIG_NAMESPACE,
    DEFAULT_PROXY_NAMESPACE,
};
use thiserror::Error;

pub const HOST_CLUSTER_NAME_ENV: &str = "FEDERATOR_HOST_CLUSTER_NAME";
pub const FEDERATION_NAMESPACE_ENV: &str = "FEDERATOR_FEDERATION_NAMESPACE";
pub const PROXY_NAMESPACE_ENV: &str = "FEDERATOR_PROXY_NAMESPACE";
pub const KUBECONFIG_NAMESPACE_ENV: &str = "FEDERATOR_KUBECONFIG_NAMESPACE";
pub const WORKERS_ENV: &str = "FEDERATOR_WORKERS";
pub const MAX_RETRIES_ENV: &str = "FEDERATOR_MAX_RETRIES";
pub const RESYNC_SECS_ENV: &str = "FEDERATOR_RESYNC_SECS";
pub const HOST_API_SERVER_ENV: &str = "FEDERATOR_HOST_API_SERVER";
pub const HOST_CA_FILE_ENV: &str = "FEDERATOR_HOST_CA_FILE";

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_MAX_RETRIES: u32 = 15;
const DEFAULT_RESYNC_SECS: u64 = 60 * 5;
const DEFAULT_HOST_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

#[derive(Debug, Error)]
pub enum FromError {
    #[error("{} couldn't be parsed! Reason: {}", .0, .1)]
    InvalidNumber(&'static str, ParseIntError),
    #[error("{} must be greater than zero!", .0)]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub host_cluster_name: String,
    pub federation_namespace: String,
    pub proxy_namespace: String,
    pub kubeconfig_namespace: String,
    pub workers: usize,
    /// failed reconciles of a single key before it's dropped
    pub max_retries: u32,
    pub resync: Duration,
    /// `None` disables the per-user kubeconfig flow
    pub host_api_server: Option<String>,
    pub host_ca_file: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host_cluster_name: DEFAULT_HOST_CLUSTER_NAME.to_owned(),
            federation_namespace: DEFAULT_FEDERATION_NAMESPACE.to_owned(),
            proxy_namespace: DEFAULT_PROXY_NAMESPACE.to_owned(),
            kubeconfig_namespace: DEFAULT_KUBECONFIG_NAMESPACE.to_owned(),
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            resync: Duration::from_secs(DEFAULT_RESYNC_SECS),
            host_api_server: None,
            host_ca_file: PathBuf::from(DEFAULT_HOST_CA_FILE),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, FromError> {
        Self::from_lookup(|name| var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FromError> {
        let defaults = Self::default();
        let string = |name: &str, default: String| lookup(name).unwrap_or(default);

        Ok(Self {
            host_cluster_name: string(HOST_CLUSTER_NAME_ENV, defaults.host_cluster_name),
            federation_namespace: string(FEDERATION_NAMESPACE_ENV, defaults.federation_namespace),
            proxy_namespace: string(PROXY_NAMESPACE_ENV, defaults.proxy_namespace),
            kubeconfig_namespace: string(KUBECONFIG_NAMESPACE_ENV, defaults.kubeconfig_namespace),
            workers: positive(WORKERS_ENV, lookup(WORKERS_ENV), defaults.workers)?,
            max_retries: number(MAX_RETRIES_ENV, lookup(MAX_RETRIES_ENV), defaults.max_retries)?,
            resync: Duration::from_secs(positive(
                RESYNC_SECS_ENV,
                lookup(RESYNC_SECS_ENV),
                defaults.resync.as_secs(),
            )?),
            host_api_server: lookup(HOST_API_SERVER_ENV).filter(|server| !server.is_empty()),
            host_ca_file: lookup(HOST_CA_FILE_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.host_ca_file),
        })
    }
}

fn number<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, FromError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|err| FromError::InvalidNumber(name, err)),
        None => Ok(default),
    }
}

fn positive<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, FromError>
where
    T: std::str::FromStr<Err = ParseIntError> + Default + PartialEq,
{
    let value = number(name, value, default)?;
    if value == T::default() {
        return Err(FromError::Zero(name));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ControllerConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_retries, 15);
        assert_eq!(config.resync, Duration::from_secs(300));
        assert!(config.host_api_server.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let config = ControllerConfig::from_lookup(lookup(&[
            (HOST_CLUSTER_NAME_ENV, "control"),
            (WORKERS_ENV, "2"),
            (MAX_RETRIES_ENV, "0"),
            (RESYNC_SECS_ENV, " 30 "),
            (HOST_API_SERVER_ENV, "https://host.example.com:6443"),
        ]))
        .unwrap();

        assert_eq!(config.host_cluster_name, "control");
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.resync, Duration::from_secs(30));
        assert_eq!(
            config.host_api_server.as_deref(),
            Some("https://host.example.com:6443")
        );
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let result = ControllerConfig::from_lookup(lookup(&[(WORKERS_ENV, "many")]));
        assert!(matches!(result, Err(FromError::InvalidNumber(WORKERS_ENV, _))));

        let result = ControllerConfig::from_lookup(lookup(&[(WORKERS_ENV, "0")]));
        assert!(matches!(result, Err(FromError::Zero(WORKERS_ENV))));
    }
}
