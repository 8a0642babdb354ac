use std::{ops::RangeInclusive, sync::Mutex};

use log::{info, warn};
use rand::{rngs::OsRng, Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::{
    kubernetes::{ObjectStore, StoreError},
    resources::crd::v1alpha1::cluster::{Cluster, ConnectionType},
};

pub const PROXY_PORT_RANGE: RangeInclusive<u16> = 6000..=7000;
/// Distance between the Kubernetes and the KubeSphere port of a cluster.
pub const KUBESPHERE_PORT_OFFSET: u16 = 10000;
pub const MAX_ALLOCATION_ATTEMPTS: usize = 10;
const TOKEN_LENGTH: usize = 32;

#[derive(Debug, Error)]
pub enum AllocationsError {
    #[error("Couldn't find a free proxy port after {} attempts!", .0)]
    AllocationExhausted(usize),
    #[error("Couldn't list registered clusters! Reason: {}", .0)]
    Store(#[from] StoreError),
}

/// Source of randomness shared by the allocator and token generation.
pub trait RandomSource: Send + Sync {
    fn port_in(&self, range: RangeInclusive<u16>) -> u16;
    fn fill_bytes(&self, buffer: &mut [u8]);
}

/// Operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn port_in(&self, range: RangeInclusive<u16>) -> u16 {
        OsRng.gen_range(range)
    }

    fn fill_bytes(&self, buffer: &mut [u8]) {
        OsRng.fill_bytes(buffer)
    }
}

/// Reproducible randomness for tests and simulations.
#[derive(Debug)]
pub struct SeededRandom(Mutex<ChaCha8Rng>);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(ChaCha8Rng::seed_from_u64(seed)))
    }
}

impl RandomSource for SeededRandom {
    fn port_in(&self, range: RangeInclusive<u16>) -> u16 {
        match self.0.lock() {
            Ok(mut rng) => rng.gen_range(range),
            Err(poisoned) => poisoned.into_inner().gen_range(range),
        }
    }

    fn fill_bytes(&self, buffer: &mut [u8]) {
        match self.0.lock() {
            Ok(mut rng) => rng.fill_bytes(buffer),
            Err(poisoned) => poisoned.into_inner().fill_bytes(buffer),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPorts {
    pub kubernetes: u16,
    pub kubesphere: u16,
}

impl ProxyPorts {
    pub fn from_kubernetes_port(kubernetes: u16) -> Self {
        Self {
            kubernetes,
            kubesphere: kubernetes + KUBESPHERE_PORT_OFFSET,
        }
    }
}

/// Kubernetes ports already held by proxy-mode clusters.
pub fn reserved_ports(clusters: &[Cluster]) -> Vec<u16> {
    clusters
        .iter()
        .filter(|cluster| cluster.spec.connection.type_ == ConnectionType::Proxy)
        .map(|cluster| cluster.spec.connection.kubernetes_api_server_port)
        .filter(|port| *port != 0)
        .collect()
}

/// Draws a port pair that no proxy-mode cluster in `clusters` uses yet.
pub fn pick_proxy_ports(
    clusters: &[Cluster],
    random: &dyn RandomSource,
) -> Result<ProxyPorts, AllocationsError> {
    let reserved = reserved_ports(clusters);

    for _ in 0..MAX_ALLOCATION_ATTEMPTS {
        let port = random.port_in(PROXY_PORT_RANGE);
        if !reserved.contains(&port) {
            info!("Allocated proxy port {port}");
            return Ok(ProxyPorts::from_kubernetes_port(port));
        }

        warn!("Proxy port {port} is taken, retrying...");
    }

    Err(AllocationsError::AllocationExhausted(MAX_ALLOCATION_ATTEMPTS))
}

pub async fn allocate_proxy_ports(
    store: &impl ObjectStore,
    random: &dyn RandomSource,
) -> Result<ProxyPorts, AllocationsError> {
    let clusters = store.list::<Cluster>(None).await?;

    pick_proxy_ports(&clusters, random)
}

/// 32 random bytes, hex encoded.
pub fn generate_token(random: &dyn RandomSource) -> String {
    let mut buffer = [0u8; TOKEN_LENGTH];
    random.fill_bytes(&mut buffer);

    data_encoding::HEXLOWER.encode(&buffer)
}

#[cfg(test)]
mod tests {
    use crate::resources::crd::v1alpha1::cluster::{ClusterSpec, Connection};

    use super::*;

    /// Returns the queued ports in order, then repeats the last one.
    struct ScriptedRandom(Mutex<Vec<u16>>);

    impl RandomSource for ScriptedRandom {
        fn port_in(&self, _range: RangeInclusive<u16>) -> u16 {
            let mut ports = self.0.lock().unwrap();
            if ports.len() > 1 {
                ports.remove(0)
            } else {
                ports[0]
            }
        }

        fn fill_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0xab)
        }
    }

    fn proxy_cluster(name: &str, port: u16) -> Cluster {
        Cluster::new(
            name,
            ClusterSpec {
                connection: Connection {
                    type_: ConnectionType::Proxy,
                    kubernetes_api_server_port: port,
                    kubesphere_api_server_port: port + KUBESPHERE_PORT_OFFSET,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn seeded_allocation_stays_in_range() {
        let random = SeededRandom::new(42);

        for _ in 0..100 {
            let ports = pick_proxy_ports(&[], &random).unwrap();

            assert!(PROXY_PORT_RANGE.contains(&ports.kubernetes));
            assert_eq!(ports.kubesphere, ports.kubernetes + 10000);
        }
    }

    #[test]
    fn seeded_allocation_is_reproducible() {
        let first = pick_proxy_ports(&[], &SeededRandom::new(7)).unwrap();
        let second = pick_proxy_ports(&[], &SeededRandom::new(7)).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn collisions_are_retried() {
        let clusters = vec![proxy_cluster("a", 6001), proxy_cluster("b", 6002)];
        let random = ScriptedRandom(Mutex::new(vec![6001, 6002, 6003]));

        let ports = pick_proxy_ports(&clusters, &random).unwrap();

        assert_eq!(ports, ProxyPorts::from_kubernetes_port(6003));
    }

    #[test]
    fn direct_clusters_do_not_reserve_ports() {
        let mut direct = proxy_cluster("direct", 6500);
        direct.spec.connection.type_ = ConnectionType::Direct;

        assert!(reserved_ports(&[direct]).is_empty());
    }

    #[test]
    fn gives_up_after_bounded_attempts() {
        let clusters = vec![proxy_cluster("a", 6001)];
        let random = ScriptedRandom(Mutex::new(vec![6001]));

        let result = pick_proxy_ports(&clusters, &random);

        assert!(matches!(
            result,
            Err(AllocationsError::AllocationExhausted(MAX_ALLOCATION_ATTEMPTS))
        ));
    }

    #[test]
    fn token_is_hex_encoded_32_bytes() {
        let token = generate_token(&SeededRandom::new(1));

        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            generate_token(&ScriptedRandom(Mutex::new(vec![0]))),
            "ab".repeat(32)
        );
    }
}
