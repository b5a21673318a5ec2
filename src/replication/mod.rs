//! Replication topology and outbound plumbing
//!
//! A `ReplicationScheme` decides which remote nodes hold copies of a
//! partition. The `ReplicaConnectionPool` bounds and performs the pushes.

pub mod pool;

pub use pool::{
    InMemoryTransport, ReplicaConnectionPool, ReplicaTransport, ReplicationError, TcpTransport,
};

use crate::config::ReplicationConfig;
use crate::key::PartitionKey;

/// Chooses the remote replicas of a partition
pub trait ReplicationScheme: Send + Sync + std::fmt::Debug {
    /// Remote addresses that should hold `key`.
    ///
    /// `replication_factor` counts every copy including the local one, so at
    /// most `replication_factor - 1` addresses are returned. The local node is
    /// never included.
    fn replicas_for(&self, key: &PartitionKey, replication_factor: usize) -> Vec<String>;
}

/// Single-node deployment: no remote replicas
#[derive(Debug, Clone, Default)]
pub struct StandaloneScheme;

impl ReplicationScheme for StandaloneScheme {
    fn replicas_for(&self, _key: &PartitionKey, _replication_factor: usize) -> Vec<String> {
        Vec::new()
    }
}

/// Fixed peer list with rendezvous placement.
///
/// Each remote peer is scored by hashing it with the partition key; the
/// `replication_factor - 1` highest-scoring peers hold the remote copies.
#[derive(Debug, Clone)]
pub struct StaticScheme {
    local_address: Option<String>,
    peers: Vec<String>,
}

impl StaticScheme {
    pub fn new(local_address: Option<String>, peers: Vec<String>) -> Self {
        StaticScheme {
            local_address,
            peers,
        }
    }

    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self::new(config.local_address.clone(), config.peers.clone())
    }

    fn score(key: &PartitionKey, peer: &str) -> u64 {
        let mut buf = Vec::with_capacity(key.as_bytes().len() + peer.len());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(peer.as_bytes());
        let digest = PartitionKey::digest(&buf);
        let b = digest.as_bytes();
        u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }
}

impl ReplicationScheme for StaticScheme {
    fn replicas_for(&self, key: &PartitionKey, replication_factor: usize) -> Vec<String> {
        let remote_copies = replication_factor.saturating_sub(1);
        if remote_copies == 0 {
            return Vec::new();
        }

        let mut ranked: Vec<(u64, &String)> = self
            .peers
            .iter()
            .filter(|peer| self.local_address.as_deref() != Some(peer.as_str()))
            .map(|peer| (Self::score(key, peer), peer))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        let replicas: Vec<String> = ranked
            .into_iter()
            .take(remote_copies)
            .map(|(_, peer)| peer.clone())
            .collect();
        debug_assert!(replicas.len() < replication_factor);
        replicas
    }
}
