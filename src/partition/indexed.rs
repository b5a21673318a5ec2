//! Index-backed reference partition
//!
//! Keeps its whole state in the partition's index row. Useful on its own
//! for nodes that only need partition bookkeeping, and as the partition
//! used by the `tsdb-node` binary and the integration tests.
//!
//! ## Row Value Layout
//!
//! ```text
//! ┌───────────────┬─────────────────┬──────────────────────────┐
//! │ version: u8   │ length: u32 LE  │ bincode(PartitionState)  │
//! └───────────────┴─────────────────┴──────────────────────────┘
//! ```

use super::{Partition, PartitionError, PartitionFactory, PartitionStateRecord};
use crate::config::StreamConfig;
use crate::context::NodeContext;
use crate::key::{composite_key, PartitionKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Current state record format version
pub const STATE_FORMAT_VERSION: u8 = 1;
/// Row value overhead: version(1) + length(4)
const STATE_HEADER_SIZE: usize = 5;

/// Persistent state of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    pub stream_key: String,
    /// Bumped on every change to the partition's contents
    pub version: u64,
    pub compaction_generation: u64,
    pub created_at_ms: u64,
    pub last_compacted_ms: u64,
    /// Highest version each replica has acknowledged
    pub replica_acks: BTreeMap<String, u64>,
}

impl PartitionState {
    pub fn new(stream_key: &str, now_ms: u64) -> Self {
        PartitionState {
            stream_key: stream_key.to_string(),
            version: 0,
            compaction_generation: 0,
            created_at_ms: now_ms,
            last_compacted_ms: 0,
            replica_acks: BTreeMap::new(),
        }
    }

    /// Encode as a length-prefixed row value
    pub fn encode(&self) -> Result<Vec<u8>, PartitionError> {
        let body =
            bincode::serialize(self).map_err(|e| PartitionError::Codec(format!("serialize: {}", e)))?;
        let mut out = Vec::with_capacity(STATE_HEADER_SIZE + body.len());
        out.push(STATE_FORMAT_VERSION);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a row value produced by `encode`
    pub fn decode(data: &[u8]) -> Result<Self, PartitionError> {
        if data.len() < STATE_HEADER_SIZE {
            return Err(PartitionError::Codec(format!(
                "state record too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != STATE_FORMAT_VERSION {
            return Err(PartitionError::Codec(format!(
                "unsupported state version {}",
                data[0]
            )));
        }
        let len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
        let body = data
            .get(STATE_HEADER_SIZE..STATE_HEADER_SIZE + len)
            .ok_or_else(|| PartitionError::Codec("state record truncated".to_string()))?;
        bincode::deserialize(body).map_err(|e| PartitionError::Codec(format!("deserialize: {}", e)))
    }
}

impl PartitionStateRecord for PartitionState {
    fn stream_key(&self) -> &str {
        &self.stream_key
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct IndexedPartition {
    namespace: String,
    key: PartitionKey,
    stream_key: String,
    config: Arc<StreamConfig>,
    state: Mutex<PartitionState>,
}

impl IndexedPartition {
    fn new(namespace: &str, key: PartitionKey, state: PartitionState, config: Arc<StreamConfig>) -> Self {
        IndexedPartition {
            namespace: namespace.to_string(),
            key,
            stream_key: state.stream_key.clone(),
            config,
            state: Mutex::new(state),
        }
    }

    fn persist(&self, ctx: &NodeContext, state: &PartitionState) -> Result<(), PartitionError> {
        let value = state.encode()?;
        let mut txn = ctx.index().begin(false)?;
        txn.put(&composite_key(&self.namespace, &self.key), &value)?;
        txn.commit()?;
        Ok(())
    }

    /// Copy of the current state
    pub fn state(&self) -> PartitionState {
        self.state.lock().clone()
    }

    /// Record that the partition's contents changed; returns the new version
    pub fn record_append(&self, ctx: &NodeContext) -> Result<u64, PartitionError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        next.version += 1;
        self.persist(ctx, &next)?;
        *state = next;
        Ok(state.version)
    }
}

impl Partition for IndexedPartition {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self) -> &PartitionKey {
        &self.key
    }

    fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn config(&self) -> &Arc<StreamConfig> {
        &self.config
    }

    fn compact(&self, ctx: &NodeContext) -> Result<(), PartitionError> {
        let now = now_ms();
        let mut state = self.state.lock();

        let interval_ms = self.config.compaction_interval.as_millis() as u64;
        if state.last_compacted_ms != 0 && now.saturating_sub(state.last_compacted_ms) < interval_ms {
            return Ok(());
        }

        let mut next = state.clone();
        next.compaction_generation += 1;
        next.last_compacted_ms = now;
        self.persist(ctx, &next)?;
        *state = next;

        debug!(
            "Compacted partition {} ({}), generation {}",
            self.key, self.stream_key, state.compaction_generation
        );
        Ok(())
    }

    fn replicate(&self, ctx: &NodeContext) -> Result<(), PartitionError> {
        let replicas = ctx
            .replication()
            .replicas_for(&self.key, self.config.replication_factor);
        if replicas.is_empty() {
            return Ok(());
        }

        // Push without holding the state lock
        let snapshot = self.state();
        let lagging: Vec<&String> = replicas
            .iter()
            .filter(|r| {
                snapshot
                    .replica_acks
                    .get(*r)
                    .map_or(true, |ack| *ack < snapshot.version)
            })
            .collect();
        if lagging.is_empty() {
            return Ok(());
        }

        let payload = snapshot.encode()?;
        let mut acked = Vec::new();
        let mut first_error = None;
        for replica in lagging {
            match ctx.http().push(replica, &payload) {
                Ok(()) => acked.push(replica.clone()),
                Err(e) => {
                    warn!("Replication of {} to {} failed: {}", self.key, replica, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if !acked.is_empty() {
            let mut state = self.state.lock();
            let mut next = state.clone();
            for replica in acked {
                let ack = next.replica_acks.entry(replica).or_insert(0);
                *ack = (*ack).max(snapshot.version);
            }
            self.persist(ctx, &next)?;
            *state = next;
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Factory for `IndexedPartition`
#[derive(Debug, Clone, Default)]
pub struct IndexedPartitionFactory;

impl PartitionFactory for IndexedPartitionFactory {
    type Partition = IndexedPartition;
    type State = PartitionState;

    fn decode_state(&self, value: &[u8]) -> Result<PartitionState, PartitionError> {
        PartitionState::decode(value)
    }

    fn reopen(
        &self,
        namespace: &str,
        key: PartitionKey,
        state: PartitionState,
        config: Arc<StreamConfig>,
        _ctx: &NodeContext,
    ) -> Result<IndexedPartition, PartitionError> {
        Ok(IndexedPartition::new(namespace, key, state, config))
    }

    fn create(
        &self,
        namespace: &str,
        key: PartitionKey,
        stream_key: &str,
        config: Arc<StreamConfig>,
        ctx: &NodeContext,
    ) -> Result<IndexedPartition, PartitionError> {
        let state = PartitionState::new(stream_key, now_ms());
        let partition = IndexedPartition::new(namespace, key, state, config);
        partition.persist(ctx, &partition.state())?;
        Ok(partition)
    }
}
