//! Partition Abstraction
//!
//! The directory never looks inside a partition. It needs three things from
//! the partition implementation:
//!
//! - a codec turning an index row value into a state record that names its
//!   stream key (`PartitionFactory::decode_state`)
//! - constructors for reopening a recovered partition and creating a new one
//! - the maintenance operations workers invoke (`compact`, `replicate`)
//!
//! Handles are shared as `Arc<P>`; a partition synchronizes its own state.

pub mod indexed;

pub use indexed::{IndexedPartition, IndexedPartitionFactory, PartitionState};

use crate::config::StreamConfig;
use crate::context::NodeContext;
use crate::index::IndexError;
use crate::key::PartitionKey;
use crate::replication::ReplicationError;
use std::sync::Arc;

/// Error type for partition construction and operations
#[derive(Debug)]
pub enum PartitionError {
    /// Index read or write failed
    Index(IndexError),
    /// State record could not be encoded or decoded
    Codec(String),
    /// Push to a replica failed
    Replication(ReplicationError),
    /// Implementation-specific failure
    Other(String),
}

impl std::fmt::Display for PartitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionError::Index(e) => write!(f, "partition index error: {}", e),
            PartitionError::Codec(msg) => write!(f, "partition state codec error: {}", msg),
            PartitionError::Replication(e) => write!(f, "partition replication error: {}", e),
            PartitionError::Other(msg) => write!(f, "partition error: {}", msg),
        }
    }
}

impl std::error::Error for PartitionError {}

impl From<IndexError> for PartitionError {
    fn from(e: IndexError) -> Self {
        PartitionError::Index(e)
    }
}

impl From<ReplicationError> for PartitionError {
    fn from(e: ReplicationError) -> Self {
        PartitionError::Replication(e)
    }
}

/// Decoded index row value
pub trait PartitionStateRecord: Send {
    /// Stream key the partition was created for
    fn stream_key(&self) -> &str;
}

/// Live handle to one partition
pub trait Partition: Send + Sync + 'static {
    fn namespace(&self) -> &str;
    fn key(&self) -> &PartitionKey;
    fn stream_key(&self) -> &str;
    fn config(&self) -> &Arc<StreamConfig>;

    /// Run one maintenance step
    fn compact(&self, ctx: &NodeContext) -> Result<(), PartitionError>;

    /// Bring lagging replicas up to date
    fn replicate(&self, ctx: &NodeContext) -> Result<(), PartitionError>;
}

/// Constructs partition handles
pub trait PartitionFactory: Send + Sync + 'static {
    type Partition: Partition;
    type State: PartitionStateRecord;

    /// Decode the value bytes of a partition's index row
    fn decode_state(&self, value: &[u8]) -> Result<Self::State, PartitionError>;

    /// Rebuild a live handle from recovered state
    fn reopen(
        &self,
        namespace: &str,
        key: PartitionKey,
        state: Self::State,
        config: Arc<StreamConfig>,
        ctx: &NodeContext,
    ) -> Result<Self::Partition, PartitionError>;

    /// Create a brand-new partition
    fn create(
        &self,
        namespace: &str,
        key: PartitionKey,
        stream_key: &str,
        config: Arc<StreamConfig>,
        ctx: &NodeContext,
    ) -> Result<Self::Partition, PartitionError>;
}
