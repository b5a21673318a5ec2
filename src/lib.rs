pub mod config;
pub mod context;
pub mod directory;
pub mod dst;
pub mod index;
pub mod key;
pub mod node;
pub mod partition;
pub mod replication;
pub mod resolver;
pub mod worker;

#[cfg(test)]
pub mod stateright;

pub use config::{NodeConfig, StreamConfig};
pub use context::NodeContext;
pub use directory::{DirectoryError, PartitionDirectory, RecoveryStats};
pub use index::{Index, IndexError};
pub use key::PartitionKey;
pub use node::{NodeError, TsdbNode};
pub use partition::{IndexedPartition, IndexedPartitionFactory, Partition, PartitionFactory};
pub use resolver::{ConfigResolver, ResolveError};
pub use worker::{WorkerKind, WorkerPool, WorkerStats};
