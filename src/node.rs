//! TSDB Node
//!
//! Ties the directory, the shared context and both worker pools together.
//!
//! ## Lifecycle
//!
//! ```text
//! new ── configure_prefix* ── start ── find_or_create_partition* ── stop
//!                               │                                    │
//!                               ├─ recover directory                 ├─ compaction pool
//!                               ├─ compaction pool                   └─ replication pool
//!                               └─ replication pool
//! ```
//!
//! Prefixes are normally registered before `start` so that recovery can
//! resolve every stored partition. A node runs at most once: after `stop`
//! every lifecycle call returns `NodeError::Stopped`; open a new node on the
//! same index to run again.

use crate::config::{ConfigError, NodeConfig, StreamConfig};
use crate::context::NodeContext;
use crate::directory::{DirectoryError, PartitionDirectory, RecoveryStats};
use crate::index::IndexError;
use crate::key::{is_valid_namespace, PartitionKey};
use crate::partition::PartitionFactory;
use crate::resolver::ConfigResolver;
use crate::worker::{WorkerKind, WorkerPool, WorkerStats};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Error type for node lifecycle operations
#[derive(Debug)]
pub enum NodeError {
    Directory(DirectoryError),
    Index(IndexError),
    AlreadyStarted,
    NotStarted,
    /// The node was stopped and cannot be restarted
    Stopped,
    /// A worker thread could not be spawned
    Spawn(std::io::Error),
    Config(ConfigError),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Directory(e) => write!(f, "{}", e),
            NodeError::Index(e) => write!(f, "{}", e),
            NodeError::AlreadyStarted => write!(f, "node already started"),
            NodeError::NotStarted => write!(f, "node not started"),
            NodeError::Stopped => write!(f, "node stopped"),
            NodeError::Spawn(e) => write!(f, "failed to spawn worker thread: {}", e),
            NodeError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<DirectoryError> for NodeError {
    fn from(e: DirectoryError) -> Self {
        NodeError::Directory(e)
    }
}

impl From<IndexError> for NodeError {
    fn from(e: IndexError) -> Self {
        NodeError::Index(e)
    }
}

impl From<ConfigError> for NodeError {
    fn from(e: ConfigError) -> Self {
        NodeError::Config(e)
    }
}

struct Pools {
    compaction: WorkerPool,
    replication: WorkerPool,
}

enum Lifecycle {
    Created,
    Running(Pools),
    Stopped,
}

impl Lifecycle {
    /// Error for an operation that needs a running node
    fn not_running(&self) -> NodeError {
        match self {
            Lifecycle::Stopped => NodeError::Stopped,
            _ => NodeError::NotStarted,
        }
    }
}

pub struct TsdbNode<F: PartitionFactory> {
    ctx: NodeContext,
    directory: Arc<PartitionDirectory<F>>,
    pass_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
}

impl<F: PartitionFactory> TsdbNode<F> {
    pub fn new(ctx: NodeContext, factory: F, pass_interval: Duration) -> Self {
        let resolver = Arc::new(ConfigResolver::new());
        TsdbNode {
            ctx,
            directory: Arc::new(PartitionDirectory::new(factory, resolver)),
            pass_interval,
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    /// Open the index under `config.data_dir` and register every configured
    /// stream prefix
    pub fn from_config(config: &NodeConfig, factory: F) -> Result<Self, NodeError> {
        config.validate()?;
        let ctx = NodeContext::open(config)?;
        let node = Self::new(ctx, factory, config.workers.pass_interval);

        for ns in &config.namespaces {
            for stream in &ns.streams {
                node.configure_prefix(&ns.name, stream.clone())?;
            }
        }
        Ok(node)
    }

    /// Register a stream config for `namespace`
    pub fn configure_prefix(&self, namespace: &str, config: StreamConfig) -> Result<(), NodeError> {
        if !is_valid_namespace(namespace) {
            return Err(DirectoryError::InvalidNamespace(namespace.to_string()).into());
        }
        self.directory.resolver().configure_prefix(namespace, config);
        Ok(())
    }

    /// Recover the directory, then start compaction and replication pools.
    ///
    /// Nothing is started if recovery fails.
    pub fn start(
        &self,
        num_compaction: usize,
        num_replication: usize,
    ) -> Result<RecoveryStats, NodeError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => return Err(NodeError::AlreadyStarted),
            Lifecycle::Stopped => return Err(NodeError::Stopped),
        }

        let stats = self.directory.recover(&self.ctx)?;

        let compaction = WorkerPool::start(
            WorkerKind::Compaction,
            num_compaction,
            Arc::clone(&self.directory),
            self.ctx.clone(),
            self.pass_interval,
        )
        .map_err(NodeError::Spawn)?;

        // A failure here drops `compaction`, which stops its threads
        let replication = WorkerPool::start(
            WorkerKind::Replication,
            num_replication,
            Arc::clone(&self.directory),
            self.ctx.clone(),
            self.pass_interval,
        )
        .map_err(NodeError::Spawn)?;

        *lifecycle = Lifecycle::Running(Pools {
            compaction,
            replication,
        });

        info!(
            "Node started: {} partitions, {} compaction / {} replication workers",
            stats.partitions_recovered, num_compaction, num_replication
        );
        Ok(stats)
    }

    /// Stop compaction workers, then replication workers
    pub fn stop(&self) -> Result<(), NodeError> {
        let mut pools = {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Running(_)) {
                return Err(lifecycle.not_running());
            }
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(pools) => pools,
                _ => return Err(NodeError::NotStarted),
            }
        };
        pools.compaction.stop();
        pools.replication.stop();
        info!("Node stopped");
        Ok(())
    }

    /// Return the partition for `(namespace, stream_key, partition_key)`,
    /// creating it on first use
    pub fn find_or_create_partition(
        &self,
        namespace: &str,
        stream_key: &str,
        partition_key: &PartitionKey,
    ) -> Result<Arc<F::Partition>, NodeError> {
        {
            let lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Running(_)) {
                return Err(lifecycle.not_running());
            }
        }
        Ok(self
            .directory
            .get_or_create(namespace, stream_key, partition_key, &self.ctx)?)
    }

    pub fn is_started(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Stopped)
    }

    pub fn directory(&self) -> &Arc<PartitionDirectory<F>> {
        &self.directory
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// `(compaction, replication)` counters while the node runs
    pub fn worker_stats(&self) -> Option<(Arc<WorkerStats>, Arc<WorkerStats>)> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(p) => Some((
                Arc::clone(p.compaction.stats()),
                Arc::clone(p.replication.stats()),
            )),
            _ => None,
        }
    }
}

impl<F: PartitionFactory> Drop for TsdbNode<F> {
    fn drop(&mut self) {
        let lifecycle = std::mem::replace(self.lifecycle.get_mut(), Lifecycle::Stopped);
        if let Lifecycle::Running(mut pools) = lifecycle {
            pools.compaction.stop();
            pools.replication.stop();
        }
    }
}

impl<F: PartitionFactory> std::fmt::Debug for TsdbNode<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsdbNode")
            .field("db_path", &self.ctx.db_path())
            .field("directory", &self.directory)
            .field("started", &self.is_started())
            .finish()
    }
}
