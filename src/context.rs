//! Node-wide shared context
//!
//! Built once at startup and passed by reference to every partition
//! operation. Nothing in it is replaced after construction; only the
//! index mutates, behind its own transactions.

use crate::config::NodeConfig;
use crate::index::{Index, IndexError};
use crate::replication::{
    ReplicaConnectionPool, ReplicationScheme, StandaloneScheme, StaticScheme,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeContext {
    db_path: PathBuf,
    index: Arc<Index>,
    replication: Arc<dyn ReplicationScheme>,
    http: Arc<ReplicaConnectionPool>,
}

impl NodeContext {
    pub fn new(
        db_path: PathBuf,
        index: Arc<Index>,
        replication: Arc<dyn ReplicationScheme>,
        http: Arc<ReplicaConnectionPool>,
    ) -> Self {
        NodeContext {
            db_path,
            index,
            replication,
            http,
        }
    }

    /// Open the on-disk index and build replication plumbing from config
    pub fn open(config: &NodeConfig) -> Result<Self, IndexError> {
        let index = Index::open(
            &config.data_dir,
            config.index.read_only,
            config.index.map_size_bytes,
            &config.index.data_file,
            &config.index.lock_file,
        )?;

        let replication: Arc<dyn ReplicationScheme> = if config.replication.peers.is_empty() {
            Arc::new(StandaloneScheme)
        } else {
            Arc::new(StaticScheme::from_config(&config.replication))
        };

        let http = ReplicaConnectionPool::tcp(
            config.replication.max_connections.max(1),
            config.replication.buffer_pool_size,
            config.replication.connect_timeout,
        );

        Ok(Self::new(
            config.data_dir.clone(),
            Arc::new(index),
            replication,
            Arc::new(http),
        ))
    }

    /// In-memory index, no replicas; pushes go nowhere
    pub fn in_memory() -> Self {
        Self::new(
            PathBuf::from(":memory:"),
            Arc::new(Index::in_memory()),
            Arc::new(StandaloneScheme),
            Arc::new(ReplicaConnectionPool::new(
                1,
                1,
                Duration::from_secs(1),
                Arc::new(crate::replication::InMemoryTransport::new()),
            )),
        )
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn replication(&self) -> &dyn ReplicationScheme {
        self.replication.as_ref()
    }

    pub fn http(&self) -> &ReplicaConnectionPool {
        &self.http
    }
}
