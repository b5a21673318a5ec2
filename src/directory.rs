//! Partition Directory
//!
//! In-memory registry mapping `namespace ~ partition_key` to the single live
//! handle of that partition.
//!
//! ## Recovery Flow (TigerStyle: explicit steps)
//!
//! 1. Open a read-only transaction and a cursor at the first key
//! 2. Skip empty keys and metadata keys (`0x1B...`)
//! 3. Split each key at the first `~`; no separator aborts recovery
//! 4. Decode the row value, resolve its config, reopen the partition
//! 5. Publish the rebuilt table only if every row succeeded
//!
//! ## Get-or-Create
//!
//! Lookup, config resolution, construction and insert all happen under one
//! lock. Two callers racing on a never-seen key cannot both construct.

use crate::context::NodeContext;
use crate::index::IndexError;
use crate::key::{
    composite_key, is_metadata_key, is_valid_namespace, split_composite_key, PartitionKey,
};
use crate::partition::{PartitionError, PartitionFactory, PartitionStateRecord};
use crate::resolver::{ConfigResolver, ResolveError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Error type for directory operations
#[derive(Debug)]
pub enum DirectoryError {
    /// No registered prefix matches the stream key
    ConfigNotFound(ResolveError),
    /// An index row cannot be mapped back to a partition identity
    CorruptIndex(String),
    /// The partition implementation failed to reopen or create
    PartitionConstruction {
        namespace: String,
        key: PartitionKey,
        source: PartitionError,
    },
    /// The index itself failed
    Index(IndexError),
    /// Namespace contains `~` or starts with the metadata marker
    InvalidNamespace(String),
    /// Recovery already ran on this directory
    AlreadyRecovered,
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::ConfigNotFound(e) => write!(f, "{}", e),
            DirectoryError::CorruptIndex(msg) => write!(f, "corrupt partition index: {}", msg),
            DirectoryError::PartitionConstruction {
                namespace,
                key,
                source,
            } => write!(
                f,
                "failed to construct partition {}~{}: {}",
                namespace, key, source
            ),
            DirectoryError::Index(e) => write!(f, "{}", e),
            DirectoryError::InvalidNamespace(ns) => write!(f, "invalid namespace: {:?}", ns),
            DirectoryError::AlreadyRecovered => write!(f, "partition directory already recovered"),
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<ResolveError> for DirectoryError {
    fn from(e: ResolveError) -> Self {
        DirectoryError::ConfigNotFound(e)
    }
}

impl From<IndexError> for DirectoryError {
    fn from(e: IndexError) -> Self {
        DirectoryError::Index(e)
    }
}

/// Statistics from a recovery scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub partitions_recovered: usize,
    pub metadata_rows_skipped: usize,
    pub empty_keys_skipped: usize,
    /// Rows whose key was already present in this scan
    pub duplicates: usize,
}

struct Registry<P> {
    partitions: HashMap<Vec<u8>, Arc<P>>,
    recovered: bool,
}

pub struct PartitionDirectory<F: PartitionFactory> {
    factory: F,
    resolver: Arc<ConfigResolver>,
    registry: Mutex<Registry<F::Partition>>,
}

impl<F: PartitionFactory> PartitionDirectory<F> {
    pub fn new(factory: F, resolver: Arc<ConfigResolver>) -> Self {
        PartitionDirectory {
            factory,
            resolver,
            registry: Mutex::new(Registry {
                partitions: HashMap::new(),
                recovered: false,
            }),
        }
    }

    pub fn resolver(&self) -> &Arc<ConfigResolver> {
        &self.resolver
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Rebuild the registry from the index.
    ///
    /// Must run once, before workers start and before any `get_or_create`.
    /// On failure the directory stays empty and recovery may be retried.
    pub fn recover(&self, ctx: &NodeContext) -> Result<RecoveryStats, DirectoryError> {
        if self.registry.lock().recovered {
            return Err(DirectoryError::AlreadyRecovered);
        }

        let mut stats = RecoveryStats::default();
        let mut table: HashMap<Vec<u8>, Arc<F::Partition>> = HashMap::new();

        let txn = ctx.index().begin(true)?;
        let mut cursor = txn.cursor();
        let mut entry = cursor.get_first();

        while let Some((key, value)) = entry {
            entry = cursor.get_next();

            if key.is_empty() {
                stats.empty_keys_skipped += 1;
                continue;
            }
            if is_metadata_key(key) {
                stats.metadata_rows_skipped += 1;
                continue;
            }

            let (ns_bytes, key_bytes) = split_composite_key(key).ok_or_else(|| {
                DirectoryError::CorruptIndex(format!(
                    "invalid partition key: {}",
                    String::from_utf8_lossy(key)
                ))
            })?;
            let namespace = std::str::from_utf8(ns_bytes).map_err(|_| {
                DirectoryError::CorruptIndex(format!(
                    "namespace is not UTF-8: {}",
                    String::from_utf8_lossy(ns_bytes)
                ))
            })?;
            let partition_key = PartitionKey::from_slice(key_bytes).ok_or_else(|| {
                DirectoryError::CorruptIndex(format!(
                    "partition key in namespace '{}' has {} bytes",
                    namespace,
                    key_bytes.len()
                ))
            })?;

            let construction = |source| DirectoryError::PartitionConstruction {
                namespace: namespace.to_string(),
                key: partition_key,
                source,
            };

            let state = self.factory.decode_state(value).map_err(construction)?;
            let config = self.resolver.resolve(namespace, state.stream_key())?;
            let partition = self
                .factory
                .reopen(namespace, partition_key, state, config, ctx)
                .map_err(construction)?;

            if table.insert(key.to_vec(), Arc::new(partition)).is_some() {
                stats.duplicates += 1;
                warn!(
                    "Duplicate index row for partition {}~{}; keeping the later row",
                    namespace, partition_key
                );
            }
        }

        cursor.close();
        txn.abort();

        stats.partitions_recovered = table.len();

        let mut registry = self.registry.lock();
        debug_assert!(
            registry.partitions.is_empty(),
            "Precondition: no partitions registered before recovery"
        );
        registry.partitions = table;
        registry.recovered = true;
        drop(registry);

        info!(
            "Recovered {} partitions ({} metadata rows skipped)",
            stats.partitions_recovered, stats.metadata_rows_skipped
        );
        Ok(stats)
    }

    /// Return the handle for a partition, creating it on first use
    pub fn get_or_create(
        &self,
        namespace: &str,
        stream_key: &str,
        partition_key: &PartitionKey,
        ctx: &NodeContext,
    ) -> Result<Arc<F::Partition>, DirectoryError> {
        if !is_valid_namespace(namespace) {
            return Err(DirectoryError::InvalidNamespace(namespace.to_string()));
        }

        let key = composite_key(namespace, partition_key);
        let mut registry = self.registry.lock();

        if let Some(existing) = registry.partitions.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let config = self.resolver.resolve(namespace, stream_key)?;
        let partition = self
            .factory
            .create(namespace, *partition_key, stream_key, config, ctx)
            .map_err(|source| DirectoryError::PartitionConstruction {
                namespace: namespace.to_string(),
                key: *partition_key,
                source,
            })?;

        let partition = Arc::new(partition);
        registry.partitions.insert(key, Arc::clone(&partition));
        debug!(
            "Created partition {}~{} for stream '{}'",
            namespace, partition_key, stream_key
        );
        Ok(partition)
    }

    /// Look up an existing partition
    pub fn get(&self, namespace: &str, partition_key: &PartitionKey) -> Option<Arc<F::Partition>> {
        let key = composite_key(namespace, partition_key);
        self.registry.lock().partitions.get(&key).cloned()
    }

    /// Snapshot of every registered handle; the lock is released on return
    pub fn partitions(&self) -> Vec<Arc<F::Partition>> {
        self.registry.lock().partitions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.registry.lock().partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().partitions.is_empty()
    }

    pub fn is_recovered(&self) -> bool {
        self.registry.lock().recovered
    }
}

impl<F: PartitionFactory> std::fmt::Debug for PartitionDirectory<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("PartitionDirectory")
            .field("partitions", &registry.partitions.len())
            .field("recovered", &registry.recovered)
            .finish()
    }
}
