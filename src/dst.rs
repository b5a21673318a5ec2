//! Deterministic Simulation Testing for the Partition Directory
//!
//! Drives a seeded mix of get-or-create, lookup, compaction and restart
//! operations against a real index (in-memory or file-backed) and checks
//! the directory against a simple model after every step.
//!
//! ## Invariants
//!
//! 1. Within one incarnation, a composite key always maps to the same handle
//! 2. A restart recovers exactly the set of partitions created so far
//! 3. Every partition is bound to the longest registered prefix of its stream
//! 4. A request whose stream key resolves nowhere leaves the directory unchanged

use crate::config::StreamConfig;
use crate::context::NodeContext;
use crate::directory::{DirectoryError, PartitionDirectory};
use crate::index::{Index, DEFAULT_DATA_FILE, DEFAULT_LOCK_FILE, DEFAULT_MAP_SIZE};
use crate::key::{composite_key, PartitionKey};
use crate::partition::{IndexedPartition, IndexedPartitionFactory, Partition};
use crate::replication::{InMemoryTransport, ReplicaConnectionPool, StandaloneScheme};
use crate::resolver::ConfigResolver;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Namespaces and the prefixes registered in each
const LAYOUT: &[(&str, &[&str])] = &[
    ("metrics", &["", "cpu", "cpu.user", "mem"]),
    ("logs", &["app", "app.web"]),
];

/// Stream keys requests are drawn from; some resolve nowhere in `logs`
const STREAMS: &[&str] = &[
    "cpu.user.0",
    "cpu.sys",
    "mem.free",
    "disk.io",
    "app.web.nginx",
    "app.db",
];

/// Configuration for directory DST
#[derive(Debug, Clone)]
pub struct DirectoryDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Distinct partition keys per namespace
    pub key_space: u32,
    /// Probability of a restart (drop directory, recover from the index)
    pub restart_probability: f64,
    /// Probability of compacting a random live partition
    pub compact_probability: f64,
    /// File-backed index directory; `None` keeps the index in memory
    pub data_dir: Option<PathBuf>,
}

impl Default for DirectoryDSTConfig {
    fn default() -> Self {
        DirectoryDSTConfig {
            seed: 0,
            key_space: 32,
            restart_probability: 0.05,
            compact_probability: 0.10,
            data_dir: None,
        }
    }
}

impl DirectoryDSTConfig {
    pub fn new(seed: u64) -> Self {
        DirectoryDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Frequent restarts
    pub fn restart_heavy(seed: u64) -> Self {
        DirectoryDSTConfig {
            seed,
            restart_probability: 0.25,
            ..Default::default()
        }
    }

    /// Index persisted under `data_dir`; restarts close and reopen the file
    pub fn file_backed(seed: u64, data_dir: PathBuf) -> Self {
        DirectoryDSTConfig {
            seed,
            data_dir: Some(data_dir),
            ..Default::default()
        }
    }
}

/// Operation chosen by the workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryOperation {
    GetOrCreate {
        namespace: &'static str,
        stream_key: &'static str,
        key: u32,
    },
    Lookup {
        namespace: &'static str,
        key: u32,
    },
    Compact,
    Restart,
}

/// Result of a directory DST run
#[derive(Debug, Clone, Default)]
pub struct DirectoryDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub creates: u64,
    pub hits: u64,
    pub unresolved: u64,
    pub compactions: u64,
    pub restarts: u64,
    pub invariant_violations: Vec<String>,
}

impl DirectoryDSTResult {
    pub fn new(seed: u64) -> Self {
        DirectoryDSTResult {
            seed,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} creates, {} hits, {} unresolved, {} compactions, {} restarts), {} violations",
            self.seed,
            self.total_operations,
            self.creates,
            self.hits,
            self.unresolved,
            self.compactions,
            self.restarts,
            self.invariant_violations.len()
        )
    }
}

/// What the model expects to be stored for one partition
#[derive(Debug, Clone)]
struct ModelEntry {
    namespace: &'static str,
    stream_key: &'static str,
}

/// Main DST harness
pub struct DirectoryDSTHarness {
    config: DirectoryDSTConfig,
    rng: ChaCha8Rng,
    ctx: Option<NodeContext>,
    directory: PartitionDirectory<IndexedPartitionFactory>,
    /// Handles returned during the current incarnation
    live: HashMap<Vec<u8>, Arc<IndexedPartition>>,
    /// Every partition created since the run began
    model: BTreeMap<Vec<u8>, ModelEntry>,
    result: DirectoryDSTResult,
}

impl DirectoryDSTHarness {
    pub fn new(config: DirectoryDSTConfig) -> Self {
        let mut result = DirectoryDSTResult::new(config.seed);
        let ctx = match Self::open_context(&config, None) {
            Ok(ctx) => ctx,
            Err(e) => {
                result
                    .invariant_violations
                    .push(format!("index failed to open: {}", e));
                NodeContext::in_memory()
            }
        };

        let directory = Self::fresh_directory();
        if let Err(e) = directory.recover(&ctx) {
            result
                .invariant_violations
                .push(format!("initial recovery failed: {}", e));
        }

        DirectoryDSTHarness {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            ctx: Some(ctx),
            directory,
            live: HashMap::new(),
            model: BTreeMap::new(),
            result,
        }
    }

    fn fresh_directory() -> PartitionDirectory<IndexedPartitionFactory> {
        let resolver = Arc::new(ConfigResolver::new());
        for (namespace, prefixes) in LAYOUT {
            for prefix in *prefixes {
                resolver.configure_prefix(namespace, StreamConfig::test(*prefix));
            }
        }
        PartitionDirectory::new(IndexedPartitionFactory, resolver)
    }

    /// Open the index for a new incarnation. An in-memory run keeps the
    /// previous index alive across restarts.
    fn open_context(
        config: &DirectoryDSTConfig,
        previous: Option<&NodeContext>,
    ) -> Result<NodeContext, crate::index::IndexError> {
        let (index, path) = match (&config.data_dir, previous) {
            (Some(dir), _) => (
                Arc::new(Index::open(
                    dir,
                    false,
                    DEFAULT_MAP_SIZE,
                    DEFAULT_DATA_FILE,
                    DEFAULT_LOCK_FILE,
                )?),
                dir.clone(),
            ),
            (None, Some(prev)) => (Arc::clone(prev.index()), PathBuf::from(":memory:")),
            (None, None) => (Arc::new(Index::in_memory()), PathBuf::from(":memory:")),
        };

        Ok(NodeContext::new(
            path,
            index,
            Arc::new(StandaloneScheme),
            Arc::new(ReplicaConnectionPool::new(
                1,
                1,
                Duration::from_secs(1),
                Arc::new(InMemoryTransport::new()),
            )),
        ))
    }

    fn next_operation(&mut self) -> DirectoryOperation {
        let roll: f64 = self.rng.gen();
        if roll < self.config.restart_probability {
            return DirectoryOperation::Restart;
        }
        if roll < self.config.restart_probability + self.config.compact_probability {
            return DirectoryOperation::Compact;
        }

        let namespace = LAYOUT[self.rng.gen_range(0..LAYOUT.len())].0;
        let key = self.rng.gen_range(0..self.config.key_space);
        if self.rng.gen_bool(0.2) {
            DirectoryOperation::Lookup { namespace, key }
        } else {
            let stream_key = STREAMS[self.rng.gen_range(0..STREAMS.len())];
            DirectoryOperation::GetOrCreate {
                namespace,
                stream_key,
                key,
            }
        }
    }

    fn partition_key(key: u32) -> PartitionKey {
        PartitionKey::digest(&key.to_le_bytes())
    }

    /// Longest registered prefix of `stream_key` in `namespace`
    fn expected_prefix(namespace: &str, stream_key: &str) -> Option<&'static str> {
        LAYOUT
            .iter()
            .filter(|(ns, _)| *ns == namespace)
            .flat_map(|(_, prefixes)| prefixes.iter().copied())
            .filter(|p| stream_key.starts_with(p))
            .max_by_key(|p| p.len())
    }

    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.next_operation();
            self.result.total_operations += 1;
            self.apply(op);
            if !self.result.is_success() {
                break;
            }
        }
    }

    fn apply(&mut self, op: DirectoryOperation) {
        let Some(ctx) = self.ctx.clone() else {
            return;
        };

        match op {
            DirectoryOperation::GetOrCreate {
                namespace,
                stream_key,
                key,
            } => {
                let pk = Self::partition_key(key);
                let ck = composite_key(namespace, &pk);
                let existed = self.model.contains_key(&ck);

                match self.directory.get_or_create(namespace, stream_key, &pk, &ctx) {
                    Ok(handle) => {
                        let same = self.live.get(&ck).map(|prev| Arc::ptr_eq(prev, &handle));
                        match same {
                            Some(true) => self.result.hits += 1,
                            Some(false) => self.violation(format!(
                                "two handles for {}~{} in one incarnation",
                                namespace, pk
                            )),
                            None => {
                                if existed {
                                    // First touch since the last restart
                                    self.result.hits += 1;
                                } else {
                                    self.result.creates += 1;
                                    self.model.insert(
                                        ck.clone(),
                                        ModelEntry {
                                            namespace,
                                            stream_key,
                                        },
                                    );
                                }
                                self.live.insert(ck, handle);
                            }
                        }
                    }
                    Err(DirectoryError::ConfigNotFound(_)) => {
                        self.result.unresolved += 1;
                        if Self::expected_prefix(namespace, stream_key).is_some() {
                            self.violation(format!(
                                "stream '{}' in '{}' should have resolved",
                                stream_key, namespace
                            ));
                        }
                        if existed != self.directory.get(namespace, &pk).is_some() {
                            self.violation("failed create changed the directory".to_string());
                        }
                    }
                    Err(e) => self.violation(format!("get_or_create failed: {}", e)),
                }
            }
            DirectoryOperation::Lookup { namespace, key } => {
                let pk = Self::partition_key(key);
                let ck = composite_key(namespace, &pk);
                let found = self.directory.get(namespace, &pk);
                match (found, self.model.contains_key(&ck)) {
                    (Some(handle), true) => {
                        match self.live.get(&ck).map(|prev| Arc::ptr_eq(prev, &handle)) {
                            Some(true) => {}
                            Some(false) => self
                                .violation(format!("lookup of {}~{} changed handle", namespace, pk)),
                            None => {
                                self.live.insert(ck, handle);
                            }
                        }
                    }
                    (None, false) => {}
                    (Some(_), false) => {
                        self.violation(format!("{}~{} present but never created", namespace, pk))
                    }
                    (None, true) => self.violation(format!("{}~{} lost", namespace, pk)),
                }
            }
            DirectoryOperation::Compact => {
                let partitions = self.directory.partitions();
                if partitions.is_empty() {
                    return;
                }
                let target = &partitions[self.rng.gen_range(0..partitions.len())];
                match target.compact(&ctx) {
                    Ok(()) => self.result.compactions += 1,
                    Err(e) => self.violation(format!("compaction failed: {}", e)),
                }
            }
            DirectoryOperation::Restart => self.restart(ctx),
        }
    }

    fn restart(&mut self, ctx: NodeContext) {
        self.result.restarts += 1;
        self.live.clear();
        self.directory = Self::fresh_directory();

        // File-backed runs must release the lock before reopening
        let previous = if self.config.data_dir.is_some() {
            drop(ctx);
            self.ctx = None;
            None
        } else {
            Some(ctx)
        };

        let ctx = match Self::open_context(&self.config, previous.as_ref()) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.violation(format!("index reopen failed: {}", e));
                return;
            }
        };

        match self.directory.recover(&ctx) {
            Ok(stats) => {
                if stats.partitions_recovered != self.model.len() {
                    self.violation(format!(
                        "recovered {} partitions, created {}",
                        stats.partitions_recovered,
                        self.model.len()
                    ));
                }
            }
            Err(e) => self.violation(format!("recovery failed: {}", e)),
        }
        self.ctx = Some(ctx);
        self.check_invariants();
    }

    /// Compare the directory with the model
    pub fn check_invariants(&mut self) {
        let mut violations = Vec::new();

        if self.directory.len() != self.model.len() {
            violations.push(format!(
                "directory holds {} partitions, model {}",
                self.directory.len(),
                self.model.len()
            ));
        }

        for partition in self.directory.partitions() {
            let ck = composite_key(partition.namespace(), partition.key());
            let Some(entry) = self.model.get(&ck) else {
                violations.push(format!(
                    "unexpected partition {}~{}",
                    partition.namespace(),
                    partition.key()
                ));
                continue;
            };

            if partition.stream_key() != entry.stream_key {
                violations.push(format!(
                    "{}~{} has stream '{}', expected '{}'",
                    entry.namespace,
                    partition.key(),
                    partition.stream_key(),
                    entry.stream_key
                ));
            }
            let expected = Self::expected_prefix(entry.namespace, entry.stream_key);
            if expected != Some(partition.config().stream_key_prefix.as_str()) {
                violations.push(format!(
                    "{}~{} bound to prefix '{}', expected {:?}",
                    entry.namespace,
                    partition.key(),
                    partition.config().stream_key_prefix,
                    expected
                ));
            }
        }

        self.result.invariant_violations.extend(violations);
    }

    fn violation(&mut self, message: String) {
        self.result.invariant_violations.push(message);
    }

    pub fn result(&self) -> &DirectoryDSTResult {
        &self.result
    }

    pub fn into_result(self) -> DirectoryDSTResult {
        self.result
    }
}

/// Run a batch of directory DST tests with different seeds
pub fn run_directory_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> DirectoryDSTConfig,
) -> Vec<DirectoryDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let mut harness = DirectoryDSTHarness::new(config_fn(base_seed + i as u64));
        harness.run(ops_per_run);
        harness.check_invariants();
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_directory_batch(results: &[DirectoryDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_restarts: u64 = results.iter().map(|r| r.restarts).sum();

    let mut summary = format!(
        "Directory DST Batch: {}/{} passed, {} total ops, {} restarts",
        passed, total, total_ops, total_restarts
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
        if let Some(first_failure) = results.iter().find(|r| !r.is_success()) {
            summary.push_str(&format!(
                "\nFirst failure violations:\n  {}",
                first_failure.invariant_violations.join("\n  ")
            ));
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_dst_in_memory() {
        let mut harness = DirectoryDSTHarness::new(DirectoryDSTConfig::new(42));
        harness.run(500);
        harness.check_invariants();

        let result = harness.result();
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert!(result.creates > 0);
        println!("{}", result.summary());
    }

    #[test]
    fn test_directory_dst_deterministic() {
        let mut a = DirectoryDSTHarness::new(DirectoryDSTConfig::restart_heavy(7));
        a.run(200);
        let mut b = DirectoryDSTHarness::new(DirectoryDSTConfig::restart_heavy(7));
        b.run(200);

        assert_eq!(a.result().creates, b.result().creates);
        assert_eq!(a.result().restarts, b.result().restarts);
    }

    #[test]
    fn test_directory_dst_batch_restart_heavy() {
        let results = run_directory_dst_batch(100, 10, 200, DirectoryDSTConfig::restart_heavy);
        let summary = summarize_directory_batch(&results);
        println!("{}", summary);
        assert!(results.iter().all(|r| r.is_success()), "{}", summary);
        assert!(results.iter().map(|r| r.restarts).sum::<u64>() > 0);
    }

    #[test]
    fn test_expected_prefix_is_longest_match() {
        assert_eq!(
            DirectoryDSTHarness::expected_prefix("metrics", "cpu.user.0"),
            Some("cpu.user")
        );
        assert_eq!(DirectoryDSTHarness::expected_prefix("metrics", "disk.io"), Some(""));
        assert_eq!(DirectoryDSTHarness::expected_prefix("logs", "disk.io"), None);
    }
}
