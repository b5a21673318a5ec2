//! Node Lifecycle Integration Tests
//!
//! Full start / create / stop / reopen cycles over a file-backed index.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tsdb_node::config::{NamespaceConfig, NodeConfig, StreamConfig};
use tsdb_node::partition::{PartitionError, PartitionStateRecord};
use tsdb_node::{
    IndexError, IndexedPartitionFactory, NodeContext, NodeError, Partition, PartitionFactory,
    PartitionKey, TsdbNode,
};

fn config(dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::test(dir.path().to_path_buf());
    config.namespaces = vec![NamespaceConfig {
        name: "ns1".to_string(),
        streams: vec![StreamConfig::test("events"), StreamConfig::test("metrics")],
    }];
    config
}

#[test]
fn test_partitions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let keys: Vec<PartitionKey> = (0..10u32)
        .map(|i| PartitionKey::digest(&i.to_le_bytes()))
        .collect();

    {
        let node = TsdbNode::from_config(&config, IndexedPartitionFactory).unwrap();
        let stats = node.start(1, 1).unwrap();
        assert_eq!(stats.partitions_recovered, 0);

        for (i, key) in keys.iter().enumerate() {
            let stream = if i % 2 == 0 { "events-a" } else { "metrics.cpu" };
            node.find_or_create_partition("ns1", stream, key).unwrap();
        }
        node.stop().unwrap();
    }

    let node = TsdbNode::from_config(&config, IndexedPartitionFactory).unwrap();
    let stats = node.start(1, 1).unwrap();
    assert_eq!(stats.partitions_recovered, keys.len());

    for (i, key) in keys.iter().enumerate() {
        let partition = node.directory().get("ns1", key).unwrap();
        let expected = if i % 2 == 0 { "events" } else { "metrics" };
        assert_eq!(partition.config().stream_key_prefix, expected);
    }
    node.stop().unwrap();
}

#[test]
fn test_second_node_on_same_dir_is_locked() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let _first = TsdbNode::from_config(&config, IndexedPartitionFactory).unwrap();
    let second = TsdbNode::from_config(&config, IndexedPartitionFactory);
    assert!(matches!(
        second,
        Err(NodeError::Index(IndexError::Locked(_)))
    ));
}

#[test]
fn test_unresolvable_stored_partition_fails_start() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    {
        let node = TsdbNode::from_config(&config, IndexedPartitionFactory).unwrap();
        node.start(0, 0).unwrap();
        node.find_or_create_partition("ns1", "metrics.mem", &PartitionKey::digest(b"m"))
            .unwrap();
        node.stop().unwrap();
    }

    // Restart without the "metrics" prefix
    let mut narrowed = config.clone();
    narrowed.namespaces[0].streams.retain(|s| s.stream_key_prefix != "metrics");
    let node = TsdbNode::from_config(&narrowed, IndexedPartitionFactory).unwrap();

    assert!(matches!(node.start(1, 1), Err(NodeError::Directory(_))));
    assert!(!node.is_started());
    assert!(node.directory().is_empty());
}

#[test]
fn test_workers_compact_recovered_partitions() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let node = TsdbNode::from_config(&config, IndexedPartitionFactory).unwrap();
    node.start(2, 1).unwrap();
    let partition = node
        .find_or_create_partition("ns1", "events", &PartitionKey::digest(b"p"))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while partition.state().compaction_generation == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(partition.state().compaction_generation > 0);

    let (compaction, _) = node.worker_stats().unwrap();
    assert!(compaction.operations() > 0);
    node.stop().unwrap();
}

/// Partition whose compaction takes 100ms
struct GatedPartition {
    namespace: String,
    key: PartitionKey,
    stream_key: String,
    config: Arc<StreamConfig>,
    started: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
}

impl Partition for GatedPartition {
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
    fn compact(&self, _ctx: &NodeContext) -> Result<(), PartitionError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn replicate(&self, _ctx: &NodeContext) -> Result<(), PartitionError> {
        Ok(())
    }
}

struct GatedState(String);

impl PartitionStateRecord for GatedState {
    fn stream_key(&self) -> &str {
        &self.0
    }
}

struct GatedFactory {
    started: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
}

impl PartitionFactory for GatedFactory {
    type Partition = GatedPartition;
    type State = GatedState;

    fn decode_state(&self, value: &[u8]) -> Result<GatedState, PartitionError> {
        Ok(GatedState(String::from_utf8_lossy(value).into_owned()))
    }

    fn reopen(
        &self,
        namespace: &str,
        key: PartitionKey,
        state: GatedState,
        config: Arc<StreamConfig>,
        ctx: &NodeContext,
    ) -> Result<GatedPartition, PartitionError> {
        self.create(namespace, key, &state.0, config, ctx)
    }

    fn create(
        &self,
        namespace: &str,
        key: PartitionKey,
        stream_key: &str,
        config: Arc<StreamConfig>,
        _ctx: &NodeContext,
    ) -> Result<GatedPartition, PartitionError> {
        Ok(GatedPartition {
            namespace: namespace.to_string(),
            key,
            stream_key: stream_key.to_string(),
            config,
            started: Arc::clone(&self.started),
            completed: Arc::clone(&self.completed),
        })
    }
}

#[test]
fn test_stop_waits_for_in_flight_compaction() {
    let started = Arc::new(AtomicU64::new(0));
    let completed = Arc::new(AtomicU64::new(0));
    let node = TsdbNode::new(
        NodeContext::in_memory(),
        GatedFactory {
            started: Arc::clone(&started),
            completed: Arc::clone(&completed),
        },
        Duration::from_millis(10),
    );
    node.configure_prefix("ns1", StreamConfig::test("")).unwrap();
    node.start(1, 0).unwrap();
    node.find_or_create_partition("ns1", "s", &PartitionKey::digest(b"g"))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while started.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(started.load(Ordering::SeqCst) > 0);

    // Every compaction that began has finished by the time stop returns
    node.stop().unwrap();
    assert_eq!(
        completed.load(Ordering::SeqCst),
        started.load(Ordering::SeqCst)
    );
}
