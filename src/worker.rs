//! Background Worker Pools
//!
//! Each pool owns `count` named OS threads running the same loop:
//!
//! ```text
//! loop {
//!     snapshot = directory.partitions()      // lock released here
//!     for p in snapshot {
//!         if stopping { return }
//!         kind.run(p)                          // failure: warn + count
//!     }
//!     sleep(pass_interval) or wake on stop
//! }
//! ```
//!
//! Stop is cooperative: the flag is checked between partitions, and the wake
//! channel's sender is dropped so sleeping workers return immediately. A
//! partition operation already in progress runs to completion.

use crate::context::NodeContext;
use crate::directory::PartitionDirectory;
use crate::partition::{Partition, PartitionError, PartitionFactory};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Which maintenance operation a pool runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Compaction,
    Replication,
}

impl WorkerKind {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerKind::Compaction => "compaction",
            WorkerKind::Replication => "replication",
        }
    }

    fn run<P: Partition>(&self, partition: &P, ctx: &NodeContext) -> Result<(), PartitionError> {
        match self {
            WorkerKind::Compaction => partition.compact(ctx),
            WorkerKind::Replication => partition.replicate(ctx),
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Counters shared by every thread of one pool
#[derive(Debug, Default)]
pub struct WorkerStats {
    passes: AtomicU64,
    operations: AtomicU64,
    failures: AtomicU64,
}

impl WorkerStats {
    /// Completed passes over the directory, summed across threads
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Partition operations attempted
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Partition operations that returned an error
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

struct Worker<F: PartitionFactory> {
    kind: WorkerKind,
    id: usize,
    directory: Arc<PartitionDirectory<F>>,
    ctx: NodeContext,
    pass_interval: Duration,
    stop: Arc<AtomicBool>,
    wake: Receiver<()>,
    stats: Arc<WorkerStats>,
}

impl<F: PartitionFactory> Worker<F> {
    fn run(self) {
        debug!("{} worker {} started", self.kind, self.id);

        'passes: loop {
            let snapshot = self.directory.partitions();

            for partition in &snapshot {
                if self.stop.load(Ordering::Acquire) {
                    break 'passes;
                }
                self.stats.operations.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.kind.run(&**partition, &self.ctx) {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "{} of partition {}~{} failed: {}",
                        self.kind,
                        partition.namespace(),
                        partition.key(),
                        e
                    );
                }
            }
            self.stats.passes.fetch_add(1, Ordering::Relaxed);

            if self.stop.load(Ordering::Acquire) {
                break;
            }
            match self.wake.recv_timeout(self.pass_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }

        debug!("{} worker {} stopped", self.kind, self.id);
    }
}

/// A running set of maintenance threads
pub struct WorkerPool {
    kind: WorkerKind,
    stop: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    /// Spawn `count` threads named `<kind>-worker-<n>`.
    ///
    /// If a spawn fails, the threads already running are stopped before the
    /// error is returned.
    pub fn start<F: PartitionFactory>(
        kind: WorkerKind,
        count: usize,
        directory: Arc<PartitionDirectory<F>>,
        ctx: NodeContext,
        pass_interval: Duration,
    ) -> std::io::Result<Self> {
        let (wake_tx, wake_rx) = channel::bounded::<()>(0);
        let mut pool = WorkerPool {
            kind,
            stop: Arc::new(AtomicBool::new(false)),
            wake: Some(wake_tx),
            handles: Vec::with_capacity(count),
            stats: Arc::new(WorkerStats::default()),
        };

        for id in 0..count {
            let worker = Worker {
                kind,
                id,
                directory: Arc::clone(&directory),
                ctx: ctx.clone(),
                pass_interval,
                stop: Arc::clone(&pool.stop),
                wake: wake_rx.clone(),
                stats: Arc::clone(&pool.stats),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("{}-worker-{}", kind, id))
                .spawn(move || worker.run());

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    error!("Failed to spawn {} worker {}: {}", kind, id, e);
                    pool.stop();
                    return Err(e);
                }
            }
        }

        info!("Started {} {} workers", count, kind);
        Ok(pool)
    }

    /// Signal every thread and join them. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Disconnects the channel: every sleeping worker wakes at once
        self.wake.take();

        let joined = self.handles.len();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!("{} panicked; partition maintenance on it was abandoned", name);
            }
        }

        if joined > 0 {
            info!(
                "Stopped {} {} workers ({} passes, {} failures)",
                joined,
                self.kind,
                self.stats.passes(),
                self.stats.failures()
            );
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Threads still attached to the pool
    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("kind", &self.kind)
            .field("threads", &self.handles.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::key::PartitionKey;
    use crate::partition::PartitionStateRecord;
    use crate::resolver::ConfigResolver;
    use std::time::Instant;

    /// Partition whose behavior is chosen by its stream key
    #[derive(Debug)]
    struct ProbePartition {
        namespace: String,
        key: PartitionKey,
        stream_key: String,
        config: Arc<StreamConfig>,
        calls: AtomicU64,
    }

    impl ProbePartition {
        fn step(&self) -> Result<(), PartitionError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.stream_key.starts_with("fail") {
                return Err(PartitionError::Other("injected".to_string()));
            }
            if self.stream_key.starts_with("slow") {
                std::thread::sleep(Duration::from_millis(20));
            }
            if self.stream_key.starts_with("panic") {
                panic!("injected panic");
            }
            Ok(())
        }
    }

    impl Partition for ProbePartition {
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
            self.step()
        }
        fn replicate(&self, _ctx: &NodeContext) -> Result<(), PartitionError> {
            self.step()
        }
    }

    struct ProbeState(String);

    impl PartitionStateRecord for ProbeState {
        fn stream_key(&self) -> &str {
            &self.0
        }
    }

    struct ProbeFactory;

    impl PartitionFactory for ProbeFactory {
        type Partition = ProbePartition;
        type State = ProbeState;

        fn decode_state(&self, value: &[u8]) -> Result<ProbeState, PartitionError> {
            Ok(ProbeState(String::from_utf8_lossy(value).into_owned()))
        }

        fn reopen(
            &self,
            namespace: &str,
            key: PartitionKey,
            state: ProbeState,
            config: Arc<StreamConfig>,
            ctx: &NodeContext,
        ) -> Result<ProbePartition, PartitionError> {
            self.create(namespace, key, &state.0, config, ctx)
        }

        fn create(
            &self,
            namespace: &str,
            key: PartitionKey,
            stream_key: &str,
            config: Arc<StreamConfig>,
            _ctx: &NodeContext,
        ) -> Result<ProbePartition, PartitionError> {
            Ok(ProbePartition {
                namespace: namespace.to_string(),
                key,
                stream_key: stream_key.to_string(),
                config,
                calls: AtomicU64::new(0),
            })
        }
    }

    fn directory(ctx: &NodeContext, streams: &[&str]) -> Arc<PartitionDirectory<ProbeFactory>> {
        let resolver = Arc::new(ConfigResolver::new());
        resolver.configure_prefix("ns", StreamConfig::test(""));
        let dir = Arc::new(PartitionDirectory::new(ProbeFactory, resolver));
        dir.recover(ctx).unwrap();
        for (i, stream) in streams.iter().enumerate() {
            let key = PartitionKey::digest(&(i as u32).to_le_bytes());
            dir.get_or_create("ns", stream, &key, ctx).unwrap();
        }
        dir
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_failing_partition_does_not_stop_pass() {
        let ctx = NodeContext::in_memory();
        let dir = directory(&ctx, &["ok-1", "fail-1", "ok-2"]);

        let mut pool = WorkerPool::start(
            WorkerKind::Compaction,
            1,
            Arc::clone(&dir),
            ctx,
            Duration::from_millis(10),
        )
        .unwrap();

        let stats = Arc::clone(pool.stats());
        assert!(wait_for(|| stats.passes() >= 2));
        pool.stop();

        assert!(stats.failures() >= 2);
        for partition in dir.partitions() {
            assert!(partition.calls.load(Ordering::Relaxed) >= 2);
        }
    }

    #[test]
    fn test_stop_wakes_sleeping_workers() {
        let ctx = NodeContext::in_memory();
        let dir = directory(&ctx, &["ok"]);

        let mut pool = WorkerPool::start(
            WorkerKind::Replication,
            3,
            dir,
            ctx,
            Duration::from_secs(3600),
        )
        .unwrap();
        assert_eq!(pool.thread_count(), 3);

        let stats = Arc::clone(pool.stats());
        assert!(wait_for(|| stats.passes() >= 3));

        let started = Instant::now();
        pool.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn test_stop_between_partitions() {
        let ctx = NodeContext::in_memory();
        let streams: Vec<String> = (0..50).map(|i| format!("slow-{}", i)).collect();
        let refs: Vec<&str> = streams.iter().map(String::as_str).collect();
        let dir = directory(&ctx, &refs);

        let mut pool = WorkerPool::start(
            WorkerKind::Compaction,
            1,
            Arc::clone(&dir),
            ctx,
            Duration::from_millis(10),
        )
        .unwrap();

        let stats = Arc::clone(pool.stats());
        assert!(wait_for(|| stats.operations() >= 1));
        pool.stop();

        // The pass was abandoned part-way through
        assert!(stats.operations() < 50);
        assert_eq!(stats.passes(), 0);
    }

    #[test]
    fn test_panicking_worker_reported_at_join() {
        let ctx = NodeContext::in_memory();
        let dir = directory(&ctx, &["panic"]);

        let mut pool = WorkerPool::start(
            WorkerKind::Compaction,
            1,
            Arc::clone(&dir),
            ctx,
            Duration::from_millis(10),
        )
        .unwrap();

        assert!(wait_for(|| dir.partitions()[0].calls.load(Ordering::Relaxed) >= 1));
        pool.stop();
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn test_empty_directory_keeps_passing() {
        let ctx = NodeContext::in_memory();
        let dir = directory(&ctx, &[]);

        let pool = WorkerPool::start(
            WorkerKind::Compaction,
            2,
            dir,
            ctx,
            Duration::from_millis(10),
        )
        .unwrap();
        let stats = Arc::clone(pool.stats());
        assert!(wait_for(|| stats.passes() >= 4));
        assert_eq!(stats.operations(), 0);
        drop(pool);
    }
}
