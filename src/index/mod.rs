//! Persistent Partition Index
//!
//! Transactional, ordered key-value store holding one row per known
//! partition plus a reserved metadata key space.
//!
//! ## Architecture
//!
//! ```text
//! begin(read_only) ──► IndexTxn ──► snapshot: Arc<BTreeMap>  (readers)
//!                          │
//!                          └─► writer lock ──► IndexLog (append + fsync)
//!                                   │
//!                                   └─► publish new snapshot on commit
//! ```
//!
//! Readers work on an immutable snapshot taken at `begin` and never block
//! writers. At most one write transaction exists at a time; it holds the
//! writer lock until commit or abort.
//!
//! Backends:
//! - in-memory (`Index::in_memory`): tests and DST
//! - file (`Index::open`): append-only record log plus an exclusive
//!   `fs2` lock on the lock file

pub mod log;
mod txn;

pub use log::{IndexLog, IndexRecord, RecordOp};
pub use txn::{IndexCursor, IndexTxn};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Error as IoError, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ordered committed contents of the index
pub type IndexMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Default data file name
pub const DEFAULT_DATA_FILE: &str = "index.db";
/// Default lock file name
pub const DEFAULT_LOCK_FILE: &str = "index.db.lck";
/// Default map size (1 GiB)
pub const DEFAULT_MAP_SIZE: u64 = 1024 * 1024 * 1024;
/// Data files smaller than this are never rewritten
const REWRITE_MIN_BYTES: u64 = 64 * 1024;

/// Error type for index operations
#[derive(Debug)]
pub enum IndexError {
    /// I/O error
    Io(IoError),
    /// Data file failed validation
    Corruption(String),
    /// Committed data would exceed the configured map size
    MapFull { used: u64, limit: u64 },
    /// Write attempted on a read-only index or transaction
    ReadOnly,
    /// Another open index holds the lock file
    Locked(PathBuf),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::Io(e) => write!(f, "index I/O error: {}", e),
            IndexError::Corruption(msg) => write!(f, "index corruption: {}", msg),
            IndexError::MapFull { used, limit } => {
                write!(f, "index map full: {} bytes needed, limit {}", used, limit)
            }
            IndexError::ReadOnly => write!(f, "index is read-only"),
            IndexError::Locked(path) => write!(f, "index locked: {}", path.display()),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<IoError> for IndexError {
    fn from(e: IoError) -> Self {
        IndexError::Io(e)
    }
}

/// State owned by the single writer
#[derive(Debug)]
pub(crate) struct WriterState {
    log: Option<IndexLog>,
}

/// The partition index
#[derive(Debug)]
pub struct Index {
    snapshot: RwLock<Arc<IndexMap>>,
    writer: Mutex<WriterState>,
    read_only: bool,
    map_size: u64,
    /// Exclusive lock held for the life of a writable file index
    _lock: Option<File>,
}

impl Index {
    /// Create an empty in-memory index
    pub fn in_memory() -> Self {
        Self::in_memory_with_map_size(DEFAULT_MAP_SIZE)
    }

    pub fn in_memory_with_map_size(map_size: u64) -> Self {
        Index {
            snapshot: RwLock::new(Arc::new(IndexMap::new())),
            writer: Mutex::new(WriterState { log: None }),
            read_only: false,
            map_size,
            _lock: None,
        }
    }

    /// Open the file-backed index in `dir`.
    ///
    /// A writable open creates `dir` if needed, takes the lock file, replays
    /// the data file and cuts off any torn tail. A read-only open replays the
    /// data file without touching either file.
    pub fn open(
        dir: &Path,
        read_only: bool,
        map_size: u64,
        data_file: &str,
        lock_file: &str,
    ) -> Result<Self, IndexError> {
        debug_assert!(!data_file.is_empty(), "Precondition: data file name");
        debug_assert!(map_size > 0, "Precondition: map size must be positive");

        let data_path = dir.join(data_file);

        if read_only {
            let data = std::fs::read(&data_path)?;
            let replayed = log::replay(&data)?;
            info!(
                "Opened index {} read-only: {} rows, {} transactions",
                data_path.display(),
                replayed.map.len(),
                replayed.transactions
            );
            return Ok(Index {
                snapshot: RwLock::new(Arc::new(replayed.map)),
                writer: Mutex::new(WriterState { log: None }),
                read_only: true,
                map_size,
                _lock: None,
            });
        }

        std::fs::create_dir_all(dir)?;
        let lock_path = dir.join(lock_file);
        let lock = acquire_lock_file(&lock_path)?;
        let (log, replayed) = IndexLog::open(&data_path)?;

        info!(
            "Opened index {}: {} rows, {} transactions, generation {}",
            data_path.display(),
            replayed.map.len(),
            replayed.transactions,
            replayed.generation
        );

        Ok(Index {
            snapshot: RwLock::new(Arc::new(replayed.map)),
            writer: Mutex::new(WriterState { log: Some(log) }),
            read_only: false,
            map_size,
            _lock: Some(lock),
        })
    }

    /// Start a transaction. Write transactions wait for the writer lock.
    pub fn begin(&self, read_only: bool) -> Result<IndexTxn<'_>, IndexError> {
        if !read_only && self.read_only {
            return Err(IndexError::ReadOnly);
        }

        if read_only {
            return Ok(IndexTxn::read(self.snapshot()));
        }

        let writer = self.writer.lock();
        // Snapshot after taking the writer lock so no commit can slip between
        Ok(IndexTxn::write(self, self.snapshot(), writer))
    }

    /// Current committed contents
    pub fn snapshot(&self) -> Arc<IndexMap> {
        self.snapshot.read().clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn map_size(&self) -> u64 {
        self.map_size
    }

    /// Number of committed rows
    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }

    /// Persist and publish a write transaction's changes
    pub(crate) fn commit_changes(
        &self,
        writer: &mut WriterState,
        base: &IndexMap,
        pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) -> Result<(), IndexError> {
        if pending.is_empty() {
            return Ok(());
        }

        let mut next = base.clone();
        let mut records = Vec::with_capacity(pending.len());
        for (key, value) in pending {
            match value {
                Some(value) => {
                    records.push(IndexRecord::put(&key, &value));
                    next.insert(key, value);
                }
                None => {
                    records.push(IndexRecord::delete(&key));
                    next.remove(&key);
                }
            }
        }

        let used = live_bytes(&next);
        if used > self.map_size {
            return Err(IndexError::MapFull {
                used,
                limit: self.map_size,
            });
        }

        if let Some(log) = writer.log.as_mut() {
            log.append_transaction(&records)?;
        }

        let next = Arc::new(next);
        *self.snapshot.write() = Arc::clone(&next);
        debug!("Committed {} index records", records.len());

        if let Some(log) = writer.log.as_mut() {
            if log.size() > REWRITE_MIN_BYTES && log.size() > used.saturating_mul(2) {
                // The commit is already durable; a failed rewrite leaves the old file valid
                if let Err(e) = log.rewrite(&next) {
                    warn!("Index rewrite failed: {}", e);
                }
            }
        }

        Ok(())
    }
}

fn live_bytes(map: &IndexMap) -> u64 {
    map.iter()
        .map(|(k, v)| (k.len() + v.len() + log::RECORD_OVERHEAD) as u64)
        .sum()
}

/// Open the lock file and hold an exclusive OS lock on it.
///
/// The lock lives as long as the returned handle and is released by the OS
/// when the owning process exits, cleanly or not.
fn acquire_lock_file(path: &Path) -> Result<File, IndexError> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    if let Err(e) = file.try_lock_exclusive() {
        if e.kind() == fs2::lock_contended_error().kind() {
            return Err(IndexError::Locked(path.to_path_buf()));
        }
        return Err(IndexError::Io(e));
    }

    // Owner pid is informational only; the OS lock is authoritative
    file.set_len(0)?;
    file.write_all(std::process::id().to_string().as_bytes())?;
    Ok(file)
}
