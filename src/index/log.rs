//! Index Data File - Record Format, Replay, Append, Rewrite
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (16 bytes)                │
//! │ - magic: "TIDX" (4 bytes)        │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - reserved: 2 bytes              │
//! │ - generation: u64 LE             │
//! ├──────────────────────────────────┤
//! │ Record 0                         │
//! │ - op: u8 (1=put 2=delete 3=commit)│
//! │ - key_length: u32 LE             │
//! │ - value_length: u32 LE           │
//! │ - checksum: u32 LE (CRC32)       │
//! │ - key: [u8; key_length]          │
//! │ - value: [u8; value_length]      │
//! ├──────────────────────────────────┤
//! │ Record 1 ...                     │
//! └──────────────────────────────────┘
//! ```
//!
//! A transaction is a run of put/delete records closed by a commit record.
//! Replay applies a run only once its commit record has been read, and stops
//! at the first truncated or corrupt record. Everything after the last
//! commit record is a torn tail from an unclean shutdown.

use super::{IndexError, IndexMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Index file magic number
pub const INDEX_MAGIC: [u8; 4] = *b"TIDX";
/// Current index format version
pub const INDEX_VERSION: u8 = 1;
/// Header size in bytes
pub const INDEX_HEADER_SIZE: usize = 16;
/// Record overhead: op(1) + key_length(4) + value_length(4) + checksum(4)
pub const RECORD_OVERHEAD: usize = 13;

/// Record operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOp {
    Put = 1,
    Delete = 2,
    Commit = 3,
}

impl RecordOp {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordOp::Put),
            2 => Some(RecordOp::Delete),
            3 => Some(RecordOp::Commit),
            _ => None,
        }
    }
}

/// A single framed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub op: RecordOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl IndexRecord {
    pub fn put(key: &[u8], value: &[u8]) -> Self {
        IndexRecord {
            op: RecordOp::Put,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    pub fn delete(key: &[u8]) -> Self {
        IndexRecord {
            op: RecordOp::Delete,
            key: key.to_vec(),
            value: Vec::new(),
        }
    }

    pub fn commit() -> Self {
        IndexRecord {
            op: RecordOp::Commit,
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    fn checksum(op: u8, key: &[u8], value: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[op]);
        hasher.update(key);
        hasher.update(value);
        hasher.finalize()
    }

    /// Append the encoded record to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        let op = self.op as u8;

        buf.push(op);
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&Self::checksum(op, &self.key, &self.value).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        debug_assert_eq!(
            buf.len() - start,
            RECORD_OVERHEAD + self.key.len() + self.value.len(),
            "Postcondition: encoded size must match expected"
        );
    }

    /// Decode a record from bytes. Returns None if truncated or corrupt.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < RECORD_OVERHEAD {
            return None;
        }

        let op_byte = data[0];
        let op = RecordOp::from_u8(op_byte)?;
        let key_len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
        let value_len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
        let checksum = u32::from_le_bytes([data[9], data[10], data[11], data[12]]);

        let total = RECORD_OVERHEAD.checked_add(key_len)?.checked_add(value_len)?;
        if data.len() < total {
            return None; // Truncated record
        }

        let key = &data[RECORD_OVERHEAD..RECORD_OVERHEAD + key_len];
        let value = &data[RECORD_OVERHEAD + key_len..total];
        if Self::checksum(op_byte, key, value) != checksum {
            return None; // Corrupted record
        }

        Some((
            IndexRecord {
                op,
                key: key.to_vec(),
                value: value.to_vec(),
            },
            total,
        ))
    }
}

fn encode_header(generation: u64) -> [u8; INDEX_HEADER_SIZE] {
    let mut header = [0u8; INDEX_HEADER_SIZE];
    header[0..4].copy_from_slice(&INDEX_MAGIC);
    header[4] = INDEX_VERSION;
    header[5] = 0; // flags
    // header[6..8] reserved
    header[8..16].copy_from_slice(&generation.to_le_bytes());
    header
}

/// Result of replaying a data file
#[derive(Debug)]
pub struct ReplayResult {
    /// Committed contents
    pub map: IndexMap,
    /// Header generation
    pub generation: u64,
    /// Byte offset just past the last commit record
    pub valid_len: u64,
    /// Number of transactions applied
    pub transactions: u64,
}

/// Replay a complete data file image.
///
/// Fails only on a bad header; torn or corrupt records end the replay.
pub fn replay(data: &[u8]) -> Result<ReplayResult, IndexError> {
    if data.len() < INDEX_HEADER_SIZE {
        return Err(IndexError::Corruption(format!(
            "index file too short for header: {} bytes",
            data.len()
        )));
    }
    if data[0..4] != INDEX_MAGIC {
        return Err(IndexError::Corruption("bad index magic".to_string()));
    }
    if data[4] != INDEX_VERSION {
        return Err(IndexError::Corruption(format!(
            "unsupported index version {}",
            data[4]
        )));
    }
    let generation = u64::from_le_bytes([
        data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
    ]);

    let mut map = IndexMap::new();
    let mut batch: Vec<IndexRecord> = Vec::new();
    let mut offset = INDEX_HEADER_SIZE;
    let mut valid_len = INDEX_HEADER_SIZE;
    let mut transactions = 0u64;

    while offset < data.len() {
        let Some((record, size)) = IndexRecord::decode(&data[offset..]) else {
            break;
        };
        offset += size;

        match record.op {
            RecordOp::Put | RecordOp::Delete => batch.push(record),
            RecordOp::Commit => {
                for r in batch.drain(..) {
                    match r.op {
                        RecordOp::Put => {
                            map.insert(r.key, r.value);
                        }
                        RecordOp::Delete => {
                            map.remove(&r.key);
                        }
                        RecordOp::Commit => {}
                    }
                }
                transactions += 1;
                valid_len = offset;
            }
        }
    }

    debug_assert!(valid_len <= data.len(), "Postcondition: valid_len within file");

    Ok(ReplayResult {
        map,
        generation,
        valid_len: valid_len as u64,
        transactions,
    })
}

/// Append handle on the index data file
#[derive(Debug)]
pub struct IndexLog {
    path: PathBuf,
    file: File,
    size: u64,
    generation: u64,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
}

impl IndexLog {
    /// Open (or create) the data file for writing and replay it.
    ///
    /// A torn tail left by a crash is cut off before the first new append.
    pub fn open(path: &Path) -> Result<(Self, ReplayResult), IndexError> {
        let existing = match std::fs::read(path) {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(IndexError::Io(e)),
        };

        let replayed = match existing {
            Some(data) if !data.is_empty() => {
                let replayed = replay(&data)?;
                if replayed.valid_len < data.len() as u64 {
                    warn!(
                        "Index {} has {} trailing bytes after last commit; truncating",
                        path.display(),
                        data.len() as u64 - replayed.valid_len
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(replayed.valid_len)?;
                    file.sync_all()?;
                }
                replayed
            }
            _ => {
                let mut file = File::create(path)?;
                file.write_all(&encode_header(0))?;
                file.sync_all()?;
                ReplayResult {
                    map: IndexMap::new(),
                    generation: 0,
                    valid_len: INDEX_HEADER_SIZE as u64,
                    transactions: 0,
                }
            }
        };

        let file = OpenOptions::new().append(true).open(path)?;
        let log = IndexLog {
            path: path.to_path_buf(),
            file,
            size: replayed.valid_len,
            generation: replayed.generation,
            poisoned: false,
        };
        Ok((log, replayed))
    }

    /// Append one committed transaction and fsync it.
    ///
    /// The file always ends at the last acknowledged commit: stray bytes past
    /// it are cut before writing, and a failed write is rolled back. If the
    /// rollback itself fails the log refuses every later append.
    pub fn append_transaction(&mut self, records: &[IndexRecord]) -> Result<(), IndexError> {
        debug_assert!(
            records.iter().all(|r| r.op != RecordOp::Commit),
            "Precondition: commit record is appended by the log itself"
        );

        if self.poisoned {
            return Err(IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("index log {} poisoned by an earlier failed append", self.path.display()),
            )));
        }

        let on_disk = self.file.metadata()?.len();
        if on_disk != self.size {
            warn!(
                "Index {} is {} bytes, expected {}; truncating to last commit",
                self.path.display(),
                on_disk,
                self.size
            );
            self.truncate_to_size()?;
        }

        let mut buf = Vec::new();
        for record in records {
            record.encode_into(&mut buf);
        }
        IndexRecord::commit().encode_into(&mut buf);

        let written = self.file.write_all(&buf).and_then(|()| {
            self.file
                .sync_all()
                .map_err(|e| std::io::Error::new(e.kind(), format!("fsync: {}", e)))
        });
        if let Err(e) = written {
            if let Err(rollback) = self.truncate_to_size() {
                error!(
                    "Index {} rollback after failed append failed: {}",
                    self.path.display(),
                    rollback
                );
            }
            return Err(IndexError::Io(e));
        }

        self.size = self.size.saturating_add(buf.len() as u64);
        Ok(())
    }

    /// Cut the file back to the last acknowledged commit, poisoning the log
    /// on failure
    fn truncate_to_size(&mut self) -> Result<(), IndexError> {
        let result = self.file.set_len(self.size).and_then(|()| self.file.sync_all());
        if let Err(e) = result {
            self.poisoned = true;
            return Err(IndexError::Io(e));
        }
        Ok(())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Replace the file with a compact image of `map`.
    ///
    /// Written to a sibling temp file, synced, then renamed into place.
    pub fn rewrite(&mut self, map: &IndexMap) -> Result<(), IndexError> {
        let generation = self.generation.wrapping_add(1);
        let tmp_path = self.path.with_extension("rewrite");

        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_header(generation));
        for (key, value) in map {
            IndexRecord::put(key, value).encode_into(&mut buf);
        }
        IndexRecord::commit().encode_into(&mut buf);

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        // The old handle now points at the unlinked file
        self.file = match OpenOptions::new().append(true).open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                self.poisoned = true;
                return Err(IndexError::Io(e));
            }
        };
        let old_size = self.size;
        self.size = buf.len() as u64;
        self.generation = generation;

        info!(
            "Rewrote index {} (generation {}): {} -> {} bytes",
            self.path.display(),
            generation,
            old_size,
            self.size
        );
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
