//! Partition Keys and Composite Index Keys
//!
//! ## Key Layout
//!
//! ```text
//! ┌──────────────────────┬──────┬──────────────────────────┐
//! │ namespace (UTF-8)    │ 0x7E │ partition key (20 bytes) │
//! └──────────────────────┴──────┴──────────────────────────┘
//! ```
//!
//! The same byte layout is used for the in-memory registry and for index
//! rows. Keys that begin with `0x1B` belong to the metadata key space and
//! never name a partition.

use sha1::{Digest, Sha1};
use std::fmt;
use std::time::Duration;

/// Separator between namespace and partition key (`~`)
pub const NAMESPACE_SEPARATOR: u8 = b'~';
/// First byte of every reserved metadata key
pub const METADATA_MARKER: u8 = 0x1B;
/// Length of a partition key (SHA-1 digest)
pub const PARTITION_KEY_LEN: usize = 20;

/// Content identifier naming a partition within a namespace
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey([u8; PARTITION_KEY_LEN]);

impl PartitionKey {
    pub fn new(bytes: [u8; PARTITION_KEY_LEN]) -> Self {
        PartitionKey(bytes)
    }

    /// Build a key from raw bytes. Returns None unless exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; PARTITION_KEY_LEN] = bytes.try_into().ok()?;
        Some(PartitionKey(arr))
    }

    /// SHA-1 of arbitrary bytes
    pub fn digest(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        let mut arr = [0u8; PARTITION_KEY_LEN];
        arr.copy_from_slice(&hash);
        PartitionKey(arr)
    }

    /// Derive the key of the partition holding `timestamp_ms` for a stream.
    ///
    /// Timestamps are bucketed by `window`; every point of a stream that
    /// falls into the same bucket maps to the same partition.
    pub fn for_stream(
        namespace: &str,
        stream_key: &str,
        window: Duration,
        timestamp_ms: u64,
    ) -> Self {
        let window_ms = (window.as_millis() as u64).max(1);
        let bucket = timestamp_ms / window_ms * window_ms;

        let mut hasher = Sha1::new();
        hasher.update(namespace.as_bytes());
        hasher.update([NAMESPACE_SEPARATOR]);
        hasher.update(stream_key.as_bytes());
        hasher.update([NAMESPACE_SEPARATOR]);
        hasher.update(bucket.to_be_bytes());
        let hash = hasher.finalize();

        let mut arr = [0u8; PARTITION_KEY_LEN];
        arr.copy_from_slice(&hash);
        PartitionKey(arr)
    }

    pub fn as_bytes(&self) -> &[u8; PARTITION_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(PARTITION_KEY_LEN * 2);
        for b in self.0 {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionKey({})", self.to_hex())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Encode `namespace ~ partition_key` as raw bytes
pub fn composite_key(namespace: &str, key: &PartitionKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(namespace.len() + 1 + PARTITION_KEY_LEN);
    out.extend_from_slice(namespace.as_bytes());
    out.push(NAMESPACE_SEPARATOR);
    out.extend_from_slice(key.as_bytes());

    debug_assert_eq!(
        out.len(),
        namespace.len() + 1 + PARTITION_KEY_LEN,
        "Postcondition: composite key length"
    );
    out
}

/// Split an index key at the first separator into (namespace, key bytes).
///
/// Returns None when the key has no separator.
pub fn split_composite_key(key: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = memchr::memchr(NAMESPACE_SEPARATOR, key)?;
    Some((&key[..pos], &key[pos + 1..]))
}

/// True for keys in the reserved metadata key space
pub fn is_metadata_key(key: &[u8]) -> bool {
    key.first() == Some(&METADATA_MARKER)
}

/// Build a metadata key (`0x1B` followed by `name`)
pub fn metadata_key(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 1);
    out.push(METADATA_MARKER);
    out.extend_from_slice(name.as_bytes());
    out
}

/// A namespace is usable only if its rows can be split back apart on recovery
pub fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.as_bytes().contains(&NAMESPACE_SEPARATOR)
        && namespace.as_bytes().first() != Some(&METADATA_MARKER)
}
