//! Index transactions and cursors

use super::{Index, IndexError, IndexMap, WriterState};
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// A transaction over a snapshot of the index.
///
/// Read-only transactions only pin a snapshot. Write transactions also hold
/// the writer lock and buffer changes until `commit`.
pub struct IndexTxn<'a> {
    snapshot: Arc<IndexMap>,
    writer: Option<(&'a Index, MutexGuard<'a, WriterState>)>,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> IndexTxn<'a> {
    pub(super) fn read(snapshot: Arc<IndexMap>) -> Self {
        IndexTxn {
            snapshot,
            writer: None,
            pending: BTreeMap::new(),
        }
    }

    pub(super) fn write(
        index: &'a Index,
        snapshot: Arc<IndexMap>,
        guard: MutexGuard<'a, WriterState>,
    ) -> Self {
        IndexTxn {
            snapshot,
            writer: Some((index, guard)),
            pending: BTreeMap::new(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.writer.is_none()
    }

    /// Look up a key, seeing this transaction's own uncommitted writes
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        match self.pending.get(key) {
            Some(Some(value)) => Some(value.as_slice()),
            Some(None) => None,
            None => self.snapshot.get(key).map(Vec::as_slice),
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        if self.is_read_only() {
            return Err(IndexError::ReadOnly);
        }
        self.pending.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), IndexError> {
        if self.is_read_only() {
            return Err(IndexError::ReadOnly);
        }
        self.pending.insert(key.to_vec(), None);
        Ok(())
    }

    /// Forward cursor over the transaction's snapshot.
    ///
    /// Uncommitted writes of this transaction are not visible to the cursor.
    pub fn cursor(&self) -> IndexCursor<'_> {
        IndexCursor {
            map: &self.snapshot,
            position: None,
        }
    }

    /// Make the buffered writes durable and visible. No-op for readers.
    pub fn commit(self) -> Result<(), IndexError> {
        let IndexTxn {
            snapshot,
            writer,
            pending,
        } = self;

        match writer {
            Some((index, mut guard)) => index.commit_changes(&mut guard, &snapshot, pending),
            None => Ok(()),
        }
    }

    /// Drop the transaction and everything it buffered
    pub fn abort(self) {}
}

impl std::fmt::Debug for IndexTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexTxn")
            .field("read_only", &self.is_read_only())
            .field("snapshot_rows", &self.snapshot.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Forward cursor in key order
#[derive(Debug)]
pub struct IndexCursor<'t> {
    map: &'t IndexMap,
    position: Option<&'t [u8]>,
}

impl<'t> IndexCursor<'t> {
    /// Position at the first key
    pub fn get_first(&mut self) -> Option<(&'t [u8], &'t [u8])> {
        let (key, value) = self.map.iter().next()?;
        self.position = Some(key.as_slice());
        Some((key.as_slice(), value.as_slice()))
    }

    /// Advance past the current key. Starts at the first key if unpositioned.
    pub fn get_next(&mut self) -> Option<(&'t [u8], &'t [u8])> {
        let Some(current) = self.position else {
            return self.get_first();
        };

        let (key, value) = self
            .map
            .range::<[u8], _>((Bound::Excluded(current), Bound::Unbounded))
            .next()?;
        self.position = Some(key.as_slice());
        Some((key.as_slice(), value.as_slice()))
    }

    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_walks_in_key_order() {
        let index = Index::in_memory();
        let mut txn = index.begin(false).unwrap();
        for key in [&b"c"[..], &b"a"[..], &b"b"[..]] {
            txn.put(key, b"v").unwrap();
        }
        txn.commit().unwrap();

        let txn = index.begin(true).unwrap();
        let mut cursor = txn.cursor();
        assert_eq!(cursor.get_first().map(|(k, _)| k), Some(&b"a"[..]));
        assert_eq!(cursor.get_next().map(|(k, _)| k), Some(&b"b"[..]));
        assert_eq!(cursor.get_next().map(|(k, _)| k), Some(&b"c"[..]));
        assert!(cursor.get_next().is_none());
        assert!(cursor.get_next().is_none());
    }

    #[test]
    fn test_cursor_on_empty_index() {
        let index = Index::in_memory();
        let txn = index.begin(true).unwrap();
        let mut cursor = txn.cursor();
        assert!(cursor.get_first().is_none());
        assert!(cursor.get_next().is_none());
    }

    #[test]
    fn test_txn_reads_own_writes() {
        let index = Index::in_memory();
        let mut txn = index.begin(false).unwrap();
        txn.put(b"k", b"v1").unwrap();
        assert_eq!(txn.get(b"k"), Some(&b"v1"[..]));
        txn.delete(b"k").unwrap();
        assert!(txn.get(b"k").is_none());
        txn.commit().unwrap();
        assert!(index.is_empty());
    }
}
