//! Write-back overlay over a [`KeyValueStore`].
//!
//! Writes stay in memory until [`WriteCache::flush`] commits them as one batch.
//! Reads see pending writes first, so a block insert can read back what an
//! earlier insert in the same cycle wrote.

use std::collections::BTreeMap;

use exploder_storage::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch};

type PendingKey = (Column, Vec<u8>);

pub struct WriteCache<S> {
    store: S,
    pending: BTreeMap<PendingKey, Option<Vec<u8>>>,
}

impl<S> WriteCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn put(&mut self, column: Column, key: &[u8], value: impl Into<Vec<u8>>) {
        self.pending
            .insert((column, key.to_vec()), Some(value.into()));
    }

    pub fn delete(&mut self, column: Column, key: &[u8]) {
        self.pending.insert((column, key.to_vec()), None);
    }

    /// Drops every pending write.
    pub fn discard(&mut self) {
        self.pending.clear();
    }
}

impl<S: KeyValueStore> WriteCache<S> {
    pub fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(entry) = self.pending.get(&(column, key.to_vec())) {
            return Ok(entry.clone());
        }
        self.store.get(column, key)
    }

    pub fn contains(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(column, key)?.is_some())
    }

    /// Store entries merged with pending writes, ordered by key.
    pub fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.store.scan_prefix(column, prefix)?.into_iter().collect();
        let start = (column, prefix.to_vec());
        for ((pending_column, key), value) in self.pending.range(start..) {
            if *pending_column != column || !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Commits pending writes in one batch and returns how many were written.
    pub fn flush(&mut self) -> Result<usize, StoreError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        batch.reserve(self.pending.len());
        for ((column, key), value) in &self.pending {
            match value {
                Some(value) => batch.put(*column, key.as_slice(), value.as_slice()),
                None => batch.delete(*column, key.as_slice()),
            }
        }
        self.store.write_batch(&batch)?;
        let written = self.pending.len();
        self.pending.clear();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use exploder_storage::memory::MemoryStore;

    use super::*;

    #[test]
    fn reads_see_pending_writes() {
        let store = Arc::new(MemoryStore::new());
        store.put(Column::Meta, b"a", b"old").unwrap();
        store.put(Column::Meta, b"b", b"gone").unwrap();
        let mut cache = WriteCache::new(Arc::clone(&store));
        cache.put(Column::Meta, b"a", b"new".to_vec());
        cache.put(Column::Meta, b"c", b"added".to_vec());
        cache.delete(Column::Meta, b"b");

        assert_eq!(cache.get(Column::Meta, b"a").unwrap(), Some(b"new".to_vec()));
        assert_eq!(cache.get(Column::Meta, b"b").unwrap(), None);
        let keys: Vec<Vec<u8>> = cache
            .scan_prefix(Column::Meta, b"")
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(store.get(Column::Meta, b"a").unwrap(), Some(b"old".to_vec()));
    }

    #[test]
    fn flush_commits_and_discard_drops() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = WriteCache::new(Arc::clone(&store));
        cache.put(Column::Tx, b"k1", vec![1]);
        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(store.get(Column::Tx, b"k1").unwrap(), Some(vec![1]));

        cache.put(Column::Tx, b"k2", vec![2]);
        cache.discard();
        assert_eq!(cache.pending_len(), 0);
        assert_eq!(cache.get(Column::Tx, b"k2").unwrap(), None);
        assert_eq!(cache.flush().unwrap(), 0);
    }

    #[test]
    fn scan_stays_inside_column_and_prefix() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = WriteCache::new(Arc::clone(&store));
        cache.put(Column::Output, b"ab1", vec![0]);
        cache.put(Column::Output, b"ac1", vec![0]);
        cache.put(Column::Spender, b"ab2", vec![]);
        let scanned = cache.scan_prefix(Column::Output, b"ab").unwrap();
        assert_eq!(scanned, vec![(b"ab1".to_vec(), vec![0])]);
    }
}
