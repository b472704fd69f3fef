//! In-process backend used by tests and `backend=memory`.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in `column`.
    pub fn count(&self, column: Column) -> Result<usize, StoreError> {
        let guard = self.read()?;
        Ok(guard.range(range_start(column, &[])..).take_while(|((c, _), _)| *c == column).count())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

fn range_start(column: Column, prefix: &[u8]) -> (Column, Vec<u8>) {
    (column, prefix.to_vec())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.read()?;
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.read()?;
        let results = guard
            .range(range_start(column, prefix)..)
            .take_while(|((entry_column, key), _)| *entry_column == column && key.starts_with(prefix))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect();
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read()?;
        for ((entry_column, key), value) in guard.range(range_start(column, prefix)..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_is_ordered_and_column_scoped() {
        let store = MemoryStore::new();
        store.put(Column::Tx, b"ab2", b"2").unwrap();
        store.put(Column::Tx, b"ab1", b"1").unwrap();
        store.put(Column::Tx, b"ac0", b"x").unwrap();
        store.put(Column::TxBlock, b"ab0", b"y").unwrap();

        let keys: Vec<Vec<u8>> = store
            .scan_prefix(Column::Tx, b"ab")
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"ab1".to_vec(), b"ab2".to_vec()]);
        assert_eq!(store.count(Column::Tx).unwrap(), 3);
        assert_eq!(store.count(Column::Meta).unwrap(), 0);
    }

    #[test]
    fn batch_applies_puts_and_deletes() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"gone", b"1").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"kept", b"2");
        batch.delete(Column::Meta, b"gone");
        store.write_batch(&batch).unwrap();
        assert_eq!(store.get(Column::Meta, b"gone").unwrap(), None);
        assert_eq!(store.get(Column::Meta, b"kept").unwrap(), Some(b"2".to_vec()));
    }
}
