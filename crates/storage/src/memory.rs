//! In-memory store used by tests and as a reference backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default)]
pub struct MemoryStore {
    columns: Mutex<HashMap<Column, ColumnMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Column, ColumnMap>>, StoreError> {
        self.columns
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.lock()?;
        Ok(columns
            .get(&column)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.lock()?;
        columns
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.lock()?;
        if let Some(entries) = columns.get_mut(&column) {
            entries.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let columns = self.lock()?;
        let Some(entries) = columns.get(&column) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for (key, value) in self.scan_prefix(column, prefix)? {
            visitor(&key, &value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.lock()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns
                        .entry(*column)
                        .or_default()
                        .insert(key.as_slice().to_vec(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    if let Some(entries) = columns.get_mut(column) {
                        entries.remove(key.as_slice());
                    }
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
    fn batch_put_then_delete() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"best_block".as_slice(), vec![1u8; 32]);
        store.write_batch(&batch).expect("commit");
        assert_eq!(
            store.get(Column::Meta, b"best_block").expect("get"),
            Some(vec![1u8; 32])
        );

        let mut batch = WriteBatch::new();
        batch.delete(Column::Meta, b"best_block".as_slice());
        store.write_batch(&batch).expect("commit");
        assert_eq!(store.get(Column::Meta, b"best_block").expect("get"), None);
    }

    #[test]
    fn prefix_scan_is_bounded() {
        let store = MemoryStore::new();
        store.put(Column::Coins, &[0x01, 0x00], b"a").expect("put");
        store.put(Column::Coins, &[0x01, 0x01], b"b").expect("put");
        store.put(Column::Coins, &[0x02, 0x00], b"c").expect("put");

        let hits = store.scan_prefix(Column::Coins, &[0x01]).expect("scan");
        assert_eq!(hits.len(), 2);
    }
}
