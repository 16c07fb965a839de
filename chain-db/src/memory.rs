//! In-memory backend for tests and ephemeral nodes

use crate::traits::KeyValue;
use crate::{ColumnFamily, DbResult, KeyValueDB, Operation, WriteBatch};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: RwLock<HashMap<ColumnFamily, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a column family
    pub fn len(&self, cf: ColumnFamily) -> usize {
        self.tables.read().get(&cf).map_or(0, BTreeMap::len)
    }
}

impl KeyValueDB for MemoryDatabase {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(&cf)
            .and_then(|table| table.get(key))
            .cloned())
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.tables
            .write()
            .entry(cf)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<()> {
        if let Some(table) = self.tables.write().get_mut(&cf) {
            table.remove(key);
        }
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> DbResult<()> {
        let mut tables = self.tables.write();
        for operation in batch.into_operations() {
            match operation {
                Operation::Put { cf, key, value } => {
                    tables.entry(cf).or_default().insert(key, value);
                }
                Operation::Delete { cf, key } => {
                    if let Some(table) = tables.get_mut(&cf) {
                        table.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn iter(&self, cf: ColumnFamily) -> DbResult<Vec<KeyValue>> {
        Ok(self
            .tables
            .read()
            .get(&cf)
            .map(|table| {
                table
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn flush(&self) -> DbResult<()> {
        Ok(())
    }
}
