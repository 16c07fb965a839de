//! Database traits and interfaces

use crate::{ColumnFamily, DbResult};
use std::sync::Arc;

/// Key-value pair yielded by column family scans
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Key-value database trait
pub trait KeyValueDB: Send + Sync {
    /// Get value by key from a column family
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<Option<Vec<u8>>>;

    /// Put key-value pair into a column family (durable on return)
    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> DbResult<()>;

    /// Delete key from a column family
    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<()>;

    /// Check if key exists in a column family
    fn exists(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Apply all operations atomically (durable on return)
    fn write(&self, batch: WriteBatch) -> DbResult<()>;

    /// All entries of a column family in key order
    fn iter(&self, cf: ColumnFamily) -> DbResult<Vec<KeyValue>>;

    /// Remove every entry of the given column families in one batch
    fn clear(&self, cfs: &[ColumnFamily]) -> DbResult<()> {
        let mut batch = WriteBatch::new();
        for cf in cfs {
            for (key, _) in self.iter(*cf)? {
                batch.delete(*cf, &key);
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.write(batch)
    }

    /// Flush WAL to disk
    fn flush(&self) -> DbResult<()>;
}

/// Shared database reference
pub type SharedDatabase = Arc<dyn KeyValueDB>;

/// Database operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Put {
        cf: ColumnFamily,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamily,
        key: Vec<u8>,
    },
}

/// Ordered list of operations applied atomically by [`KeyValueDB::write`]
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    operations: Vec<Operation>,
}

impl WriteBatch {
    /// Create new write batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Add put operation
    pub fn put(&mut self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> &mut Self {
        self.operations.push(Operation::Put {
            cf,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self
    }

    /// Add delete operation
    pub fn delete(&mut self, cf: ColumnFamily, key: &[u8]) -> &mut Self {
        self.operations.push(Operation::Delete {
            cf,
            key: key.to_vec(),
        });
        self
    }

    /// Get number of operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if batch is empty
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }
}
