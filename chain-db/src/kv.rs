//! RocksDB backend

use crate::traits::KeyValue;
use crate::{ColumnFamily, DbError, DbResult, KeyValueDB, Operation, WriteBatch};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory of the database
    pub path: PathBuf,
    pub create_if_missing: bool,
    /// fsync every write; consensus safety relies on this
    pub sync_writes: bool,
}

impl DatabaseConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            create_if_missing: true,
            sync_writes: true,
        }
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }
}

/// RocksDB database with one column family per [`ColumnFamily`]
pub struct Database {
    db: DB,
    sync_writes: bool,
}

impl Database {
    /// Open (or create) the database described by `config`
    pub fn open(config: &DatabaseConfig) -> DbResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = ColumnFamily::all()
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &config.path, cf_descriptors)?;
        info!("Opened consensus database at {}", config.path.display());

        Ok(Self {
            db,
            sync_writes: config.sync_writes,
        })
    }

    fn handle(&self, cf: ColumnFamily) -> DbResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(cf.name())
            .ok_or_else(|| DbError::UnknownColumnFamily(cf.name().to_string()))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        write_opts
    }
}

impl KeyValueDB for Database {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.handle(cf)?, key)?)
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> DbResult<()> {
        Ok(self
            .db
            .put_cf_opt(self.handle(cf)?, key, value, &self.write_options())?)
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> DbResult<()> {
        Ok(self
            .db
            .delete_cf_opt(self.handle(cf)?, key, &self.write_options())?)
    }

    fn write(&self, batch: WriteBatch) -> DbResult<()> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for operation in batch.into_operations() {
            match operation {
                Operation::Put { cf, key, value } => {
                    rocks_batch.put_cf(self.handle(cf)?, key, value);
                }
                Operation::Delete { cf, key } => {
                    rocks_batch.delete_cf(self.handle(cf)?, key);
                }
            }
        }
        Ok(self.db.write_opt(rocks_batch, &self.write_options())?)
    }

    fn iter(&self, cf: ColumnFamily) -> DbResult<Vec<KeyValue>> {
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.handle(cf)?, IteratorMode::Start) {
            let (key, value) = item?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn flush(&self) -> DbResult<()> {
        Ok(self.db.flush()?)
    }
}
