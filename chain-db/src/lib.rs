//! Consensus database layer
//!
//! This crate provides durable storage for in-flight consensus artifacts
//! (proposals, prevotes, precommits and the protocol state record) on top of
//! a column-family key-value abstraction with RocksDB and in-memory backends.

pub mod column_families;
pub mod consensus_store;
pub mod error;
pub mod kv;
pub mod memory;
pub mod traits;

pub use column_families::ColumnFamily;
pub use consensus_store::{ConsensusStorage, ConsensusStore};
pub use error::{DbError, DbResult};
pub use kv::{Database, DatabaseConfig};
pub use memory::MemoryDatabase;
pub use traits::{KeyValueDB, Operation, SharedDatabase, WriteBatch};
