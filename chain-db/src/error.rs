//! Database error types

use thiserror::Error;

/// Database error type
#[derive(Error, Debug)]
pub enum DbError {
    /// RocksDB error
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes do not decode or are inconsistent
    #[error("Corrupted record in {cf}: {reason}")]
    Corruption { cf: String, reason: String },

    /// Unknown column family
    #[error("Column family not found: {0}")]
    UnknownColumnFamily(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Other error
    #[error("Database error: {0}")]
    Other(String),
}

impl From<chain_core::CoreError> for DbError {
    fn from(err: chain_core::CoreError) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Result type for database operations
pub type DbResult<T> = Result<T, DbError>;
