//! Error types for the core crate

use thiserror::Error;

/// Core blockchain errors
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

impl From<bincode::error::EncodeError> for CoreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for CoreError {
    fn from(err: bincode::error::DecodeError) -> Self {
        CoreError::Deserialization(err.to_string())
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
