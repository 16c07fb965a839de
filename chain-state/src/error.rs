//! Wallet state error types

use chain_core::{Address, CoreError, Height};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    /// Insufficient balance
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    /// Invalid nonce
    #[error("Invalid nonce: expected {expected}, got {actual}")]
    InvalidNonce { expected: u64, actual: u64 },

    #[error("Balance overflow for {0}")]
    BalanceOverflow(Address),

    /// Invalid transaction
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Block does not extend the canonical chain
    #[error("Block at height {actual} does not extend chain at height {tip}")]
    NotNextBlock { tip: Height, actual: Height },

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for state operations
pub type StateResult<T> = Result<T, StateError>;
