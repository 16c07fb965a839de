//! Core blockchain data structures and traits
//!
//! This crate provides the fundamental building blocks shared by the
//! consensus engine, its storage and the wallet state:
//! - Basic types (Hash, Address, Height, Round, etc.)
//! - Transaction and Block structures
//! - Consensus messages (proposals, votes, commits) and their canonical encoding
//! - BLS12-381 consensus signatures and the validator participation bitmask

pub mod bitmask;
pub mod block;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod message;
pub mod transaction;
pub mod types;

// Re-export commonly used types
pub use bitmask::*;
pub use block::*;
pub use crypto::*;
pub use error::*;
pub use message::*;
pub use transaction::*;
pub use types::*;
