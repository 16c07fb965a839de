//! Wallet state consumed by block verification
//!
//! This crate provides the account model, the canonical wallet repository,
//! isolated copy-on-touch snapshots used while a commit is verified, and the
//! canonical chain store the consensus engine commits into.

pub mod chain_store;
pub mod error;
pub mod repository;
pub mod snapshot;
pub mod wallet;

pub use chain_store::{ChainStore, MemoryChainStore};
pub use error::{StateError, StateResult};
pub use repository::{MemoryWalletRepository, WalletRepository};
pub use snapshot::WalletSnapshot;
pub use wallet::Wallet;
