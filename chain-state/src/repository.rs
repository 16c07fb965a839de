//! Canonical wallet repository

use crate::Wallet;
use chain_core::{Address, Hash, WalletPublicKey};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Read access to canonical wallet state
pub trait WalletRepository: Send + Sync {
    fn find_by_address(&self, address: &Address) -> Option<Wallet>;

    fn find_by_public_key(&self, public_key: &WalletPublicKey) -> Option<Wallet>;

    fn has_by_address(&self, address: &Address) -> bool {
        self.find_by_address(address).is_some()
    }

    fn has_by_public_key(&self, public_key: &WalletPublicKey) -> bool {
        self.find_by_public_key(public_key).is_some()
    }
}

#[derive(Debug, Default)]
struct Wallets {
    by_address: HashMap<Address, Wallet>,
    by_public_key: HashMap<WalletPublicKey, Address>,
}

/// In-memory wallet repository
#[derive(Debug, Default)]
pub struct MemoryWalletRepository {
    inner: RwLock<Wallets>,
}

impl MemoryWalletRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with initial wallets
    pub fn with_wallets(wallets: impl IntoIterator<Item = Wallet>) -> Self {
        let repo = Self::new();
        repo.apply_changes(wallets);
        repo
    }

    /// Upsert wallets, dropping the ones that became empty
    pub fn apply_changes(&self, changes: impl IntoIterator<Item = Wallet>) {
        let mut inner = self.inner.write();
        for wallet in changes {
            if let Some(public_key) = &wallet.public_key {
                inner
                    .by_public_key
                    .insert(public_key.clone(), wallet.address);
            }
            if wallet.is_empty() {
                inner.by_address.remove(&wallet.address);
            } else {
                inner.by_address.insert(wallet.address, wallet);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deterministic digest over all wallets, ordered by address
    pub fn state_root(&self) -> Hash {
        let inner = self.inner.read();
        let mut sorted: Vec<_> = inner.by_address.values().collect();
        sorted.sort_by_key(|wallet| wallet.address);

        let mut hasher = blake3::Hasher::new();
        for wallet in sorted {
            hasher.update(wallet.address.as_bytes());
            hasher.update(&wallet.nonce.to_le_bytes());
            hasher.update(&wallet.balance.to_le_bytes());
        }
        Hash::new(*hasher.finalize().as_bytes())
    }
}

impl WalletRepository for MemoryWalletRepository {
    fn find_by_address(&self, address: &Address) -> Option<Wallet> {
        self.inner.read().by_address.get(address).cloned()
    }

    fn find_by_public_key(&self, public_key: &WalletPublicKey) -> Option<Wallet> {
        let inner = self.inner.read();
        let address = inner.by_public_key.get(public_key)?;
        inner.by_address.get(address).cloned()
    }
}
