//! Isolated wallet view used while a commit is verified
//!
//! Wallets are copied from the canonical repository the first time they are
//! touched; the canonical repository is never written through a snapshot.
//! Changes reach canonical state only through [`WalletSnapshot::into_changes`].

use crate::{StateError, StateResult, Wallet, WalletRepository};
use chain_core::{Address, Amount, Block, Transaction, WalletPublicKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct WalletSnapshot {
    base: Arc<dyn WalletRepository>,
    touched: BTreeMap<Address, Wallet>,
    by_public_key: HashMap<WalletPublicKey, Address>,
}

impl WalletSnapshot {
    pub fn new(base: Arc<dyn WalletRepository>) -> Self {
        Self {
            base,
            touched: BTreeMap::new(),
            by_public_key: HashMap::new(),
        }
    }

    /// Current view of a wallet without copying it
    pub fn find_by_address(&self, address: &Address) -> Option<Wallet> {
        self.touched
            .get(address)
            .cloned()
            .or_else(|| self.base.find_by_address(address))
    }

    pub fn find_by_public_key(&self, public_key: &WalletPublicKey) -> Option<Wallet> {
        if let Some(address) = self.by_public_key.get(public_key) {
            return self.touched.get(address).cloned();
        }
        self.base.find_by_public_key(public_key)
    }

    /// Mutable wallet, copied into the snapshot on first access
    pub fn wallet_mut(&mut self, address: Address) -> &mut Wallet {
        let base = &self.base;
        self.touched
            .entry(address)
            .or_insert_with(|| base.find_by_address(&address).unwrap_or_else(|| Wallet::new(address)))
    }

    /// Mutable wallet owned by `public_key`, binding the key on first use
    pub fn wallet_for_key_mut(&mut self, public_key: &WalletPublicKey) -> StateResult<&mut Wallet> {
        let address = public_key.to_address()?;
        self.by_public_key.insert(public_key.clone(), address);
        let wallet = self.wallet_mut(address);
        if wallet.public_key.is_none() {
            wallet.public_key = Some(public_key.clone());
        }
        Ok(wallet)
    }

    /// Apply a transfer: the nonce must be exactly one above the sender's
    /// current nonce and the balance must cover value plus fee.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> StateResult<()> {
        let cost = tx
            .total_cost()
            .ok_or_else(|| StateError::InvalidTransaction("value plus fee overflows".into()))?;

        let sender = self.wallet_for_key_mut(&tx.sender_public_key)?;
        let expected = sender.nonce + 1;
        if tx.nonce != expected {
            return Err(StateError::InvalidNonce {
                expected,
                actual: tx.nonce,
            });
        }
        sender.sub_balance(cost)?;
        sender.increment_nonce();

        self.wallet_mut(tx.to).add_balance(tx.value)
    }

    /// Apply every transaction of `block` and credit the collected fees to
    /// the generator
    pub fn apply_block(&mut self, block: &Block) -> StateResult<()> {
        for tx in &block.transactions {
            self.apply_transaction(tx)?;
        }
        self.credit(&block.header.generator_public_key, block.header.total_fee)
    }

    fn credit(&mut self, public_key: &WalletPublicKey, amount: Amount) -> StateResult<()> {
        if amount == 0 {
            return Ok(());
        }
        self.wallet_for_key_mut(public_key)?.add_balance(amount)
    }

    /// Number of wallets copied into the snapshot
    pub fn touched_len(&self) -> usize {
        self.touched.len()
    }

    /// Wallets changed by this snapshot, ordered by address
    pub fn into_changes(self) -> Vec<Wallet> {
        self.touched.into_values().collect()
    }
}

impl std::fmt::Debug for WalletSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSnapshot")
            .field("touched", &self.touched)
            .finish_non_exhaustive()
    }
}
