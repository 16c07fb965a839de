//! Canonical chain storage consumed by the consensus engine

use crate::{MemoryWalletRepository, StateError, StateResult, WalletRepository, WalletSnapshot};
use chain_core::{Block, Commit, Hash};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Long-term chain state. The engine reads the tip and wallet state from it
/// and hands it every accepted commit.
pub trait ChainStore: Send + Sync {
    /// Last committed block
    fn last_block(&self) -> Block;

    /// Certificate of the last committed block (none for genesis)
    fn last_commit(&self) -> Option<Commit>;

    /// Whether a transaction id is already part of the chain
    fn has_transaction(&self, id: &Hash) -> bool;

    /// Fresh isolated view over canonical wallet state
    fn wallet_snapshot(&self) -> WalletSnapshot;

    /// Append `block` and merge the verified wallet view
    fn commit(&self, commit: &Commit, block: &Block, wallets: WalletSnapshot) -> StateResult<()>;
}

#[derive(Debug)]
struct ChainData {
    blocks: Vec<Block>,
    commits: Vec<Commit>,
    transaction_ids: HashSet<Hash>,
}

/// In-memory chain store
#[derive(Debug)]
pub struct MemoryChainStore {
    data: RwLock<ChainData>,
    wallets: Arc<MemoryWalletRepository>,
}

impl MemoryChainStore {
    pub fn new(genesis: Block, wallets: Arc<MemoryWalletRepository>) -> Self {
        Self {
            data: RwLock::new(ChainData {
                blocks: vec![genesis],
                commits: Vec::new(),
                transaction_ids: HashSet::new(),
            }),
            wallets,
        }
    }

    pub fn wallets(&self) -> &Arc<MemoryWalletRepository> {
        &self.wallets
    }

    /// Height of the last committed block
    pub fn height(&self) -> u64 {
        self.data.read().blocks.len() as u64 - 1
    }

    pub fn block_at(&self, height: u64) -> Option<Block> {
        self.data.read().blocks.get(height as usize).cloned()
    }
}

impl ChainStore for MemoryChainStore {
    fn last_block(&self) -> Block {
        let data = self.data.read();
        // The genesis block is inserted on construction and never removed
        data.blocks[data.blocks.len() - 1].clone()
    }

    fn last_commit(&self) -> Option<Commit> {
        self.data.read().commits.last().cloned()
    }

    fn has_transaction(&self, id: &Hash) -> bool {
        self.data.read().transaction_ids.contains(id)
    }

    fn wallet_snapshot(&self) -> WalletSnapshot {
        let base: Arc<dyn WalletRepository> = self.wallets.clone();
        WalletSnapshot::new(base)
    }

    fn commit(&self, commit: &Commit, block: &Block, wallets: WalletSnapshot) -> StateResult<()> {
        let mut data = self.data.write();
        let tip = data.blocks.len() as u64 - 1;
        if block.height() != tip + 1 || commit.height != block.height() {
            return Err(StateError::NotNextBlock {
                tip,
                actual: block.height(),
            });
        }

        let mut ids = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            ids.push(tx.id()?);
        }

        self.wallets.apply_changes(wallets.into_changes());
        data.transaction_ids.extend(ids);
        data.blocks.push(block.clone());
        data.commits.push(commit.clone());

        info!(
            "Committed block {} at height {} (round {}, signers {})",
            commit.block_id.short(),
            commit.height,
            commit.round,
            commit.certificate.bitmask
        );
        Ok(())
    }
}
