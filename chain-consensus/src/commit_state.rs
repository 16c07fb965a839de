//! Units of work handed to block verification

use crate::validator_set::ValidatorSet;
use chain_core::{Block, Commit, Height, Round};
use chain_state::{StateResult, WalletSnapshot};
use std::sync::Arc;

/// Something carrying a block whose validity gets decided once
pub trait ProcessableUnit {
    fn height(&self) -> Height;

    fn round(&self) -> Round;

    fn block(&self) -> Option<&Block>;

    /// `None` until the block has been evaluated
    fn processor_result(&self) -> Option<bool>;

    fn set_processor_result(&mut self, result: bool);
}

/// A block being checked before it is applied.
///
/// Built for a proposal (no certificate yet) or for a decided commit. The
/// wallet snapshot is an isolated view; canonical state changes only when the
/// engine hands an accepted commit state to the chain store.
#[derive(Debug)]
pub struct CommitState {
    commit: Option<Commit>,
    block: Block,
    previous_block: Block,
    validators: Arc<ValidatorSet>,
    wallets: WalletSnapshot,
    processor_result: Option<bool>,
}

impl CommitState {
    /// State for a block that reached a precommit quorum
    pub fn new(
        commit: Commit,
        block: Block,
        previous_block: Block,
        validators: Arc<ValidatorSet>,
        wallets: WalletSnapshot,
    ) -> Self {
        Self {
            commit: Some(commit),
            block,
            previous_block,
            validators,
            wallets,
            processor_result: None,
        }
    }

    /// State for a proposed block that has no certificate yet
    pub fn for_proposal(
        block: Block,
        previous_block: Block,
        validators: Arc<ValidatorSet>,
        wallets: WalletSnapshot,
    ) -> Self {
        Self {
            commit: None,
            block,
            previous_block,
            validators,
            wallets,
            processor_result: None,
        }
    }

    pub fn commit(&self) -> Option<&Commit> {
        self.commit.as_ref()
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn previous_block(&self) -> &Block {
        &self.previous_block
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn wallets(&self) -> &WalletSnapshot {
        &self.wallets
    }

    pub fn wallets_mut(&mut self) -> &mut WalletSnapshot {
        &mut self.wallets
    }

    /// Execute the block's transactions against the snapshot
    pub fn apply_block(&mut self) -> StateResult<()> {
        self.wallets.apply_block(&self.block)
    }

    /// Give up the parts the chain store needs to apply the block
    pub fn into_parts(self) -> (Option<Commit>, Block, WalletSnapshot) {
        (self.commit, self.block, self.wallets)
    }
}

impl ProcessableUnit for CommitState {
    fn height(&self) -> Height {
        self.block.height()
    }

    fn round(&self) -> Round {
        self.commit
            .as_ref()
            .map_or(self.block.header.round, |c| c.round)
    }

    fn block(&self) -> Option<&Block> {
        Some(&self.block)
    }

    fn processor_result(&self) -> Option<bool> {
        self.processor_result
    }

    fn set_processor_result(&mut self, result: bool) {
        self.processor_result = Some(result);
    }
}
