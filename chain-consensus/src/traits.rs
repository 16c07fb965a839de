//! Collaborators the consensus engine drives but does not own

use crate::ConsensusResult;
use chain_core::{Block, Proposal, Round, Timestamp, Vote, WalletPublicKey};

/// Outbound gossip of consensus messages. Called only after the message is
/// durably stored.
pub trait Broadcaster: Send + Sync {
    fn broadcast_proposal(&self, proposal: &Proposal);

    fn broadcast_prevote(&self, vote: &Vote);

    fn broadcast_precommit(&self, vote: &Vote);
}

/// Source of candidate blocks for local proposals
pub trait BlockBuilder: Send + Sync {
    /// Assemble a block on top of `parent` forged by `generator`
    fn build_block(
        &self,
        parent: &Block,
        round: Round,
        timestamp: Timestamp,
        generator: &WalletPublicKey,
    ) -> ConsensusResult<Block>;
}

/// Builds blocks without transactions
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyBlockBuilder;

impl BlockBuilder for EmptyBlockBuilder {
    fn build_block(
        &self,
        parent: &Block,
        round: Round,
        timestamp: Timestamp,
        generator: &WalletPublicKey,
    ) -> ConsensusResult<Block> {
        Ok(Block::build(
            &parent.header,
            round,
            timestamp,
            generator.clone(),
            Vec::new(),
        )?)
    }
}

/// Broadcaster for nodes that do not gossip (observers, tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast_proposal(&self, _proposal: &Proposal) {}

    fn broadcast_prevote(&self, _vote: &Vote) {}

    fn broadcast_precommit(&self, _vote: &Vote) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::wallet_key;

    #[test]
    fn test_empty_block_builder_links_parent() {
        let genesis = Block::genesis(wallet_key(0).public_key().clone(), 0);
        let block = EmptyBlockBuilder
            .build_block(&genesis, 3, 8_000, wallet_key(3).public_key())
            .unwrap();

        assert_eq!(block.height(), 1);
        assert_eq!(block.header.round, 3);
        assert_eq!(block.header.parent_hash, genesis.id().unwrap());
        assert!(block.transactions.is_empty());
        assert!(block.validate().unwrap());
    }
}
