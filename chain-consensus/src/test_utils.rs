//! Shared fixtures for unit tests

use crate::aggregator::VoteAggregator;
use crate::commit_state::CommitState;
use crate::config::{QuorumPolicy, TimeoutConfig};
use crate::proposer::RoundRobinSelector;
use crate::scheduler::minimal_timestamp;
use crate::validator_set::{Validator, ValidatorSet};
use crate::verifier::BlockVerificationPipeline;
use chain_core::{
    Address, AggregatedSignature, Block, BlockId, Bls12381, BlsKeyPair, Commit, ConsensusSignature,
    Height, Proposal, Round, Signer, Timestamp, Transaction, ValidatorBitmask, ValidatorIndex,
    Vote, VoteKind, WalletKeyPair,
};
use chain_state::{ChainStore, MemoryChainStore, MemoryWalletRepository, Wallet};
use std::sync::Arc;

pub(crate) fn consensus_key(i: usize) -> BlsKeyPair {
    BlsKeyPair::from_seed(format!("consensus-{i}").as_bytes()).unwrap()
}

pub(crate) fn wallet_key(i: usize) -> WalletKeyPair {
    WalletKeyPair::from_seed(format!("wallet-{i}").as_bytes()).unwrap()
}

pub(crate) fn validator(i: usize, voting_power: u64) -> Validator {
    let wallet = wallet_key(i);
    Validator {
        address: wallet.address().unwrap(),
        consensus_public_key: consensus_key(i).public_key(),
        wallet_public_key: wallet.public_key().clone(),
        voting_power,
    }
}

pub(crate) fn validator_set(n: usize) -> Arc<ValidatorSet> {
    Arc::new(
        ValidatorSet::new((0..n).map(|i| validator(i, 1)).collect(), QuorumPolicy::EqualWeight)
            .unwrap(),
    )
}

pub(crate) fn signed_vote(
    kind: VoteKind,
    height: Height,
    round: Round,
    block_id: Option<BlockId>,
    index: ValidatorIndex,
) -> Vote {
    Vote::signed(kind, height, round, block_id, index, &consensus_key(index)).unwrap()
}

/// Signed proposal of an empty block by validator `proposer`
pub(crate) fn proposal(height: Height, round: Round, proposer: ValidatorIndex) -> Proposal {
    let mut parent = Block::genesis(wallet_key(0).public_key().clone(), 0).header;
    parent.height = height - 1;
    let block = Block::build(&parent, round, 8_000, wallet_key(proposer).public_key().clone(), vec![])
        .unwrap();
    let message = Proposal::signing_message_for(height, round, None, block.id().unwrap()).unwrap();
    Proposal {
        height,
        round,
        valid_round: None,
        block,
        lock_proof: None,
        validator_index: proposer,
        signature: consensus_key(proposer).sign(&message),
    }
}

/// Precommit certificate by `signers`
pub(crate) fn precommit_certificate(
    height: Height,
    round: Round,
    block_id: BlockId,
    signers: &[ValidatorIndex],
    validator_count: usize,
) -> AggregatedSignature {
    let signatures: Vec<_> = signers
        .iter()
        .map(|&i| signed_vote(VoteKind::Precommit, height, round, Some(block_id), i).signature)
        .collect();
    AggregatedSignature {
        bitmask: ValidatorBitmask::from_indices(validator_count, signers.iter().copied()),
        signature: Bls12381.aggregate(&signatures).unwrap(),
    }
}

/// Chain of `n` round-robin validators on top of a genesis block at time 0,
/// with one funded user wallet
pub(crate) struct TestChain {
    pub validators: Arc<ValidatorSet>,
    pub store: Arc<MemoryChainStore>,
    pub timeouts: TimeoutConfig,
    alice: WalletKeyPair,
}

impl TestChain {
    pub fn new(n: usize) -> Self {
        let alice = WalletKeyPair::from_seed(b"alice").unwrap();
        let wallets = MemoryWalletRepository::with_wallets([
            Wallet::for_public_key(alice.public_key().clone(), 1_000_000).unwrap(),
        ]);
        let genesis = Block::genesis(wallet_key(0).public_key().clone(), 0);
        Self {
            validators: validator_set(n),
            store: Arc::new(MemoryChainStore::new(genesis, Arc::new(wallets))),
            timeouts: TimeoutConfig::default(),
            alice,
        }
    }

    pub fn alice_address(&self) -> Address {
        self.alice.address().unwrap()
    }

    pub fn transfer(&self, nonce: u64, value: u64) -> Transaction {
        let mut tx = Transaction::transfer(
            self.alice.public_key().clone(),
            nonce,
            wallet_key(1).address().unwrap(),
            value,
            1,
        );
        self.alice.sign(&mut tx).unwrap();
        tx
    }

    pub fn block_by(
        &self,
        round: Round,
        txs: Vec<Transaction>,
        timestamp: Timestamp,
        generator: ValidatorIndex,
    ) -> Block {
        let parent = self.store.last_block();
        Block::build(
            &parent.header,
            round,
            timestamp,
            wallet_key(generator).public_key().clone(),
            txs,
        )
        .unwrap()
    }

    /// Block by the round-robin proposer at the earliest valid timestamp
    pub fn block(&self, round: Round, txs: Vec<Transaction>) -> Block {
        let parent = self.store.last_block().header.timestamp;
        let timestamp = minimal_timestamp(&self.timeouts, parent, round);
        self.block_by(round, txs, timestamp, round as usize % self.validators.len())
    }

    fn unit_for(&self, block: Block) -> CommitState {
        CommitState::for_proposal(
            block,
            self.store.last_block(),
            self.validators.clone(),
            self.store.wallet_snapshot(),
        )
    }

    pub fn proposal_unit(&self, round: Round, txs: Vec<Transaction>) -> CommitState {
        self.unit_for(self.block(round, txs))
    }

    pub fn proposal_unit_at(&self, round: Round, txs: Vec<Transaction>, timestamp: Timestamp) -> CommitState {
        let generator = round as usize % self.validators.len();
        self.unit_for(self.block_by(round, txs, timestamp, generator))
    }

    pub fn proposal_unit_by(&self, round: Round, generator: ValidatorIndex) -> CommitState {
        let parent = self.store.last_block().header.timestamp;
        let timestamp = minimal_timestamp(&self.timeouts, parent, round);
        self.unit_for(self.block_by(round, vec![], timestamp, generator))
    }

    /// Commit state whose certificate covers `block_id`
    pub fn commit_unit_for(
        &self,
        round: Round,
        txs: Vec<Transaction>,
        signers: &[ValidatorIndex],
        block_id: BlockId,
    ) -> CommitState {
        let block = self.block(round, txs);
        let commit = Commit {
            height: block.height(),
            round,
            block_id,
            certificate: precommit_certificate(
                block.height(),
                round,
                block_id,
                signers,
                self.validators.len(),
            ),
        };
        CommitState::new(
            commit,
            block,
            self.store.last_block(),
            self.validators.clone(),
            self.store.wallet_snapshot(),
        )
    }

    pub fn commit_unit(&self, round: Round, txs: Vec<Transaction>, signers: &[ValidatorIndex]) -> CommitState {
        let block_id = self.block(round, txs.clone()).id().unwrap();
        self.commit_unit_for(round, txs, signers, block_id)
    }

    /// Append a block certified by every validator
    pub fn commit_block(&self, round: Round, txs: Vec<Transaction>) {
        let signers: Vec<_> = (0..self.validators.len()).collect();
        let mut unit = self.commit_unit(round, txs, &signers);
        unit.apply_block().unwrap();
        let (commit, block, wallets) = unit.into_parts();
        self.store.commit(&commit.unwrap(), &block, wallets).unwrap();
    }

    pub fn aggregator(&self) -> VoteAggregator {
        VoteAggregator::new(Arc::new(Bls12381))
    }

    pub fn pipeline(&self) -> BlockVerificationPipeline {
        BlockVerificationPipeline::standard(
            self.store.clone(),
            Arc::new(RoundRobinSelector),
            self.timeouts,
            self.aggregator(),
        )
    }
}
