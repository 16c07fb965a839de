//! Consensus messages and the persisted protocol state

use crate::{
    Block, BlockId, BlsSignature, CoreResult, Height, Round, Signer, ValidatorBitmask,
    ValidatorIndex,
};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Vote phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum VoteKind {
    Prevote,
    Precommit,
}

impl fmt::Display for VoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteKind::Prevote => f.write_str("prevote"),
            VoteKind::Precommit => f.write_str("precommit"),
        }
    }
}

#[derive(Encode)]
struct VoteSigningPayload {
    kind: VoteKind,
    height: Height,
    round: Round,
    block_id: Option<BlockId>,
}

#[derive(Encode)]
struct ProposalSigningPayload {
    height: Height,
    round: Round,
    valid_round: Option<Round>,
    block_id: BlockId,
}

/// Prevote or precommit of a single validator. `block_id == None` is a vote for nil.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Vote {
    pub kind: VoteKind,
    pub height: Height,
    pub round: Round,
    pub block_id: Option<BlockId>,
    pub validator_index: ValidatorIndex,
    pub signature: BlsSignature,
}

impl Vote {
    /// Canonical message signed by voters: encoding of `(kind, height, round, block_id)`
    pub fn signing_message_for(
        kind: VoteKind,
        height: Height,
        round: Round,
        block_id: Option<BlockId>,
    ) -> CoreResult<Vec<u8>> {
        let payload = VoteSigningPayload {
            kind,
            height,
            round,
            block_id,
        };
        Ok(bincode::encode_to_vec(&payload, bincode::config::standard())?)
    }

    pub fn signing_message(&self) -> CoreResult<Vec<u8>> {
        Self::signing_message_for(self.kind, self.height, self.round, self.block_id)
    }

    /// Build and sign a vote in the calling thread
    pub fn signed(
        kind: VoteKind,
        height: Height,
        round: Round,
        block_id: Option<BlockId>,
        validator_index: ValidatorIndex,
        signer: &dyn Signer,
    ) -> CoreResult<Self> {
        let message = Self::signing_message_for(kind, height, round, block_id)?;
        Ok(Self {
            kind,
            height,
            round,
            block_id,
            validator_index,
            signature: signer.sign(&message),
        })
    }

    pub fn is_nil(&self) -> bool {
        self.block_id.is_none()
    }
}

/// Participation bitmask plus the aggregate of the participants' signatures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct AggregatedSignature {
    pub bitmask: ValidatorBitmask,
    pub signature: BlsSignature,
}

/// Block proposal. A proposal with `valid_round` re-proposes the value that
/// saw a prevote quorum in that round and carries the quorum as `lock_proof`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub valid_round: Option<Round>,
    pub block: Block,
    pub lock_proof: Option<AggregatedSignature>,
    pub validator_index: ValidatorIndex,
    pub signature: BlsSignature,
}

impl Proposal {
    pub fn signing_message_for(
        height: Height,
        round: Round,
        valid_round: Option<Round>,
        block_id: BlockId,
    ) -> CoreResult<Vec<u8>> {
        let payload = ProposalSigningPayload {
            height,
            round,
            valid_round,
            block_id,
        };
        Ok(bincode::encode_to_vec(&payload, bincode::config::standard())?)
    }

    pub fn signing_message(&self) -> CoreResult<Vec<u8>> {
        Self::signing_message_for(self.height, self.round, self.valid_round, self.block.id()?)
    }

    pub fn block_id(&self) -> CoreResult<BlockId> {
        self.block.id()
    }
}

/// Quorum certificate for a decided block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Commit {
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
    pub certificate: AggregatedSignature,
}

impl Commit {
    /// The precommit message every participant signed
    pub fn signing_message(&self) -> CoreResult<Vec<u8>> {
        Vote::signing_message_for(
            VoteKind::Precommit,
            self.height,
            self.round,
            Some(self.block_id),
        )
    }
}

/// Protocol step within a round
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub enum Step {
    Propose,
    Prevote,
    Precommit,
}

/// Locking fields carried across rounds of one height
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LockState {
    pub locked_value: Option<BlockId>,
    pub locked_round: Option<Round>,
    pub valid_value: Option<BlockId>,
    pub valid_round: Option<Round>,
}

impl LockState {
    /// Record a prevote quorum for `block_id` at `round`. The valid value only
    /// moves forward and never below the locked round. Returns true on change.
    pub fn observe_polka(&mut self, round: Round, block_id: BlockId) -> bool {
        if self.locked_round.is_some_and(|locked| round < locked) {
            return false;
        }
        if self.valid_round.is_some_and(|valid| round < valid) {
            return false;
        }
        if self.valid_round == Some(round) && self.valid_value == Some(block_id) {
            return false;
        }
        self.valid_value = Some(block_id);
        self.valid_round = Some(round);
        true
    }

    /// Lock on `block_id`; called only when the local node precommits it
    pub fn lock(&mut self, round: Round, block_id: BlockId) {
        self.locked_value = Some(block_id);
        self.locked_round = Some(round);
        self.observe_polka(round, block_id);
    }

    /// Prevote for `block_id` is allowed when unlocked, when it is the locked
    /// value, or when the proposal proves a polka at a round above the lock.
    pub fn allows_prevote(&self, block_id: &BlockId, proof_round: Option<Round>) -> bool {
        self.permits(block_id, proof_round)
    }

    /// Precommit for `block_id` after observing a polka at `polka_round`
    pub fn allows_precommit(&self, block_id: &BlockId, polka_round: Round) -> bool {
        self.permits(block_id, Some(polka_round))
    }

    fn permits(&self, block_id: &BlockId, polka_round: Option<Round>) -> bool {
        match (self.locked_value, self.locked_round) {
            (Some(locked), Some(locked_round)) => {
                locked == *block_id || polka_round.is_some_and(|r| r > locked_round)
            }
            _ => true,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_value.is_some()
    }
}

/// Singleton protocol record persisted for crash recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ConsensusStateData {
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub lock: LockState,
}
