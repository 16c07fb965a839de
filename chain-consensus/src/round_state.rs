//! Everything known about one (height, round)

use crate::commit_state::ProcessableUnit;
use crate::error::VoteError;
use crate::validator_set::ValidatorSet;
use crate::vote_set::VoteSet;
use crate::{ConsensusError, ConsensusResult};
use chain_core::{
    Block, BlockId, Height, LockState, Proposal, Round, ValidatorIndex, Vote, VoteKind,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Local progress through a round; only moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoundStep {
    Fresh,
    HasProposal,
    Prevoted,
    Precommitted,
    Decided,
}

/// Proposal, votes and locking view of a single round
#[derive(Debug, Clone)]
pub struct RoundState {
    height: Height,
    round: Round,
    validators: Arc<ValidatorSet>,
    proposer: ValidatorIndex,
    proposal: Option<Proposal>,
    block_id: Option<BlockId>,
    processor_result: Option<bool>,
    prevotes: VoteSet,
    precommits: VoteSet,
    lock: LockState,
    step: RoundStep,
}

impl RoundState {
    pub fn new(
        height: Height,
        round: Round,
        validators: Arc<ValidatorSet>,
        proposer: ValidatorIndex,
    ) -> Self {
        Self {
            height,
            round,
            prevotes: VoteSet::new(VoteKind::Prevote, height, round, validators.clone()),
            precommits: VoteSet::new(VoteKind::Precommit, height, round, validators.clone()),
            validators,
            proposer,
            proposal: None,
            block_id: None,
            processor_result: None,
            lock: LockState::default(),
            step: RoundStep::Fresh,
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn validators(&self) -> &Arc<ValidatorSet> {
        &self.validators
    }

    /// Index of the validator expected to propose in this round
    pub fn proposer(&self) -> ValidatorIndex {
        self.proposer
    }

    pub fn proposal(&self) -> Option<&Proposal> {
        self.proposal.as_ref()
    }

    /// Id of the proposed block
    pub fn block_id(&self) -> Option<BlockId> {
        self.block_id
    }

    /// Attach the round's proposal. An identical proposal is a no-op
    /// (`Ok(false)`); a different one from the same proposer is equivocation.
    pub fn set_proposal(&mut self, proposal: Proposal) -> ConsensusResult<bool> {
        if proposal.height != self.height || proposal.round != self.round {
            return Err(ConsensusError::Malformed(format!(
                "proposal for {}/{} offered to round {}/{}",
                proposal.height, proposal.round, self.height, self.round
            )));
        }
        if proposal.validator_index != self.proposer {
            return Err(ConsensusError::Malformed(format!(
                "validator {} is not the proposer of {}/{}",
                proposal.validator_index, self.height, self.round
            )));
        }

        let block_id = proposal.block_id()?;
        if let Some(existing) = self.block_id {
            if existing == block_id && self.proposal.as_ref() == Some(&proposal) {
                return Ok(false);
            }
            return Err(ConsensusError::Equivocation {
                validator_index: self.proposer,
                height: self.height,
                round: self.round,
            });
        }

        self.block_id = Some(block_id);
        self.proposal = Some(proposal);
        self.advance(RoundStep::HasProposal)?;
        Ok(true)
    }

    pub fn add_prevote(&mut self, vote: Vote) -> Result<bool, VoteError> {
        self.prevotes.add_vote(vote)
    }

    pub fn add_precommit(&mut self, vote: Vote) -> Result<bool, VoteError> {
        self.precommits.add_vote(vote)
    }

    /// Route a vote to the set of its kind
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteError> {
        match vote.kind {
            VoteKind::Prevote => self.add_prevote(vote),
            VoteKind::Precommit => self.add_precommit(vote),
        }
    }

    pub fn prevotes(&self) -> &VoteSet {
        &self.prevotes
    }

    pub fn precommits(&self) -> &VoteSet {
        &self.precommits
    }

    pub fn votes(&self, kind: VoteKind) -> &VoteSet {
        match kind {
            VoteKind::Prevote => &self.prevotes,
            VoteKind::Precommit => &self.precommits,
        }
    }

    /// Prevote quorum for the proposed block
    pub fn has_prevote_quorum_for_proposal(&self) -> bool {
        self.block_id
            .is_some_and(|id| self.prevotes.has_quorum_for(Some(id)))
    }

    /// Precommit quorum for the proposed block
    pub fn has_precommit_quorum_for_proposal(&self) -> bool {
        self.block_id
            .is_some_and(|id| self.precommits.has_quorum_for(Some(id)))
    }

    /// More than a third of the power voted here in either phase
    pub fn has_minority_prevotes_or_precommits(&self) -> bool {
        self.prevotes.has_minority() || self.precommits.has_minority()
    }

    pub fn lock_state(&self) -> &LockState {
        &self.lock
    }

    pub fn set_lock_state(&mut self, lock: LockState) {
        self.lock = lock;
    }

    pub fn step(&self) -> RoundStep {
        self.step
    }

    /// Move the step forward; moving backwards is an error
    pub fn advance(&mut self, step: RoundStep) -> ConsensusResult<()> {
        if step < self.step {
            return Err(ConsensusError::Other(format!(
                "round {}/{} cannot go from {:?} back to {:?}",
                self.height, self.round, self.step, step
            )));
        }
        self.step = step;
        Ok(())
    }
}

impl ProcessableUnit for RoundState {
    fn height(&self) -> Height {
        self.height
    }

    fn round(&self) -> Round {
        self.round
    }

    fn block(&self) -> Option<&Block> {
        self.proposal.as_ref().map(|p| &p.block)
    }

    fn processor_result(&self) -> Option<bool> {
        self.processor_result
    }

    fn set_processor_result(&mut self, result: bool) {
        self.processor_result = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{proposal, signed_vote, validator_set};
    use chain_core::Hash;

    fn round_state() -> RoundState {
        RoundState::new(1, 0, validator_set(4), 0)
    }

    #[test]
    fn test_set_proposal() {
        let mut state = round_state();
        let p = proposal(1, 0, 0);
        let id = p.block_id().unwrap();

        assert!(state.set_proposal(p.clone()).unwrap());
        assert!(!state.set_proposal(p).unwrap());
        assert_eq!(state.block_id(), Some(id));
        assert_eq!(state.step(), RoundStep::HasProposal);
    }

    #[test]
    fn test_proposal_from_wrong_proposer_rejected() {
        let mut state = round_state();
        assert!(matches!(
            state.set_proposal(proposal(1, 0, 2)),
            Err(ConsensusError::Malformed(_))
        ));
        assert!(state.proposal().is_none());
    }

    #[test]
    fn test_step_is_monotonic() {
        let mut state = round_state();
        state.advance(RoundStep::Prevoted).unwrap();
        state.advance(RoundStep::Decided).unwrap();
        assert!(state.advance(RoundStep::Precommitted).is_err());
        assert_eq!(state.step(), RoundStep::Decided);
    }

    #[test]
    fn test_minority_and_quorum_queries() {
        let mut state = round_state();
        let p = proposal(1, 0, 0);
        let id = Some(p.block_id().unwrap());
        state.set_proposal(p).unwrap();

        state.add_vote(signed_vote(VoteKind::Precommit, 1, 0, None, 1)).unwrap();
        assert!(!state.has_minority_prevotes_or_precommits());
        state.add_vote(signed_vote(VoteKind::Prevote, 1, 0, id, 2)).unwrap();
        state.add_vote(signed_vote(VoteKind::Prevote, 1, 0, id, 3)).unwrap();
        assert!(state.has_minority_prevotes_or_precommits());
        assert!(!state.has_prevote_quorum_for_proposal());

        state.add_vote(signed_vote(VoteKind::Prevote, 1, 0, id, 0)).unwrap();
        assert!(state.has_prevote_quorum_for_proposal());
        assert!(!state.prevotes().has_vote(1));
    }

    #[test]
    fn test_lock_snapshot() {
        let mut state = RoundState::new(10, 2, validator_set(4), 2);
        let v = Hash::digest(b"v");
        let mut lock = LockState::default();
        lock.lock(2, v);
        state.set_lock_state(lock);
        assert_eq!(state.lock_state().locked_value, Some(v));
        assert_eq!(state.lock_state().locked_round, Some(2));
    }
}
