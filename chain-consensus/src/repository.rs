//! Live round states of the current and next height

use crate::proposer::ProposerSelector;
use crate::round_state::RoundState;
use crate::validator_set::ValidatorSetProvider;
use crate::{ConsensusError, ConsensusResult};
use chain_core::{ConsensusStateData, Height, Proposal, Round, Vote};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub type SharedRoundState = Arc<Mutex<RoundState>>;

/// Get-or-create store of [`RoundState`]s keyed by (height, round).
///
/// Each round state sits behind its own mutex. Callers must not hold one of
/// those locks across an `.await`.
pub struct RoundStateRepository {
    validators: Arc<dyn ValidatorSetProvider>,
    selector: Arc<dyn ProposerSelector>,
    states: RwLock<BTreeMap<(Height, Round), SharedRoundState>>,
}

impl RoundStateRepository {
    pub fn new(validators: Arc<dyn ValidatorSetProvider>, selector: Arc<dyn ProposerSelector>) -> Self {
        Self {
            validators,
            selector,
            states: RwLock::new(BTreeMap::new()),
        }
    }

    /// Round state for (height, round), created on first access
    pub fn get_round_state(&self, height: Height, round: Round) -> ConsensusResult<SharedRoundState> {
        if let Some(state) = self.states.read().get(&(height, round)) {
            return Ok(state.clone());
        }

        let validators = self.validators.active_validators(height)?;
        let proposer = self
            .selector
            .validator_index(height, round, validators.len());

        let mut states = self.states.write();
        let state = states
            .entry((height, round))
            .or_insert_with(|| {
                debug!("Created round state {}/{} (proposer {})", height, round, proposer);
                Arc::new(Mutex::new(RoundState::new(height, round, validators, proposer)))
            })
            .clone();
        Ok(state)
    }

    /// Round state for (height, round) if it exists
    pub fn existing(&self, height: Height, round: Round) -> Option<SharedRoundState> {
        self.states.read().get(&(height, round)).cloned()
    }

    /// All live round states in (height, round) order
    pub fn round_states(&self) -> Vec<SharedRoundState> {
        self.states.read().values().cloned().collect()
    }

    /// Rounds with state at `height`, ascending
    pub fn rounds_at(&self, height: Height) -> Vec<Round> {
        self.states
            .read()
            .range((height, 0)..=(height, Round::MAX))
            .map(|((_, round), _)| *round)
            .collect()
    }

    /// Read-only copy, for reads that span rounds without holding two locks
    pub fn snapshot_round(&self, height: Height, round: Round) -> Option<RoundState> {
        self.existing(height, round).map(|state| state.lock().clone())
    }

    /// Drop every round state below `height`
    pub fn prune_below(&self, height: Height) {
        let mut states = self.states.write();
        let kept = states.split_off(&(height, 0));
        let dropped = states.len();
        *states = kept;
        if dropped > 0 {
            debug!("Pruned {} round states below height {}", dropped, height);
        }
    }

    pub fn clear(&self) {
        self.states.write().clear();
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Rebuild round states from persisted artifacts. Every artifact was
    /// signature-checked before it was stored, so it is not verified again;
    /// anything that no longer fits is treated as corruption.
    pub fn restore(
        &self,
        proposals: Vec<Proposal>,
        prevotes: Vec<Vote>,
        precommits: Vec<Vote>,
        state: Option<&ConsensusStateData>,
    ) -> ConsensusResult<()> {
        let corrupt = |what: &str, e: ConsensusError| {
            ConsensusError::StorageCorruption(format!("stored {} does not restore: {}", what, e))
        };

        let (proposal_count, vote_count) = (proposals.len(), prevotes.len() + precommits.len());
        for proposal in proposals {
            let round_state = self.get_round_state(proposal.height, proposal.round)?;
            round_state
                .lock()
                .set_proposal(proposal)
                .map_err(|e| corrupt("proposal", e))?;
        }

        for vote in prevotes.into_iter().chain(precommits) {
            let round_state = self.get_round_state(vote.height, vote.round)?;
            round_state
                .lock()
                .add_vote(vote)
                .map_err(|e| corrupt("vote", e.into()))?;
        }

        if let Some(state) = state {
            let round_state = self.get_round_state(state.height, state.round)?;
            round_state.lock().set_lock_state(state.lock.clone());
        }

        info!(
            "Restored {} proposals and {} votes into {} round states",
            proposal_count,
            vote_count,
            self.len()
        );
        Ok(())
    }
}

impl std::fmt::Debug for RoundStateRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundStateRepository")
            .field("rounds", &self.states.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposer::RoundRobinSelector;
    use crate::test_utils::{proposal, signed_vote, validator_set};
    use crate::validator_set::StaticValidatorSet;
    use chain_core::{Hash, LockState, Step, VoteKind};

    fn repository() -> RoundStateRepository {
        let provider = StaticValidatorSet::new((*validator_set(4)).clone());
        RoundStateRepository::new(Arc::new(provider), Arc::new(RoundRobinSelector))
    }

    #[test]
    fn test_get_or_create_returns_same_state() {
        let repo = repository();
        let a = repo.get_round_state(1, 2).unwrap();
        let b = repo.get_round_state(1, 2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.lock().proposer(), 2);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_prune_and_enumerate() {
        let repo = repository();
        for (h, r) in [(1, 0), (1, 3), (2, 0), (2, 1), (3, 0)] {
            repo.get_round_state(h, r).unwrap();
        }
        assert_eq!(repo.rounds_at(2), vec![0, 1]);

        repo.prune_below(2);
        let remaining: Vec<_> = repo
            .round_states()
            .iter()
            .map(|s| {
                let s = s.lock();
                (s.height(), s.round())
            })
            .collect();
        assert_eq!(remaining, vec![(2, 0), (2, 1), (3, 0)]);

        repo.clear();
        assert!(repo.is_empty());
    }

    #[test]
    fn test_restore_rehydrates_votes_and_lock() {
        let repo = repository();
        let p = proposal(10, 2, 2);
        let v = p.block_id().unwrap();
        let mut lock = LockState::default();
        lock.lock(2, v);
        let state = ConsensusStateData {
            height: 10,
            round: 2,
            step: Step::Precommit,
            lock,
        };

        repo.restore(
            vec![p],
            vec![signed_vote(VoteKind::Prevote, 10, 2, Some(v), 0)],
            vec![signed_vote(VoteKind::Precommit, 10, 2, Some(v), 0)],
            Some(&state),
        )
        .unwrap();

        let restored = repo.snapshot_round(10, 2).unwrap();
        assert_eq!(restored.block_id(), Some(v));
        assert!(restored.precommits().has_vote(0));
        assert_eq!(restored.lock_state().locked_value, Some(v));
        assert_eq!(restored.lock_state().locked_round, Some(2));
    }

    #[test]
    fn test_conflicting_stored_votes_are_corruption() {
        let repo = repository();
        let err = repo
            .restore(
                vec![],
                vec![
                    signed_vote(VoteKind::Prevote, 5, 0, Some(Hash::digest(b"a")), 1),
                    signed_vote(VoteKind::Prevote, 5, 0, Some(Hash::digest(b"b")), 1),
                ],
                vec![],
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ConsensusError::StorageCorruption(_)));
    }
}
