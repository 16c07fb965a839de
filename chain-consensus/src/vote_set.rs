//! Votes of one kind collected for a single (height, round)

use crate::error::VoteError;
use crate::evidence::EquivocationEvidence;
use crate::validator_set::ValidatorSet;
use crate::{ConsensusError, ConsensusResult};
use chain_core::{
    AggregatedSignature, BlockId, BlsSignature, ConsensusSignature, Height, Round, ValidatorBitmask,
    ValidatorIndex, Vote, VoteKind,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Signature-checked votes keyed by validator index. At most one vote per
/// validator is kept; the first one wins.
#[derive(Debug, Clone)]
pub struct VoteSet {
    kind: VoteKind,
    height: Height,
    round: Round,
    validators: Arc<ValidatorSet>,
    votes: BTreeMap<ValidatorIndex, Vote>,
    power_by_value: HashMap<Option<BlockId>, u64>,
    represented_power: u64,
}

impl VoteSet {
    pub fn new(kind: VoteKind, height: Height, round: Round, validators: Arc<ValidatorSet>) -> Self {
        Self {
            kind,
            height,
            round,
            validators,
            votes: BTreeMap::new(),
            power_by_value: HashMap::new(),
            represented_power: 0,
        }
    }

    pub fn kind(&self) -> VoteKind {
        self.kind
    }

    /// Add a vote whose signature was already checked.
    ///
    /// Returns `Ok(true)` when the vote was new and `Ok(false)` for an exact
    /// replay. A second vote with a different value is equivocation; the
    /// first vote stays counted.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteError> {
        if vote.validator_index >= self.validators.len() {
            return Err(VoteError::UnknownValidator {
                index: vote.validator_index,
                size: self.validators.len(),
            });
        }
        if vote.kind != self.kind || vote.height != self.height || vote.round != self.round {
            return Err(VoteError::Mismatch(format!(
                "{} {}/{} offered to {} set {}/{}",
                vote.kind, vote.height, vote.round, self.kind, self.height, self.round
            )));
        }

        if let Some(existing) = self.votes.get(&vote.validator_index) {
            if existing.block_id == vote.block_id {
                return Ok(false);
            }
            return Err(VoteError::Equivocation(Box::new(EquivocationEvidence::new(
                existing.clone(),
                vote,
            ))));
        }

        let power = self.validators.voting_power(vote.validator_index);
        *self.power_by_value.entry(vote.block_id).or_insert(0) += power;
        self.represented_power += power;
        self.votes.insert(vote.validator_index, vote);
        Ok(true)
    }

    pub fn get(&self, index: ValidatorIndex) -> Option<&Vote> {
        self.votes.get(&index)
    }

    pub fn has_vote(&self, index: ValidatorIndex) -> bool {
        self.votes.contains_key(&index)
    }

    /// Power behind one value; `None` is nil
    pub fn power_for(&self, block_id: Option<BlockId>) -> u64 {
        self.power_by_value.get(&block_id).copied().unwrap_or(0)
    }

    /// Power of all votes regardless of value
    pub fn represented_power(&self) -> u64 {
        self.represented_power
    }

    pub fn has_quorum_for(&self, block_id: Option<BlockId>) -> bool {
        self.validators.has_quorum(self.power_for(block_id))
    }

    pub fn has_quorum_any(&self) -> bool {
        self.validators.has_quorum(self.represented_power)
    }

    pub fn has_minority(&self) -> bool {
        self.validators.has_minority(self.represented_power)
    }

    /// Non-nil value holding a quorum, if any
    pub fn quorum_value(&self) -> Option<BlockId> {
        self.power_by_value.iter().find_map(|(value, power)| match value {
            Some(id) if self.validators.has_quorum(*power) => Some(*id),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Votes in validator index order
    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.values()
    }

    /// Bitmask and signatures of exactly the votes for `block_id`, or `None`
    /// when nobody voted for it
    pub fn signers_of(&self, block_id: Option<BlockId>) -> Option<(ValidatorBitmask, Vec<BlsSignature>)> {
        let matching: Vec<&Vote> = self.votes().filter(|v| v.block_id == block_id).collect();
        if matching.is_empty() {
            return None;
        }

        let bitmask = ValidatorBitmask::from_indices(
            self.validators.len(),
            matching.iter().map(|v| v.validator_index),
        );
        let signatures = matching.iter().map(|v| v.signature.clone()).collect();
        Some((bitmask, signatures))
    }

    /// Certificate over exactly the votes for `block_id`
    pub fn build_certificate(
        &self,
        block_id: Option<BlockId>,
        signature: &dyn ConsensusSignature,
    ) -> ConsensusResult<AggregatedSignature> {
        let (bitmask, signatures) = self.signers_of(block_id).ok_or_else(|| {
            ConsensusError::Other(format!(
                "no {} votes for the requested value at {}/{}",
                self.kind, self.height, self.round
            ))
        })?;
        Ok(AggregatedSignature {
            bitmask,
            signature: signature.aggregate(&signatures)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{signed_vote, validator_set};
    use chain_core::{Bls12381, Hash};

    fn prevotes() -> VoteSet {
        VoteSet::new(VoteKind::Prevote, 1, 0, validator_set(4))
    }

    #[test]
    fn test_quorum_counting() {
        let id = Some(Hash::digest(b"block"));
        let mut set = prevotes();

        assert!(set.add_vote(signed_vote(VoteKind::Prevote, 1, 0, id, 0)).unwrap());
        assert!(set.add_vote(signed_vote(VoteKind::Prevote, 1, 0, id, 1)).unwrap());
        assert!(!set.has_quorum_for(id));
        assert!(set.has_minority());

        assert!(set.add_vote(signed_vote(VoteKind::Prevote, 1, 0, None, 2)).unwrap());
        assert!(set.has_quorum_any());
        assert!(!set.has_quorum_for(id));
        assert!(set.quorum_value().is_none());

        assert!(set.add_vote(signed_vote(VoteKind::Prevote, 1, 0, id, 3)).unwrap());
        assert!(set.has_quorum_for(id));
        assert_eq!(set.quorum_value(), id);
        assert_eq!(set.power_for(None), 1);
        assert_eq!(set.represented_power(), 4);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let id = Some(Hash::digest(b"block"));
        let mut set = prevotes();
        let vote = signed_vote(VoteKind::Prevote, 1, 0, id, 2);

        assert!(set.add_vote(vote.clone()).unwrap());
        assert!(!set.add_vote(vote.clone()).unwrap());
        assert!(!set.add_vote(vote).unwrap());
        assert_eq!(set.power_for(id), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_equivocation_keeps_first_vote() {
        let a = Some(Hash::digest(b"a"));
        let b = Some(Hash::digest(b"b"));
        let mut set = prevotes();
        set.add_vote(signed_vote(VoteKind::Prevote, 1, 0, a, 1)).unwrap();

        let err = set
            .add_vote(signed_vote(VoteKind::Prevote, 1, 0, b, 1))
            .unwrap_err();
        match err {
            VoteError::Equivocation(evidence) => {
                assert_eq!(evidence.validator_index, 1);
                assert_eq!(evidence.first.block_id, a);
                assert_eq!(evidence.second.block_id, b);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(set.power_for(a), 1);
        assert_eq!(set.power_for(b), 0);
    }

    #[test]
    fn test_rejects_foreign_votes() {
        let mut set = prevotes();
        assert!(matches!(
            set.add_vote(signed_vote(VoteKind::Prevote, 1, 0, None, 4)),
            Err(VoteError::UnknownValidator { index: 4, size: 4 })
        ));
        assert!(matches!(
            set.add_vote(signed_vote(VoteKind::Precommit, 1, 0, None, 0)),
            Err(VoteError::Mismatch(_))
        ));
        assert!(matches!(
            set.add_vote(signed_vote(VoteKind::Prevote, 1, 1, None, 0)),
            Err(VoteError::Mismatch(_))
        ));
        assert!(set.is_empty());
    }

    #[test]
    fn test_certificate_covers_only_matching_votes() {
        let id = Some(Hash::digest(b"block"));
        let mut set = prevotes();
        for i in [0, 2, 3] {
            set.add_vote(signed_vote(VoteKind::Prevote, 1, 0, id, i)).unwrap();
        }
        set.add_vote(signed_vote(VoteKind::Prevote, 1, 0, None, 1)).unwrap();

        let certificate = set.build_certificate(id, &Bls12381).unwrap();
        assert_eq!(certificate.bitmask.set_indices().collect::<Vec<_>>(), vec![0, 2, 3]);
        assert_eq!(certificate.bitmask.to_string(), "1011");

        assert!(set.build_certificate(Some(Hash::digest(b"other")), &Bls12381).is_err());
    }
}
