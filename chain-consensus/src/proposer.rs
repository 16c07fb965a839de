//! Proposer selection
//!
//! A selector maps `(height, round)` to the index of the validator expected
//! to propose. Every honest node must compute the same index, so selectors
//! are pure functions of their inputs and the active set size.

use crate::config::ProposerPolicy;
use chain_core::{Height, Round, ValidatorIndex};
use parking_lot::Mutex;
use std::sync::Arc;

/// Deterministic choice of the proposer for a round
pub trait ProposerSelector: Send + Sync {
    /// Index into an active set of `validator_count` validators
    fn validator_index(
        &self,
        height: Height,
        round: Round,
        validator_count: usize,
    ) -> ValidatorIndex;
}

/// Validator `round mod N`
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinSelector;

impl ProposerSelector for RoundRobinSelector {
    fn validator_index(&self, _height: Height, round: Round, validator_count: usize) -> ValidatorIndex {
        if validator_count == 0 {
            return 0;
        }
        round as usize % validator_count
    }
}

/// Height-seeded permutation of the active set
///
/// Each height gets a Fisher-Yates shuffle of `0..N` driven by a blake3 XOF
/// over the height; round `r` is proposed by `permutation[r mod N]`. Within a
/// height every validator proposes once before any proposes twice.
#[derive(Debug, Default)]
pub struct ShuffledSelector {
    cache: Mutex<Option<(Height, Vec<ValidatorIndex>)>>,
}

impl ShuffledSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permutation of `0..validator_count` for `height`
    pub fn permutation(height: Height, validator_count: usize) -> Vec<ValidatorIndex> {
        let mut order: Vec<ValidatorIndex> = (0..validator_count).collect();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"proposer-shuffle");
        hasher.update(&height.to_le_bytes());
        let mut reader = hasher.finalize_xof();

        for i in (1..validator_count).rev() {
            let mut word = [0u8; 8];
            reader.fill(&mut word);
            let j = (u64::from_le_bytes(word) % (i as u64 + 1)) as usize;
            order.swap(i, j);
        }
        order
    }
}

impl ProposerSelector for ShuffledSelector {
    fn validator_index(&self, height: Height, round: Round, validator_count: usize) -> ValidatorIndex {
        if validator_count == 0 {
            return 0;
        }

        let mut cache = self.cache.lock();
        let fresh = match cache.as_ref() {
            Some((cached, order)) => *cached != height || order.len() != validator_count,
            None => true,
        };
        if fresh {
            *cache = Some((height, Self::permutation(height, validator_count)));
        }

        match cache.as_ref() {
            Some((_, order)) => order[round as usize % validator_count],
            None => round as usize % validator_count,
        }
    }
}

impl ProposerPolicy {
    /// Selector implementing this policy
    pub fn selector(self) -> Arc<dyn ProposerSelector> {
        match self {
            ProposerPolicy::RoundRobin => Arc::new(RoundRobinSelector),
            ProposerPolicy::Shuffled => Arc::new(ShuffledSelector::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_round_robin_rotates_by_round() {
        let selector = RoundRobinSelector;
        let picked: Vec<_> = (0..8).map(|r| selector.validator_index(5, r, 4)).collect();
        assert_eq!(picked, vec![0, 1, 2, 3, 0, 1, 2, 3]);
        // Height does not matter
        assert_eq!(selector.validator_index(99, 2, 4), 2);
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        for height in 0..20 {
            let order = ShuffledSelector::permutation(height, 7);
            let unique: HashSet<_> = order.iter().copied().collect();
            assert_eq!(unique.len(), 7);
            assert!(order.iter().all(|&i| i < 7));
        }
    }

    #[test]
    fn test_shuffle_is_deterministic_per_height() {
        let a = ShuffledSelector::new();
        let b = ShuffledSelector::new();
        for round in 0..10 {
            assert_eq!(a.validator_index(3, round, 5), b.validator_index(3, round, 5));
        }

        let differs = (0..10).any(|h| {
            ShuffledSelector::permutation(h, 8) != ShuffledSelector::permutation(h + 1, 8)
        });
        assert!(differs);
    }

    #[test]
    fn test_shuffle_visits_everyone_once_per_cycle() {
        let selector = ShuffledSelector::new();
        let picked: HashSet<_> = (0..4).map(|r| selector.validator_index(11, r, 4)).collect();
        assert_eq!(picked.len(), 4);
        assert_eq!(selector.validator_index(11, 0, 4), selector.validator_index(11, 4, 4));
    }
}
