//! Misbehaviour detection
//!
//! Equivocation evidence is produced by vote sets when a validator signs two
//! different values for the same (height, round, kind). Missed proposals are
//! counted per proposer and reset when the proposer delivers.

use chain_core::{Height, Timestamp, ValidatorIndex, Vote};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Evidence of two conflicting votes by one validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivocationEvidence {
    /// Validator index who equivocated
    pub validator_index: ValidatorIndex,
    /// Vote recorded first (the one that counts)
    pub first: Vote,
    /// Conflicting vote
    pub second: Vote,
    /// Milliseconds since the epoch when the conflict was detected
    pub detected_at: Timestamp,
}

impl EquivocationEvidence {
    pub fn new(first: Vote, second: Vote) -> Self {
        Self {
            validator_index: first.validator_index,
            first,
            second,
            detected_at: crate::scheduler::now_millis(),
        }
    }

    pub fn height(&self) -> Height {
        self.first.height
    }
}

/// Misbehaviour types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Misbehaviour {
    /// Conflicting votes in one round
    Equivocation(EquivocationEvidence),
    /// Proposer failed to deliver too many times in a row
    Offline {
        validator_index: ValidatorIndex,
        missed_proposals: u64,
    },
}

/// Tracks validator behaviour across rounds
#[derive(Debug)]
pub struct MisbehaviourTracker {
    equivocations: Vec<EquivocationEvidence>,
    missed_proposals: HashMap<ValidatorIndex, u64>,
    max_missed_proposals: u64,
}

impl MisbehaviourTracker {
    pub fn new(max_missed_proposals: u64) -> Self {
        Self {
            equivocations: Vec::new(),
            missed_proposals: HashMap::new(),
            max_missed_proposals,
        }
    }

    /// Store evidence; repeated evidence for the same vote pair is kept once
    pub fn record_equivocation(&mut self, evidence: EquivocationEvidence) -> Option<Misbehaviour> {
        let known = self.equivocations.iter().any(|e| {
            e.validator_index == evidence.validator_index
                && e.first == evidence.first
                && e.second == evidence.second
        });
        if known {
            return None;
        }
        self.equivocations.push(evidence.clone());
        Some(Misbehaviour::Equivocation(evidence))
    }

    /// Record a round whose proposer never delivered
    pub fn record_missed_proposal(&mut self, validator_index: ValidatorIndex) -> Option<Misbehaviour> {
        let missed = self.missed_proposals.entry(validator_index).or_insert(0);
        *missed += 1;

        if *missed >= self.max_missed_proposals {
            Some(Misbehaviour::Offline {
                validator_index,
                missed_proposals: *missed,
            })
        } else {
            None
        }
    }

    /// Reset missed proposals for a validator (called when they deliver)
    pub fn reset_missed_proposals(&mut self, validator_index: ValidatorIndex) {
        self.missed_proposals.remove(&validator_index);
    }

    pub fn missed_proposals(&self, validator_index: ValidatorIndex) -> u64 {
        self.missed_proposals
            .get(&validator_index)
            .copied()
            .unwrap_or(0)
    }

    pub fn evidence(&self) -> &[EquivocationEvidence] {
        &self.equivocations
    }

    /// Drop evidence for heights below `height`
    pub fn prune_below(&mut self, height: Height) {
        self.equivocations.retain(|e| e.height() >= height);
    }
}
