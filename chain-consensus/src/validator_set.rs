//! Active validator set and quorum arithmetic

use crate::config::QuorumPolicy;
use crate::{ConsensusError, ConsensusResult};
use chain_core::{
    Address, BlsPublicKey, Height, ValidatorBitmask, ValidatorIndex, VotingPower, WalletPublicKey,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Validator information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Wallet address
    pub address: Address,
    /// Key votes and proposals are signed with
    pub consensus_public_key: BlsPublicKey,
    /// Key that appears as block generator
    pub wallet_public_key: WalletPublicKey,
    pub voting_power: VotingPower,
}

/// Ordered, immutable set of validators active at a height.
/// A validator's position is its [`ValidatorIndex`].
#[derive(Debug, Clone)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    policy: QuorumPolicy,
    total_power: u64,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Validator>, policy: QuorumPolicy) -> ConsensusResult<Self> {
        if validators.is_empty() {
            return Err(ConsensusError::Config(
                "validator set must not be empty".to_string(),
            ));
        }

        let mut keys = HashSet::new();
        for (i, validator) in validators.iter().enumerate() {
            if validator.voting_power == 0 {
                return Err(ConsensusError::Config(format!(
                    "validator {} has no voting power",
                    i
                )));
            }
            if !keys.insert(validator.consensus_public_key.clone()) {
                return Err(ConsensusError::Config(format!(
                    "duplicate consensus key for validator {}",
                    i
                )));
            }
        }

        let total_power = match policy {
            QuorumPolicy::EqualWeight => validators.len() as u64,
            QuorumPolicy::VotingPower => validators
                .iter()
                .try_fold(0u64, |acc, v| acc.checked_add(v.voting_power))
                .ok_or_else(|| ConsensusError::Config("total voting power overflows".into()))?,
        };

        Ok(Self {
            validators,
            policy,
            total_power,
        })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Always false; construction rejects empty sets
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.policy
    }

    /// Get validator by index
    pub fn get(&self, index: ValidatorIndex) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn index_of_consensus_key(&self, key: &BlsPublicKey) -> Option<ValidatorIndex> {
        self.validators
            .iter()
            .position(|v| &v.consensus_public_key == key)
    }

    /// Weight of one validator's vote; zero for indices outside the set
    pub fn voting_power(&self, index: ValidatorIndex) -> u64 {
        match (self.policy, self.validators.get(index)) {
            (_, None) => 0,
            (QuorumPolicy::EqualWeight, Some(_)) => 1,
            (QuorumPolicy::VotingPower, Some(v)) => v.voting_power,
        }
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// Smallest power that forms a quorum: `⌈2·total/3⌉`
    pub fn quorum_threshold(&self) -> u64 {
        let doubled = self.total_power as u128 * 2;
        doubled.div_ceil(3) as u64
    }

    pub fn has_quorum(&self, power: u64) -> bool {
        power >= self.quorum_threshold()
    }

    /// More than a third of the total power
    pub fn has_minority(&self, power: u64) -> bool {
        power as u128 * 3 > self.total_power as u128
    }

    /// Combined power of the validators set in `bitmask`
    pub fn power_of(&self, bitmask: &ValidatorBitmask) -> u64 {
        bitmask
            .set_indices()
            .map(|index| self.voting_power(index))
            .sum()
    }

    /// Consensus keys of the validators set in `bitmask`, in index order
    pub fn consensus_keys_of(&self, bitmask: &ValidatorBitmask) -> ConsensusResult<Vec<BlsPublicKey>> {
        bitmask
            .set_indices()
            .map(|index| {
                self.get(index)
                    .map(|v| v.consensus_public_key.clone())
                    .ok_or_else(|| {
                        ConsensusError::Malformed(format!("bitmask references validator {}", index))
                    })
            })
            .collect()
    }
}

/// Source of the validator set active at a height
pub trait ValidatorSetProvider: Send + Sync {
    fn active_validators(&self, height: Height) -> ConsensusResult<Arc<ValidatorSet>>;
}

/// Provider returning the same set for every height
#[derive(Debug, Clone)]
pub struct StaticValidatorSet {
    validators: Arc<ValidatorSet>,
}

impl StaticValidatorSet {
    pub fn new(validators: ValidatorSet) -> Self {
        Self {
            validators: Arc::new(validators),
        }
    }
}

impl ValidatorSetProvider for StaticValidatorSet {
    fn active_validators(&self, _height: Height) -> ConsensusResult<Arc<ValidatorSet>> {
        Ok(self.validators.clone())
    }
}
