//! Consensus configuration

use crate::validator_set::{Validator, ValidatorSet};
use crate::{ConsensusError, ConsensusResult};
use chain_core::{Address, BlsPublicKey, WalletPublicKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How votes are weighted when counting towards a quorum
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Every validator counts once; quorum is `⌈2n/3⌉`
    #[default]
    EqualWeight,
    /// Validators count with their voting power; quorum is `⌈2·Σpower/3⌉`
    VotingPower,
}

/// Proposer rotation policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposerPolicy {
    /// Validator `round mod N`
    #[default]
    RoundRobin,
    /// Height-seeded permutation of the active set, indexed by `round mod N`
    Shuffled,
}

/// Protocol timing, all values in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Target distance between consecutive block timestamps
    pub block_time: u64,
    /// Minimum time a proposer waits after a round starts before proposing
    pub block_prepare_time: u64,
    /// Length of a stage in round 0
    pub stage_timeout: u64,
    /// Added to the stage length for every further round
    pub stage_timeout_increase: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            block_time: 8_000,
            block_prepare_time: 4_000,
            stage_timeout: 1_000,
            stage_timeout_increase: 2_000,
        }
    }
}

/// Validator entry of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Wallet address, `0x` prefixed hex
    pub address: String,
    /// Compressed BLS public key, hex
    pub consensus_public_key: String,
    /// Compressed secp256k1 public key, hex
    pub wallet_public_key: String,
    /// Voting power (used by [`QuorumPolicy::VotingPower`])
    pub voting_power: u64,
}

/// Consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Active validator set, in index order
    pub validators: Vec<ValidatorConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub quorum_policy: QuorumPolicy,
    #[serde(default)]
    pub proposer_policy: ProposerPolicy,
    /// Threads in the signature worker pool
    pub crypto_workers: usize,
    /// Bounded queue length of each worker
    pub worker_queue_depth: usize,
    /// Messages for rounds further ahead than this are dropped
    pub max_round_lookahead: u32,
    /// Consecutive missed proposals before a proposer is reported offline
    pub missed_proposal_threshold: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            validators: vec![],
            timeouts: TimeoutConfig::default(),
            quorum_policy: QuorumPolicy::default(),
            proposer_policy: ProposerPolicy::default(),
            crypto_workers: 2,
            worker_queue_depth: 256,
            max_round_lookahead: 10,
            missed_proposal_threshold: 10,
        }
    }
}

impl ConsensusConfig {
    /// Create a new configuration for the given validators
    pub fn new(validators: Vec<ValidatorConfig>) -> Self {
        Self {
            validators,
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConsensusResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConsensusError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ConsensusConfig = serde_json::from_str(&content)
            .map_err(|e| ConsensusError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConsensusResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .map_err(|e| ConsensusError::Config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_quorum_policy(mut self, policy: QuorumPolicy) -> Self {
        self.quorum_policy = policy;
        self
    }

    pub fn with_proposer_policy(mut self, policy: ProposerPolicy) -> Self {
        self.proposer_policy = policy;
        self
    }

    pub fn with_crypto_workers(mut self, workers: usize) -> Self {
        self.crypto_workers = workers;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConsensusResult<()> {
        if self.validators.is_empty() {
            return Err(ConsensusError::Config(
                "At least one validator is required".to_string(),
            ));
        }

        if self.timeouts.block_time == 0 || self.timeouts.stage_timeout == 0 {
            return Err(ConsensusError::Config(
                "Block time and stage timeout must be greater than 0".to_string(),
            ));
        }

        if self.crypto_workers == 0 || self.worker_queue_depth == 0 {
            return Err(ConsensusError::Config(
                "Crypto worker pool needs at least one worker and a non-empty queue".to_string(),
            ));
        }

        for (i, validator) in self.validators.iter().enumerate() {
            if validator.address.len() != 42 || !validator.address.starts_with("0x") {
                return Err(ConsensusError::Config(format!(
                    "Invalid address format for validator {}: {}",
                    i, validator.address
                )));
            }

            if validator.voting_power == 0 {
                return Err(ConsensusError::Config(format!(
                    "Validator {} voting power must be greater than 0",
                    i
                )));
            }
        }

        Ok(())
    }

    /// Decode the validator entries into the active set
    pub fn to_validator_set(&self) -> ConsensusResult<ValidatorSet> {
        let validators = self
            .validators
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let invalid = |what: &str, e: chain_core::CoreError| {
                    ConsensusError::Config(format!("Invalid {} for validator {}: {}", what, i, e))
                };
                let validator = Validator {
                    address: Address::from_hex(&entry.address).map_err(|e| invalid("address", e))?,
                    consensus_public_key: BlsPublicKey::from_hex(&entry.consensus_public_key)
                        .map_err(|e| invalid("consensus key", e))?,
                    wallet_public_key: WalletPublicKey::from_hex(&entry.wallet_public_key)
                        .map_err(|e| invalid("wallet key", e))?,
                    voting_power: entry.voting_power,
                };
                let derived = validator
                    .wallet_public_key
                    .to_address()
                    .map_err(|e| invalid("wallet key", e))?;
                if derived != validator.address {
                    return Err(ConsensusError::Config(format!(
                        "Address of validator {} does not match its wallet key",
                        i
                    )));
                }
                Ok(validator)
            })
            .collect::<ConsensusResult<Vec<_>>>()?;

        ValidatorSet::new(validators, self.quorum_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_core::{BlsKeyPair, Signer, WalletKeyPair};

    fn validator_config(i: usize) -> ValidatorConfig {
        let wallet = WalletKeyPair::from_seed(format!("wallet-{i}").as_bytes()).unwrap();
        let consensus = BlsKeyPair::from_seed(format!("consensus-{i}").as_bytes()).unwrap();
        ValidatorConfig {
            address: wallet.address().unwrap().to_string(),
            consensus_public_key: consensus.public_key().to_hex(),
            wallet_public_key: wallet.public_key().to_hex(),
            voting_power: 1,
        }
    }

    #[test]
    fn test_config_validation() {
        let config = ConsensusConfig::default();
        assert!(config.validate().is_err());

        let config = ConsensusConfig::new(vec![validator_config(0)]);
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.validators[0].voting_power = 0;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.validators[0].address = "invalid".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_to_validator_set() {
        let config = ConsensusConfig::new((0..4).map(validator_config).collect());
        let set = config.to_validator_set().unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(set.quorum_threshold(), 3);
    }

    #[test]
    fn test_mismatched_address_rejected() {
        let mut entries: Vec<_> = (0..2).map(validator_config).collect();
        entries[0].address = entries[1].address.clone();
        let err = ConsensusConfig::new(entries).to_validator_set().unwrap_err();
        assert!(matches!(err, ConsensusError::Config(_)));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("consensus.json");
        let config = ConsensusConfig::new(vec![validator_config(0)])
            .with_proposer_policy(ProposerPolicy::Shuffled);

        config.save_to_file(&path).unwrap();
        let loaded = ConsensusConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.validators, config.validators);
        assert_eq!(loaded.proposer_policy, ProposerPolicy::Shuffled);
        assert_eq!(loaded.timeouts, TimeoutConfig::default());
    }
}
