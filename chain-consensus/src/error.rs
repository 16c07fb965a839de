//! Consensus error types

use crate::evidence::EquivocationEvidence;
use chain_core::{CoreError, Height, Round, ValidatorIndex};
use chain_db::DbError;
use chain_state::StateError;
use thiserror::Error;

/// Consensus error type
#[derive(Error, Debug, Clone)]
pub enum ConsensusError {
    /// Message failed to decode or is structurally invalid
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Message for a height or round that is no longer live
    #[error("Stale message for {height}/{round}")]
    Stale { height: Height, round: Round },

    /// Two different votes by one validator in the same (height, round, kind)
    #[error("Equivocation by validator {validator_index} at {height}/{round}")]
    Equivocation {
        validator_index: ValidatorIndex,
        height: Height,
        round: Round,
    },

    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// A block verification handler rejected a commit
    #[error("Verification failed in {handler}: {reason}")]
    VerificationFailed { handler: String, reason: String },

    /// Persisted consensus data could not be decoded
    #[error("Storage corruption: {0}")]
    StorageCorruption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The canonical chain refused a verified commit
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Consensus error: {0}")]
    Other(String),
}

impl ConsensusError {
    /// Errors after which the engine must stop instead of skipping a message
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::StorageCorruption(_)
                | ConsensusError::Config(_)
                | ConsensusError::CommitFailed(_)
        )
    }
}

/// Rejection reasons of [`crate::VoteSet::add_vote`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoteError {
    #[error("validator index {index} outside active set of {size}")]
    UnknownValidator { index: ValidatorIndex, size: usize },

    #[error("vote does not belong to this set: {0}")]
    Mismatch(String),

    #[error("validator {} equivocated", .0.validator_index)]
    Equivocation(Box<EquivocationEvidence>),
}

impl From<VoteError> for ConsensusError {
    fn from(err: VoteError) -> Self {
        match err {
            VoteError::UnknownValidator { .. } | VoteError::Mismatch(_) => {
                ConsensusError::Malformed(err.to_string())
            }
            VoteError::Equivocation(evidence) => ConsensusError::Equivocation {
                validator_index: evidence.validator_index,
                height: evidence.first.height,
                round: evidence.first.round,
            },
        }
    }
}

impl From<CoreError> for ConsensusError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Deserialization(reason) => ConsensusError::Malformed(reason),
            CoreError::Serialization(reason) => ConsensusError::Serialization(reason),
            CoreError::InvalidSignature => {
                ConsensusError::SignatureInvalid("malformed signature".to_string())
            }
            other => ConsensusError::Crypto(other.to_string()),
        }
    }
}

impl From<DbError> for ConsensusError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Corruption { .. } => ConsensusError::StorageCorruption(err.to_string()),
            other => ConsensusError::Storage(other.to_string()),
        }
    }
}

impl From<StateError> for ConsensusError {
    fn from(err: StateError) -> Self {
        ConsensusError::Other(err.to_string())
    }
}

impl From<serde_json::Error> for ConsensusError {
    fn from(err: serde_json::Error) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;
