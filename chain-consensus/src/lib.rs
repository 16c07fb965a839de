//! Blockchain consensus engine
//!
//! This crate provides round-based BFT consensus for the blockchain:
//! validator sets and proposer rotation, vote sets with BLS quorum
//! certificates, per-round state with crash recovery, the block
//! verification pipeline and the engine that drives propose, prevote and
//! precommit over them.

pub mod aggregator;
pub mod commit_state;
pub mod config;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod proposer;
pub mod repository;
pub mod round_state;
pub mod scheduler;
pub mod service;
pub mod traits;
pub mod validator_set;
pub mod verifier;
pub mod vote_set;
pub mod worker;

#[cfg(test)]
mod test_utils;

pub use aggregator::VoteAggregator;
pub use commit_state::{CommitState, ProcessableUnit};
pub use config::{ConsensusConfig, ProposerPolicy, QuorumPolicy, TimeoutConfig, ValidatorConfig};
pub use engine::{ConsensusEngine, ConsensusEvent, ProcessorResult};
pub use error::{ConsensusError, ConsensusResult, VoteError};
pub use evidence::{EquivocationEvidence, Misbehaviour, MisbehaviourTracker};
pub use proposer::{ProposerSelector, RoundRobinSelector, ShuffledSelector};
pub use repository::RoundStateRepository;
pub use round_state::{RoundState, RoundStep};
pub use scheduler::{Scheduler, TimeoutEvent, TimeoutKind};
pub use service::{Ack, ConsensusService};
pub use traits::{BlockBuilder, Broadcaster, EmptyBlockBuilder, NoopBroadcaster};
pub use validator_set::{StaticValidatorSet, Validator, ValidatorSet, ValidatorSetProvider};
pub use verifier::{BlockVerificationPipeline, VerificationHandler};
pub use vote_set::VoteSet;
pub use worker::CryptoWorkerPool;
