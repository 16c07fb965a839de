//! Byte-level endpoints handed to the transport layer

use crate::engine::{ConsensusEngine, ProcessorResult};
use crate::{ConsensusError, ConsensusResult};
use chain_core::{codec, Height, Proposal, Round, Vote};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Answer to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Stored and processed
    Accepted,
    /// Stale or duplicate; dropped without side effects
    Ignored,
    /// Malformed or failed verification
    Rejected,
}

/// Decodes wire messages and feeds them to the engine
#[derive(Debug, Clone)]
pub struct ConsensusService {
    engine: Arc<ConsensusEngine>,
}

impl ConsensusService {
    pub fn new(engine: Arc<ConsensusEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<ConsensusEngine> {
        &self.engine
    }

    pub async fn proposal(&self, bytes: &[u8]) -> Ack {
        let proposal = match codec::decode::<Proposal>(bytes) {
            Ok(proposal) => proposal,
            Err(e) => return reject("proposal", e.into()),
        };
        acknowledge("proposal", self.engine.on_proposal(proposal).await)
    }

    pub async fn prevote(&self, bytes: &[u8]) -> Ack {
        let vote = match codec::decode::<Vote>(bytes) {
            Ok(vote) => vote,
            Err(e) => return reject("prevote", e.into()),
        };
        acknowledge("prevote", self.engine.on_prevote(vote).await)
    }

    pub async fn precommit(&self, bytes: &[u8]) -> Ack {
        let vote = match codec::decode::<Vote>(bytes) {
            Ok(vote) => vote,
            Err(e) => return reject("precommit", e.into()),
        };
        acknowledge("precommit", self.engine.on_precommit(vote).await)
    }

    /// Encoded proposal for (height, round), if the engine holds one
    pub fn get_proposal(&self, height: Height, round: Round) -> Option<Vec<u8>> {
        let proposal = self.engine.get_proposal(height, round)?;
        match codec::encode(&proposal) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Failed to encode proposal {}/{}: {}", height, round, e);
                None
            }
        }
    }
}

fn acknowledge(what: &str, result: ConsensusResult<ProcessorResult>) -> Ack {
    match result {
        Ok(ProcessorResult::Accepted) => Ack::Accepted,
        Ok(ProcessorResult::Skipped) => Ack::Ignored,
        Err(ConsensusError::Stale { height, round }) => {
            debug!("Stale {} {}/{}", what, height, round);
            Ack::Ignored
        }
        Err(e) => reject(what, e),
    }
}

fn reject(what: &str, e: ConsensusError) -> Ack {
    if e.is_fatal() {
        error!("Fatal error while handling {}: {}", what, e);
    } else {
        warn!("Rejected {}: {}", what, e);
    }
    Ack::Rejected
}
