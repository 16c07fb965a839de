//! Block verification pipeline
//!
//! An ordered list of handlers run over a [`CommitState`]. The first handler
//! that returns `false` or an error stops the pipeline and the block is
//! rejected with [`ConsensusError::VerificationFailed`].

mod commit_signature;
mod forged;
mod nonce;
mod proposer;
mod timestamp;

pub use commit_signature::CommitSignatureHandler;
pub use forged::ForgedTransactionHandler;
pub use nonce::NonceHandler;
pub use proposer::ProposerHandler;
pub use timestamp::TimestampHandler;

use crate::aggregator::VoteAggregator;
use crate::commit_state::{CommitState, ProcessableUnit};
use crate::config::TimeoutConfig;
use crate::proposer::ProposerSelector;
use crate::{ConsensusError, ConsensusResult};
use chain_state::ChainStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// One check of the pipeline
pub trait VerificationHandler: Send + Sync {
    /// Name reported when this handler rejects a block
    fn name(&self) -> &'static str;

    /// Only meaningful once a commit certificate exists
    fn requires_commit(&self) -> bool {
        false
    }

    fn execute(&self, unit: &mut CommitState) -> ConsensusResult<bool>;
}

/// Ordered, short-circuiting chain of [`VerificationHandler`]s
pub struct BlockVerificationPipeline {
    handlers: Vec<Box<dyn VerificationHandler>>,
}

impl BlockVerificationPipeline {
    pub fn new(handlers: Vec<Box<dyn VerificationHandler>>) -> Self {
        Self { handlers }
    }

    /// Timestamp, proposer, nonce, forged transaction and commit signature
    /// checks, in that order
    pub fn standard(
        chain: Arc<dyn ChainStore>,
        selector: Arc<dyn ProposerSelector>,
        timeouts: TimeoutConfig,
        aggregator: VoteAggregator,
    ) -> Self {
        Self::new(vec![
            Box::new(TimestampHandler::new(timeouts)),
            Box::new(ProposerHandler::new(selector)),
            Box::new(NonceHandler),
            Box::new(ForgedTransactionHandler::new(chain)),
            Box::new(CommitSignatureHandler::new(aggregator)),
        ])
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Every handler, including the commit certificate check
    pub fn verify(&self, unit: &mut CommitState) -> ConsensusResult<()> {
        self.run(unit, true)
    }

    /// Handlers that do not need a certificate; used to evaluate proposals
    pub fn verify_block(&self, unit: &mut CommitState) -> ConsensusResult<()> {
        self.run(unit, false)
    }

    fn run(&self, unit: &mut CommitState, with_commit: bool) -> ConsensusResult<()> {
        for handler in &self.handlers {
            if handler.requires_commit() && !with_commit {
                continue;
            }

            let reason = match handler.execute(unit) {
                Ok(true) => continue,
                Ok(false) => "check returned false".to_string(),
                Err(e) => e.to_string(),
            };
            warn!(
                "Block at height {} rejected by {}: {}",
                unit.block().height(),
                handler.name(),
                reason
            );
            unit.set_processor_result(false);
            return Err(ConsensusError::VerificationFailed {
                handler: handler.name().to_string(),
                reason,
            });
        }

        debug!("Block at height {} passed verification", unit.block().height());
        unit.set_processor_result(true);
        Ok(())
    }
}

impl std::fmt::Debug for BlockVerificationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockVerificationPipeline")
            .field("handlers", &self.handler_names())
            .finish()
    }
}
