use super::VerificationHandler;
use crate::commit_state::CommitState;
use crate::ConsensusResult;
use chain_state::ChainStore;
use std::sync::Arc;
use tracing::debug;

/// Rejects blocks carrying transactions that are already on chain
pub struct ForgedTransactionHandler {
    chain: Arc<dyn ChainStore>,
}

impl ForgedTransactionHandler {
    pub fn new(chain: Arc<dyn ChainStore>) -> Self {
        Self { chain }
    }
}

impl VerificationHandler for ForgedTransactionHandler {
    fn name(&self) -> &'static str {
        "forged-transaction"
    }

    fn execute(&self, unit: &mut CommitState) -> ConsensusResult<bool> {
        for tx in &unit.block().transactions {
            let id = tx.id()?;
            if self.chain.has_transaction(&id) {
                debug!("Transaction {} already forged", id.short());
                return Ok(false);
            }
        }
        Ok(true)
    }
}
