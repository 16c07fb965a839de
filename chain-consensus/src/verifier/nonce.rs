use super::VerificationHandler;
use crate::commit_state::CommitState;
use crate::{ConsensusError, ConsensusResult};

/// Applies the block's transactions to the wallet snapshot in order.
/// Each sender nonce must be exactly one above the current one and every
/// sender must cover value plus fee.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonceHandler;

impl VerificationHandler for NonceHandler {
    fn name(&self) -> &'static str {
        "nonce"
    }

    fn execute(&self, unit: &mut CommitState) -> ConsensusResult<bool> {
        unit.apply_block()
            .map_err(|e| ConsensusError::Other(e.to_string()))?;
        Ok(true)
    }
}
