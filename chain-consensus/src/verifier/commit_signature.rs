use super::VerificationHandler;
use crate::aggregator::VoteAggregator;
use crate::commit_state::CommitState;
use crate::{ConsensusError, ConsensusResult};

/// The commit certificate must be a quorum of precommits for this block
#[derive(Debug, Clone)]
pub struct CommitSignatureHandler {
    aggregator: VoteAggregator,
}

impl CommitSignatureHandler {
    pub fn new(aggregator: VoteAggregator) -> Self {
        Self { aggregator }
    }
}

impl VerificationHandler for CommitSignatureHandler {
    fn name(&self) -> &'static str {
        "commit-signature"
    }

    fn requires_commit(&self) -> bool {
        true
    }

    fn execute(&self, unit: &mut CommitState) -> ConsensusResult<bool> {
        let commit = unit
            .commit()
            .ok_or_else(|| ConsensusError::Other("block has no commit certificate".into()))?;

        let block = unit.block();
        if commit.height != block.height() || commit.block_id != block.id()? {
            return Ok(false);
        }

        self.aggregator
            .verify(&commit.certificate, &commit.signing_message()?, unit.validators())?;
        Ok(true)
    }
}
