use super::VerificationHandler;
use crate::commit_state::CommitState;
use crate::proposer::ProposerSelector;
use crate::ConsensusResult;
use std::sync::Arc;
use tracing::debug;

/// Generator of the block must be the selected proposer of the round the
/// block was first proposed in
pub struct ProposerHandler {
    selector: Arc<dyn ProposerSelector>,
}

impl ProposerHandler {
    pub fn new(selector: Arc<dyn ProposerSelector>) -> Self {
        Self { selector }
    }
}

impl VerificationHandler for ProposerHandler {
    fn name(&self) -> &'static str {
        "proposer"
    }

    fn execute(&self, unit: &mut CommitState) -> ConsensusResult<bool> {
        let header = &unit.block().header;
        let validators = unit.validators();
        let expected = self
            .selector
            .validator_index(header.height, header.round, validators.len());

        match validators.get(expected) {
            Some(v) if v.wallet_public_key == header.generator_public_key => Ok(true),
            _ => {
                debug!(
                    "Block {}/{} generated by {:?}, expected validator {}",
                    header.height, header.round, header.generator_public_key, expected
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposer::RoundRobinSelector;
    use crate::test_utils::TestChain;

    #[test]
    fn test_generator_must_be_round_proposer() {
        let chain = TestChain::new(4);
        let handler = ProposerHandler::new(Arc::new(RoundRobinSelector));

        let mut unit = chain.proposal_unit(2, vec![]);
        assert!(handler.execute(&mut unit).unwrap());

        let mut wrong = chain.proposal_unit_by(2, 1);
        assert!(!handler.execute(&mut wrong).unwrap());
    }
}
