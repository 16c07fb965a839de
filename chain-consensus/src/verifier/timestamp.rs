use super::VerificationHandler;
use crate::commit_state::CommitState;
use crate::config::TimeoutConfig;
use crate::scheduler::minimal_timestamp;
use crate::ConsensusResult;
use tracing::debug;

/// Block timestamp must not precede the earliest time its round allows
#[derive(Debug, Clone)]
pub struct TimestampHandler {
    timeouts: TimeoutConfig,
}

impl TimestampHandler {
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self { timeouts }
    }
}

impl VerificationHandler for TimestampHandler {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn execute(&self, unit: &mut CommitState) -> ConsensusResult<bool> {
        let header = &unit.block().header;
        let parent = unit.previous_block().header.timestamp;
        let minimal = minimal_timestamp(&self.timeouts, parent, header.round);

        if header.timestamp < minimal {
            debug!(
                "Block timestamp {} below minimum {} for round {}",
                header.timestamp, minimal, header.round
            );
            return Ok(false);
        }
        Ok(true)
    }
}
