//! Quorum certificates: building them from vote sets and checking them

use crate::validator_set::ValidatorSet;
use crate::vote_set::VoteSet;
use crate::{ConsensusError, ConsensusResult};
use chain_core::{AggregatedSignature, BlockId, BlsPublicKey, ConsensusSignature};
use std::sync::Arc;

/// Builds and verifies [`AggregatedSignature`] certificates
#[derive(Clone)]
pub struct VoteAggregator {
    signature: Arc<dyn ConsensusSignature>,
}

impl VoteAggregator {
    pub fn new(signature: Arc<dyn ConsensusSignature>) -> Self {
        Self { signature }
    }

    /// Certificate over the votes in `votes` for `block_id`
    pub fn aggregate(
        &self,
        votes: &VoteSet,
        block_id: Option<BlockId>,
    ) -> ConsensusResult<AggregatedSignature> {
        votes.build_certificate(block_id, self.signature.as_ref())
    }

    /// Check a certificate against the canonical `message` and the active set.
    ///
    /// The bitmask must be sized for `validators` with no stray bits, the
    /// flagged validators must hold a quorum, and the aggregate signature must
    /// verify under the aggregate of exactly their keys.
    pub fn verify(
        &self,
        certificate: &AggregatedSignature,
        message: &[u8],
        validators: &ValidatorSet,
    ) -> ConsensusResult<()> {
        let keys = Self::participants(certificate, validators)?;
        if !self
            .signature
            .verify_aggregate(message, &certificate.signature, &keys)
        {
            return Err(ConsensusError::SignatureInvalid(format!(
                "aggregate signature does not match signers {}",
                certificate.bitmask
            )));
        }
        Ok(())
    }

    /// Consensus keys of the certificate's signers, once the bitmask is well
    /// formed and the signers hold a quorum
    pub fn participants(
        certificate: &AggregatedSignature,
        validators: &ValidatorSet,
    ) -> ConsensusResult<Vec<BlsPublicKey>> {
        let bitmask = &certificate.bitmask;
        if !bitmask.is_well_formed() || bitmask.num_validators() != validators.len() {
            return Err(ConsensusError::Malformed(format!(
                "bitmask sized for {} validators, active set has {}",
                bitmask.num_validators(),
                validators.len()
            )));
        }

        let power = validators.power_of(bitmask);
        if !validators.has_quorum(power) {
            return Err(ConsensusError::SignatureInvalid(format!(
                "certificate carries power {} below quorum {}",
                power,
                validators.quorum_threshold()
            )));
        }

        validators.consensus_keys_of(bitmask)
    }
}

impl std::fmt::Debug for VoteAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteAggregator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{signed_vote, validator_set};
    use chain_core::{Bls12381, Hash, ValidatorBitmask, Vote, VoteKind};

    fn aggregator() -> VoteAggregator {
        VoteAggregator::new(Arc::new(Bls12381))
    }

    fn certificate_for(indices: &[usize]) -> (AggregatedSignature, Vec<u8>) {
        let id = Some(Hash::digest(b"block"));
        let mut set = VoteSet::new(VoteKind::Precommit, 3, 1, validator_set(4));
        for &i in indices {
            set.add_vote(signed_vote(VoteKind::Precommit, 3, 1, id, i)).unwrap();
        }
        let message = Vote::signing_message_for(VoteKind::Precommit, 3, 1, id).unwrap();
        (aggregator().aggregate(&set, id).unwrap(), message)
    }

    #[test]
    fn test_certificate_verifies() {
        let (certificate, message) = certificate_for(&[0, 2, 3]);
        assert_eq!(certificate.bitmask.to_string(), "1011");
        aggregator()
            .verify(&certificate, &message, &validator_set(4))
            .unwrap();
    }

    #[test]
    fn test_any_bit_flip_fails() {
        let (certificate, message) = certificate_for(&[0, 2, 3]);
        let validators = validator_set(4);

        for index in 0..4 {
            let mut tampered = certificate.clone();
            tampered.bitmask.toggle(index);
            assert!(
                aggregator().verify(&tampered, &message, &validators).is_err(),
                "flipping bit {index} must invalidate the certificate"
            );
        }
    }

    #[test]
    fn test_wrong_message_fails() {
        let (certificate, _) = certificate_for(&[0, 1, 2, 3]);
        let other = Vote::signing_message_for(VoteKind::Precommit, 3, 2, Some(Hash::digest(b"block")))
            .unwrap();
        assert!(matches!(
            aggregator().verify(&certificate, &other, &validator_set(4)),
            Err(ConsensusError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_underpowered_or_malformed_rejected() {
        let (certificate, message) = certificate_for(&[1, 3]);
        assert!(aggregator()
            .verify(&certificate, &message, &validator_set(4))
            .is_err());

        let (mut certificate, message) = certificate_for(&[0, 1, 2]);
        certificate.bitmask = ValidatorBitmask::from_indices(5, [0, 1, 2]);
        assert!(matches!(
            aggregator().verify(&certificate, &message, &validator_set(4)),
            Err(ConsensusError::Malformed(_))
        ));
    }
}
