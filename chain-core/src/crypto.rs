//! BLS12-381 consensus signatures (min-pk: 48-byte public keys, 96-byte signatures)

use crate::{CoreError, CoreResult, Hash};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain separation tag for consensus signatures
pub const CONSENSUS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Compressed BLS public key
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct BlsPublicKey(Vec<u8>);

impl BlsPublicKey {
    pub const LEN: usize = 48;

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        blst::min_pk::PublicKey::from_bytes(bytes)
            .map_err(|e| CoreError::InvalidPublicKey(format!("{e:?}")))?;
        Ok(Self(bytes.to_vec()))
    }

    pub fn from_hex(hex: &str) -> CoreResult<Self> {
        Self::from_bytes(&hex::decode(hex.trim_start_matches("0x"))?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    fn to_blst(&self) -> Option<blst::min_pk::PublicKey> {
        blst::min_pk::PublicKey::from_bytes(&self.0).ok()
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        if hex.len() > 16 {
            write!(f, "BlsPublicKey({}..{})", &hex[..8], &hex[hex.len() - 8..])
        } else {
            write!(f, "BlsPublicKey({hex})")
        }
    }
}

/// Compressed BLS signature, single or aggregated
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct BlsSignature(Vec<u8>);

impl BlsSignature {
    pub const LEN: usize = 96;

    /// Wrap raw bytes; validity is checked at verification time
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn to_blst(&self) -> Option<blst::min_pk::Signature> {
        blst::min_pk::Signature::from_bytes(&self.0).ok()
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(&self.0);
        write!(f, "BlsSignature({}..)", &hex[..hex.len().min(16)])
    }
}

/// Holder of a consensus secret key
pub trait Signer: Send + Sync {
    fn public_key(&self) -> BlsPublicKey;
    fn sign(&self, message: &[u8]) -> BlsSignature;
}

/// Signature capability used by vote aggregation and commit verification
pub trait ConsensusSignature: Send + Sync {
    fn verify(&self, message: &[u8], signature: &BlsSignature, public_key: &BlsPublicKey) -> bool;

    fn aggregate(&self, signatures: &[BlsSignature]) -> CoreResult<BlsSignature>;

    fn aggregate_public_keys(&self, public_keys: &[BlsPublicKey]) -> CoreResult<BlsPublicKey>;

    /// Verify an aggregate signature of the same message by all `public_keys`
    fn verify_aggregate(
        &self,
        message: &[u8],
        signature: &BlsSignature,
        public_keys: &[BlsPublicKey],
    ) -> bool {
        match self.aggregate_public_keys(public_keys) {
            Ok(aggregate) => self.verify(message, signature, &aggregate),
            Err(_) => false,
        }
    }
}

/// BLS12-381 min-pk implementation backed by `blst`
#[derive(Debug, Clone, Copy, Default)]
pub struct Bls12381;

impl ConsensusSignature for Bls12381 {
    fn verify(&self, message: &[u8], signature: &BlsSignature, public_key: &BlsPublicKey) -> bool {
        let (Some(sig), Some(pk)) = (signature.to_blst(), public_key.to_blst()) else {
            return false;
        };
        sig.verify(true, message, CONSENSUS_DST, &[], &pk, true) == blst::BLST_ERROR::BLST_SUCCESS
    }

    fn aggregate(&self, signatures: &[BlsSignature]) -> CoreResult<BlsSignature> {
        if signatures.is_empty() {
            return Err(CoreError::Crypto("cannot aggregate empty signature list".into()));
        }
        let sigs = signatures
            .iter()
            .map(|s| s.to_blst().ok_or(CoreError::InvalidSignature))
            .collect::<CoreResult<Vec<_>>>()?;
        let refs: Vec<&blst::min_pk::Signature> = sigs.iter().collect();
        let aggregate = blst::min_pk::AggregateSignature::aggregate(&refs, true)
            .map_err(|e| CoreError::Crypto(format!("signature aggregation failed: {e:?}")))?;
        Ok(BlsSignature(aggregate.to_signature().to_bytes().to_vec()))
    }

    fn aggregate_public_keys(&self, public_keys: &[BlsPublicKey]) -> CoreResult<BlsPublicKey> {
        if public_keys.is_empty() {
            return Err(CoreError::Crypto("cannot aggregate empty key list".into()));
        }
        let keys = public_keys
            .iter()
            .map(|k| {
                k.to_blst()
                    .ok_or_else(|| CoreError::InvalidPublicKey(k.to_hex()))
            })
            .collect::<CoreResult<Vec<_>>>()?;
        let refs: Vec<&blst::min_pk::PublicKey> = keys.iter().collect();
        let aggregate = blst::min_pk::AggregatePublicKey::aggregate(&refs, false)
            .map_err(|e| CoreError::Crypto(format!("key aggregation failed: {e:?}")))?;
        Ok(BlsPublicKey(aggregate.to_public_key().to_bytes().to_vec()))
    }
}

/// Consensus key pair of a local validator
#[derive(Clone)]
pub struct BlsKeyPair {
    secret: blst::min_pk::SecretKey,
}

impl BlsKeyPair {
    /// Deterministic key from seed material (hashed to 32 bytes of key material)
    pub fn from_seed(seed: &[u8]) -> CoreResult<Self> {
        let ikm = Hash::digest(seed);
        let secret = blst::min_pk::SecretKey::key_gen(ikm.as_bytes(), &[])
            .map_err(|e| CoreError::Crypto(format!("key generation failed: {e:?}")))?;
        Ok(Self { secret })
    }

    /// Fresh random key
    pub fn generate() -> CoreResult<Self> {
        let mut ikm = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut ikm);
        let secret = blst::min_pk::SecretKey::key_gen(&ikm, &[])
            .map_err(|e| CoreError::Crypto(format!("key generation failed: {e:?}")))?;
        Ok(Self { secret })
    }
}

impl Signer for BlsKeyPair {
    fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.secret.sk_to_pk().to_bytes().to_vec())
    }

    fn sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature(self.secret.sign(message, CONSENSUS_DST, &[]).to_bytes().to_vec())
    }
}

impl fmt::Debug for BlsKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlsKeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}
