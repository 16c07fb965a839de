//! Basic blockchain types

use crate::{CoreError, CoreResult};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Block height (sequential block slot number)
pub type Height = u64;

/// Round within a height, reset to 0 on every new height
pub type Round = u32;

/// Position of a validator inside the active set of a height
pub type ValidatorIndex = usize;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = u64;

/// Nonce type for transactions
pub type Nonce = u64;

/// Amount of the native currency
pub type Amount = u64;

/// Voting power of a validator
pub type VotingPower = u64;

/// 32-byte hash type
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct Hash([u8; 32]);

/// Identifier of a block (the hash of its header)
pub type BlockId = Hash;

impl Hash {
    /// Create a new hash from byte array
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Keccak256 digest of arbitrary bytes
    pub fn digest(data: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(Keccak256::digest(data).as_slice());
        Self(bytes)
    }

    /// Get the underlying byte array
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string
    pub fn from_hex(hex: &str) -> CoreResult<Self> {
        let bytes = hex::decode(hex)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidHash(hex.to_string()))?;
        Ok(Self(bytes))
    }

    /// Zero hash (all bytes are 0)
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Short form used in log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// 20-byte address type
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct Address([u8; 20]);

impl Address {
    /// Create a new address from byte array
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Derive an address from an uncompressed secp256k1 public key
    /// (last 20 bytes of the Keccak256 hash, leading 0x04 tag skipped)
    pub fn from_uncompressed_key(uncompressed: &[u8; 65]) -> Self {
        let digest = Keccak256::digest(&uncompressed[1..]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[12..32]);
        Self(bytes)
    }

    /// Get the underlying byte array
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string, with or without the 0x prefix
    pub fn from_hex(hex: &str) -> CoreResult<Self> {
        let bytes = hex::decode(hex.trim_start_matches("0x"))?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidAddress(hex.to_string()))?;
        Ok(Self(bytes))
    }

    /// Zero address (all bytes are 0)
    pub fn zero() -> Self {
        Self([0u8; 20])
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

/// Compressed secp256k1 public key of a wallet (33 bytes)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct WalletPublicKey(Vec<u8>);

impl WalletPublicKey {
    /// Length of a compressed key
    pub const LEN: usize = 33;

    /// Wrap compressed key bytes
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != Self::LEN {
            return Err(CoreError::InvalidPublicKey(format!(
                "wallet key must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Parse from hex
    pub fn from_hex(hex: &str) -> CoreResult<Self> {
        Self::from_bytes(&hex::decode(hex.trim_start_matches("0x"))?)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Address owned by this key
    pub fn to_address(&self) -> CoreResult<Address> {
        let key = secp256k1::PublicKey::from_slice(&self.0)
            .map_err(|e| CoreError::InvalidPublicKey(e.to_string()))?;
        Ok(Address::from_uncompressed_key(&key.serialize_uncompressed()))
    }
}

impl fmt::Debug for WalletPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WalletPublicKey({})", self.to_hex())
    }
}

impl fmt::Display for WalletPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
