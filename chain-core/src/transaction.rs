//! Transaction data structures and operations

use crate::{Address, Amount, CoreError, CoreResult, Hash, Nonce, WalletPublicKey};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Recoverable secp256k1 transaction signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl Signature {
    /// Create new signature
    pub fn new(r: [u8; 32], s: [u8; 32], v: u8) -> Self {
        Self { r, s, v }
    }

    /// Convert to bytes (65 bytes total)
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[0..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = self.v;
        bytes
    }

    fn recover(&self, digest: &Hash) -> CoreResult<secp256k1::PublicKey> {
        let secp = secp256k1::Secp256k1::new();
        let recovery_id = secp256k1::ecdsa::RecoveryId::from_u8_masked(self.v);

        let mut sig_bytes = [0u8; 64];
        sig_bytes[0..32].copy_from_slice(&self.r);
        sig_bytes[32..64].copy_from_slice(&self.s);

        let recoverable_sig =
            secp256k1::ecdsa::RecoverableSignature::from_compact(&sig_bytes, recovery_id)
                .map_err(|e| CoreError::Crypto(e.to_string()))?;
        let message = secp256k1::Message::from_digest_slice(digest.as_bytes())
            .map_err(|e| CoreError::Crypto(e.to_string()))?;

        secp.recover_ecdsa(message, &recoverable_sig)
            .map_err(|e| CoreError::Crypto(e.to_string()))
    }
}

/// Value transfer between two wallets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Transaction {
    /// Compressed public key of the sending wallet
    pub sender_public_key: WalletPublicKey,
    /// Sender nonce; must be exactly one above the wallet's current nonce
    pub nonce: Nonce,
    /// Recipient address
    pub to: Address,
    /// Amount transferred to the recipient
    pub value: Amount,
    /// Fee paid by the sender
    pub fee: Amount,
    /// Free-form payload
    pub data: Vec<u8>,
    /// Transaction signature
    pub signature: Option<Signature>,
}

impl Transaction {
    /// Create an unsigned transfer
    pub fn transfer(
        sender_public_key: WalletPublicKey,
        nonce: Nonce,
        to: Address,
        value: Amount,
        fee: Amount,
    ) -> Self {
        Self {
            sender_public_key,
            nonce,
            to,
            value,
            fee,
            data: Vec::new(),
            signature: None,
        }
    }

    /// Attach a payload
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Encode transaction for hashing (without signature)
    pub fn encode_for_signing(&self) -> CoreResult<Vec<u8>> {
        let tx_data = TransactionForSigning {
            sender_public_key: self.sender_public_key.clone(),
            nonce: self.nonce,
            to: self.to,
            value: self.value,
            fee: self.fee,
            data: self.data.clone(),
        };
        Ok(bincode::encode_to_vec(&tx_data, bincode::config::standard())?)
    }

    /// Transaction id: Keccak256 of the full canonical encoding
    pub fn id(&self) -> CoreResult<Hash> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())?;
        Ok(Hash::digest(&encoded))
    }

    /// Calculate hash for signing (without signature)
    pub fn signing_hash(&self) -> CoreResult<Hash> {
        Ok(Hash::digest(&self.encode_for_signing()?))
    }

    /// Total amount leaving the sender wallet
    pub fn total_cost(&self) -> Option<Amount> {
        self.value.checked_add(self.fee)
    }

    /// Sign the transaction with the sender's private key
    pub fn sign(&mut self, private_key: &[u8]) -> CoreResult<()> {
        let secp = secp256k1::Secp256k1::new();
        let secret_key = secp256k1::SecretKey::from_slice(private_key)
            .map_err(|e| CoreError::Crypto(e.to_string()))?;

        let public_key = secp256k1::PublicKey::from_secret_key(&secp, &secret_key);
        if public_key.serialize().as_slice() != self.sender_public_key.as_bytes() {
            return Err(CoreError::InvalidPublicKey(
                "private key does not belong to the sender".to_string(),
            ));
        }

        let signing_hash = self.signing_hash()?;
        let message = secp256k1::Message::from_digest_slice(signing_hash.as_bytes())
            .map_err(|e| CoreError::Crypto(e.to_string()))?;

        let sig = secp.sign_ecdsa_recoverable(message, &secret_key);
        let (recovery_id, sig_bytes) = sig.serialize_compact();

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&sig_bytes[0..32]);
        s.copy_from_slice(&sig_bytes[32..64]);
        let v = recovery_id as u8;

        self.signature = Some(Signature::new(r, s, v));
        Ok(())
    }

    /// Verify that the signature was produced by `sender_public_key`
    pub fn verify_signature(&self) -> CoreResult<bool> {
        let signature = match &self.signature {
            Some(sig) => sig,
            None => return Ok(false),
        };

        let recovered = match signature.recover(&self.signing_hash()?) {
            Ok(key) => key,
            Err(_) => return Ok(false),
        };
        Ok(recovered.serialize().as_slice() == self.sender_public_key.as_bytes())
    }

    /// Address of the sending wallet
    pub fn sender(&self) -> CoreResult<Address> {
        self.sender_public_key.to_address()
    }
}

#[derive(Encode)]
struct TransactionForSigning {
    sender_public_key: WalletPublicKey,
    nonce: Nonce,
    to: Address,
    value: Amount,
    fee: Amount,
    data: Vec<u8>,
}

/// Deterministic secp256k1 wallet key pair
#[derive(Clone)]
pub struct WalletKeyPair {
    secret: [u8; 32],
    public_key: WalletPublicKey,
}

impl WalletKeyPair {
    /// Derive a key pair from seed material (Keccak256 of the seed is the secret)
    pub fn from_seed(seed: &[u8]) -> CoreResult<Self> {
        let secret = *Hash::digest(seed).as_bytes();
        let secp = secp256k1::Secp256k1::new();
        let secret_key = secp256k1::SecretKey::from_slice(&secret)
            .map_err(|e| CoreError::Crypto(e.to_string()))?;
        let public_key = secp256k1::PublicKey::from_secret_key(&secp, &secret_key);
        Ok(Self {
            secret,
            public_key: WalletPublicKey::from_bytes(&public_key.serialize())?,
        })
    }

    pub fn public_key(&self) -> &WalletPublicKey {
        &self.public_key
    }

    pub fn address(&self) -> CoreResult<Address> {
        self.public_key.to_address()
    }

    /// Sign a transaction in place
    pub fn sign(&self, tx: &mut Transaction) -> CoreResult<()> {
        tx.sign(&self.secret)
    }
}

impl std::fmt::Debug for WalletKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}
