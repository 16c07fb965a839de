//! Block data structures and operations

use crate::{
    Amount, BlockId, CoreResult, Hash, Height, Round, Timestamp, Transaction, WalletPublicKey,
};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::HashSet;

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct BlockHeader {
    /// Id of the parent block
    pub parent_hash: Hash,
    /// Block height
    pub height: Height,
    /// Round in which the block was proposed
    pub round: Round,
    /// Block timestamp in milliseconds
    pub timestamp: Timestamp,
    /// Wallet key of the validator that forged the block
    pub generator_public_key: WalletPublicKey,
    /// Keccak256 over the concatenated transaction ids
    pub transactions_root: Hash,
    pub number_of_transactions: u32,
    /// Sum of transferred values
    pub total_amount: Amount,
    /// Sum of fees
    pub total_fee: Amount,
}

impl BlockHeader {
    /// Calculate the hash of this block header
    pub fn hash(&self) -> CoreResult<Hash> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())?;
        Ok(Hash::digest(&encoded))
    }
}

/// Complete block with header and transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// List of transactions
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble a block on top of `parent`, deriving root and totals from the
    /// transaction list
    pub fn build(
        parent: &BlockHeader,
        round: Round,
        timestamp: Timestamp,
        generator_public_key: WalletPublicKey,
        transactions: Vec<Transaction>,
    ) -> CoreResult<Self> {
        let transactions_root = Self::transactions_root_of(&transactions)?;
        let (total_amount, total_fee) = Self::totals_of(&transactions).unwrap_or((0, 0));
        let header = BlockHeader {
            parent_hash: parent.hash()?,
            height: parent.height + 1,
            round,
            timestamp,
            generator_public_key,
            transactions_root,
            number_of_transactions: transactions.len() as u32,
            total_amount,
            total_fee,
        };
        Ok(Self {
            header,
            transactions,
        })
    }

    /// Genesis block forged by `generator_public_key`
    pub fn genesis(generator_public_key: WalletPublicKey, timestamp: Timestamp) -> Self {
        Self {
            header: BlockHeader {
                parent_hash: Hash::zero(),
                height: 0,
                round: 0,
                timestamp,
                generator_public_key,
                transactions_root: Hash::zero(),
                number_of_transactions: 0,
                total_amount: 0,
                total_fee: 0,
            },
            transactions: Vec::new(),
        }
    }

    /// Block id (the header hash)
    pub fn id(&self) -> CoreResult<BlockId> {
        self.header.hash()
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    /// Calculate the transactions root hash
    pub fn calculate_transactions_root(&self) -> CoreResult<Hash> {
        Self::transactions_root_of(&self.transactions)
    }

    fn transactions_root_of(transactions: &[Transaction]) -> CoreResult<Hash> {
        if transactions.is_empty() {
            return Ok(Hash::zero());
        }

        let mut hasher = Keccak256::new();
        for tx in transactions {
            hasher.update(tx.id()?.as_bytes());
        }

        let mut root = [0u8; 32];
        root.copy_from_slice(hasher.finalize().as_slice());
        Ok(Hash::new(root))
    }

    fn totals_of(transactions: &[Transaction]) -> Option<(Amount, Amount)> {
        transactions.iter().try_fold((0u64, 0u64), |(amount, fee), tx| {
            Some((amount.checked_add(tx.value)?, fee.checked_add(tx.fee)?))
        })
    }

    /// Structural validation: transaction count, root, totals, duplicate ids
    /// and transaction signatures
    pub fn validate(&self) -> CoreResult<bool> {
        if self.header.number_of_transactions as usize != self.transactions.len() {
            return Ok(false);
        }

        if self.calculate_transactions_root()? != self.header.transactions_root {
            return Ok(false);
        }

        match Self::totals_of(&self.transactions) {
            Some((amount, fee))
                if amount == self.header.total_amount && fee == self.header.total_fee => {}
            _ => return Ok(false),
        }

        let mut seen = HashSet::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            if !seen.insert(tx.id()?) {
                return Ok(false);
            }
            if !tx.verify_signature()? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Get transaction by id
    pub fn get_transaction(&self, id: &Hash) -> CoreResult<Option<&Transaction>> {
        for tx in &self.transactions {
            if tx.id()? == *id {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    /// Check if block is genesis
    pub fn is_genesis(&self) -> bool {
        self.header.height == 0 && self.header.parent_hash == Hash::zero()
    }
}
