//! Wallet model

use crate::{StateError, StateResult};
use chain_core::{Address, Amount, Nonce, WalletPublicKey};
use serde::{Deserialize, Serialize};

/// Wallet information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub address: Address,
    /// Known once the wallet has signed its first transaction
    pub public_key: Option<WalletPublicKey>,
    /// Nonce of the last transaction sent
    pub nonce: Nonce,
    pub balance: Amount,
}

impl Wallet {
    /// Create a new empty wallet
    pub fn new(address: Address) -> Self {
        Self {
            address,
            public_key: None,
            nonce: 0,
            balance: 0,
        }
    }

    /// Create a wallet with initial balance
    pub fn with_balance(address: Address, balance: Amount) -> Self {
        Self {
            balance,
            ..Self::new(address)
        }
    }

    /// Wallet owned by a known key
    pub fn for_public_key(public_key: WalletPublicKey, balance: Amount) -> StateResult<Self> {
        Ok(Self {
            address: public_key.to_address()?,
            public_key: Some(public_key),
            nonce: 0,
            balance,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance == 0 && self.public_key.is_none()
    }

    pub fn increment_nonce(&mut self) {
        self.nonce += 1;
    }

    /// Add to balance
    pub fn add_balance(&mut self, amount: Amount) -> StateResult<()> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(StateError::BalanceOverflow(self.address))?;
        Ok(())
    }

    /// Subtract from balance
    pub fn sub_balance(&mut self, amount: Amount) -> StateResult<()> {
        if self.balance < amount {
            return Err(StateError::InsufficientBalance {
                required: amount,
                available: self.balance,
            });
        }
        self.balance -= amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_operations() {
        let mut wallet = Wallet::with_balance(Address::zero(), 100);

        wallet.add_balance(50).unwrap();
        assert_eq!(wallet.balance, 150);

        wallet.sub_balance(30).unwrap();
        assert_eq!(wallet.balance, 120);

        assert!(matches!(
            wallet.sub_balance(200),
            Err(StateError::InsufficientBalance {
                required: 200,
                available: 120
            })
        ));
    }

    #[test]
    fn test_balance_overflow() {
        let mut wallet = Wallet::with_balance(Address::zero(), u64::MAX);
        assert!(matches!(
            wallet.add_balance(1),
            Err(StateError::BalanceOverflow(_))
        ));
    }

    #[test]
    fn test_empty_wallet() {
        let mut wallet = Wallet::new(Address::zero());
        assert!(wallet.is_empty());
        wallet.increment_nonce();
        assert!(!wallet.is_empty());
    }
}
