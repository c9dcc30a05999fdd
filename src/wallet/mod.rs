//! Wallet Store Accessor
//!
//! The only component allowed to mutate balances. Every mutation is atomic
//! per wallet: implementations serialize concurrent calls on the same
//! wallet and validate against the state they hold the lock on.

pub mod db;
pub mod memory;

pub use db::PgWalletStore;
pub use memory::InMemoryWalletStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{Currency, MinorUnits, OwnerId, WalletId};
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub owner_id: OwnerId,
    pub currency: Currency,
    pub balance: MinorUnits,
    pub frozen: bool,
    /// Incremented on every mutation
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(id: WalletId, owner_id: OwnerId, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            currency,
            balance: 0,
            frozen: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks run against the locked row; nothing changes on error.
    pub fn apply_debit(&mut self, amount: MinorUnits) -> Result<(), EngineError> {
        if self.frozen {
            return Err(EngineError::WalletFrozen);
        }
        let remaining =
            self.balance
                .checked_sub(amount)
                .ok_or(EngineError::InsufficientFunds {
                    available: self.balance,
                    requested: amount,
                })?;
        self.balance = remaining;
        self.touch();
        Ok(())
    }

    /// Credits are accepted on frozen wallets so compensations always land.
    pub fn apply_credit(&mut self, amount: MinorUnits) -> Result<(), EngineError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| EngineError::Validation("balance would overflow".into()))?;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

pub(crate) fn ensure_positive(amount: MinorUnits) -> Result<(), EngineError> {
    if amount == 0 {
        return Err(EngineError::Validation("amount must be greater than zero".into()));
    }
    Ok(())
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Returns the existing wallet when one is already open for the pair.
    async fn open(&self, owner_id: OwnerId, currency: &Currency) -> Result<Wallet, EngineError>;

    async fn get(&self, wallet_id: WalletId) -> Result<Option<Wallet>, EngineError>;

    async fn find(
        &self,
        owner_id: OwnerId,
        currency: &Currency,
    ) -> Result<Option<Wallet>, EngineError>;

    async fn debit(&self, wallet_id: WalletId, amount: MinorUnits) -> Result<Wallet, EngineError>;

    async fn credit(&self, wallet_id: WalletId, amount: MinorUnits) -> Result<Wallet, EngineError>;

    /// Overwrite the balance; returns (before, after). Admin adjustment only.
    async fn set_balance(
        &self,
        wallet_id: WalletId,
        new_balance: MinorUnits,
    ) -> Result<(Wallet, Wallet), EngineError>;

    async fn set_frozen(&self, wallet_id: WalletId, frozen: bool) -> Result<Wallet, EngineError>;
}
