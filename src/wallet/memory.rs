//! In-memory wallet store
//!
//! `DashMap::get_mut` holds the shard write lock for the duration of a
//! mutation, which makes each debit/credit atomic per wallet.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::{Wallet, WalletStore, ensure_positive};
use crate::core_types::{Currency, MinorUnits, OwnerId, WalletId};
use crate::error::EngineError;

pub struct InMemoryWalletStore {
    wallets: DashMap<WalletId, Wallet>,
    by_owner: DashMap<(OwnerId, Currency), WalletId>,
    next_id: AtomicU64,
}

impl Default for InMemoryWalletStore {
    fn default() -> Self {
        Self {
            wallets: DashMap::new(),
            by_owner: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl InMemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, wallet_id: WalletId, f: F) -> Result<Wallet, EngineError>
    where
        F: FnOnce(&mut Wallet) -> Result<(), EngineError>,
    {
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| EngineError::WalletNotFound(wallet_id.to_string()))?;
        let mut next = wallet.clone();
        f(&mut next)?;
        *wallet = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl WalletStore for InMemoryWalletStore {
    async fn open(&self, owner_id: OwnerId, currency: &Currency) -> Result<Wallet, EngineError> {
        let id = match self.by_owner.entry((owner_id, currency.clone())) {
            Entry::Occupied(e) => *e.get(),
            Entry::Vacant(e) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                self.wallets
                    .insert(id, Wallet::new(id, owner_id, currency.clone()));
                e.insert(id);
                debug!(wallet_id = id, owner_id, currency = %currency, "Wallet opened");
                id
            }
        };
        self.wallets
            .get(&id)
            .map(|w| w.clone())
            .ok_or_else(|| EngineError::WalletNotFound(id.to_string()))
    }

    async fn get(&self, wallet_id: WalletId) -> Result<Option<Wallet>, EngineError> {
        Ok(self.wallets.get(&wallet_id).map(|w| w.clone()))
    }

    async fn find(
        &self,
        owner_id: OwnerId,
        currency: &Currency,
    ) -> Result<Option<Wallet>, EngineError> {
        let id = match self.by_owner.get(&(owner_id, currency.clone())) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get(id).await
    }

    async fn debit(&self, wallet_id: WalletId, amount: MinorUnits) -> Result<Wallet, EngineError> {
        ensure_positive(amount)?;
        self.mutate(wallet_id, |w| w.apply_debit(amount))
    }

    async fn credit(&self, wallet_id: WalletId, amount: MinorUnits) -> Result<Wallet, EngineError> {
        ensure_positive(amount)?;
        self.mutate(wallet_id, |w| w.apply_credit(amount))
    }

    async fn set_balance(
        &self,
        wallet_id: WalletId,
        new_balance: MinorUnits,
    ) -> Result<(Wallet, Wallet), EngineError> {
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| EngineError::WalletNotFound(wallet_id.to_string()))?;
        let before = wallet.clone();
        wallet.balance = new_balance;
        wallet.version += 1;
        wallet.updated_at = chrono::Utc::now();
        Ok((before, wallet.clone()))
    }

    async fn set_frozen(&self, wallet_id: WalletId, frozen: bool) -> Result<Wallet, EngineError> {
        self.mutate(wallet_id, |w| {
            w.frozen = frozen;
            w.version += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let store = InMemoryWalletStore::new();
        let a = store.open(9, &Currency::ngn()).await.unwrap();
        let b = store.open(9, &Currency::ngn()).await.unwrap();
        assert_eq!(a.id, b.id);

        let usd = store.open(9, &Currency::new("USD").unwrap()).await.unwrap();
        assert_ne!(a.id, usd.id);
        assert_eq!(
            store.find(9, &Currency::ngn()).await.unwrap().map(|w| w.id),
            Some(a.id)
        );
    }

    #[tokio::test]
    async fn test_zero_amount_is_validation_error() {
        let store = InMemoryWalletStore::new();
        let w = store.open(1, &Currency::ngn()).await.unwrap();
        assert!(matches!(
            store.debit(w.id, 0).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            store.credit(w.id, 0).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let store = InMemoryWalletStore::new();
        assert!(matches!(
            store.debit(42, 10).await,
            Err(EngineError::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_balance_returns_before_after() {
        let store = InMemoryWalletStore::new();
        let w = store.open(1, &Currency::ngn()).await.unwrap();
        store.credit(w.id, 700).await.unwrap();
        let (before, after) = store.set_balance(w.id, 250).await.unwrap();
        assert_eq!(before.balance, 700);
        assert_eq!(after.balance, 250);
        assert!(after.version > before.version);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_balance_never_negative_under_concurrency() {
        let store = Arc::new(InMemoryWalletStore::new());
        let w = store.open(1, &Currency::ngn()).await.unwrap();
        store.credit(w.id, 10_000).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.debit(w.id, 300).await }));
        }
        let mut ok = 0u64;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(EngineError::InsufficientFunds { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        let balance = store.get(w.id).await.unwrap().unwrap().balance;
        assert_eq!(ok, 33);
        assert_eq!(balance, 10_000 - ok * 300);
    }
}
