//! Administrative actions
//!
//! Every change here names an actor, requires a reason, and leaves
//! before/after values in the audit log.

use serde_json::json;
use tracing::{info, warn};

use super::LedgerStores;
use crate::audit::{Actor, AuditAction, AuditEntry};
use crate::core_types::{Currency, OwnerId, WalletId};
use crate::error::EngineError;
use crate::limits::TransactionLimit;
use crate::wallet::Wallet;

pub struct AdminService {
    stores: LedgerStores,
}

impl AdminService {
    pub fn new(stores: LedgerStores) -> Self {
        Self { stores }
    }

    pub async fn open_wallet(
        &self,
        owner_id: OwnerId,
        currency: &Currency,
    ) -> Result<Wallet, EngineError> {
        if owner_id == 0 {
            return Err(EngineError::Validation("owner id is required".into()));
        }
        let wallet = self.stores.wallets.open(owner_id, currency).await?;
        info!(wallet_id = wallet.id, owner_id, currency = %currency, "Wallet opened");
        Ok(wallet)
    }

    pub async fn wallet(&self, wallet_id: WalletId) -> Result<Wallet, EngineError> {
        self.stores
            .wallets
            .get(wallet_id)
            .await?
            .ok_or_else(|| EngineError::WalletNotFound(wallet_id.to_string()))
    }

    /// Overwrite a balance. The only path that sets a balance directly.
    pub async fn adjust_balance(
        &self,
        wallet_id: WalletId,
        new_balance: u64,
        actor: Actor,
        reason: &str,
    ) -> Result<Wallet, EngineError> {
        let reason = require_reason(reason)?;
        let (before, after) = self.stores.wallets.set_balance(wallet_id, new_balance).await?;

        let (direction, difference) = if after.balance >= before.balance {
            ("credit", after.balance - before.balance)
        } else {
            ("debit", before.balance - after.balance)
        };
        // The adjustment already happened; a lost entry must be loud
        self.stores
            .audit
            .record(
                AuditEntry::new(actor.clone(), AuditAction::BalanceAdjusted)
                    .wallet(wallet_id)
                    .owner(after.owner_id)
                    .reason(reason)
                    .detail(json!({
                        "before": before.balance,
                        "after": after.balance,
                        "direction": direction,
                        "difference": difference,
                        "currency": after.currency,
                    })),
            )
            .await?;
        warn!(
            wallet_id,
            actor = %actor,
            before = before.balance,
            after = after.balance,
            "Wallet balance adjusted"
        );
        Ok(after)
    }

    pub async fn set_frozen(
        &self,
        wallet_id: WalletId,
        frozen: bool,
        actor: Actor,
        reason: &str,
    ) -> Result<Wallet, EngineError> {
        let reason = require_reason(reason)?;
        let before = self.wallet(wallet_id).await?;
        let after = self.stores.wallets.set_frozen(wallet_id, frozen).await?;

        let action = if frozen {
            AuditAction::WalletFrozen
        } else {
            AuditAction::WalletUnfrozen
        };
        self.stores
            .audit
            .record(
                AuditEntry::new(actor.clone(), action)
                    .wallet(wallet_id)
                    .owner(after.owner_id)
                    .reason(reason)
                    .detail(json!({ "before": before.frozen, "after": after.frozen })),
            )
            .await?;
        info!(wallet_id, frozen, actor = %actor, "Wallet freeze flag changed");
        Ok(after)
    }

    /// Replace an owner's tier and caps; returns the previous row
    pub async fn set_limit(
        &self,
        limit: TransactionLimit,
        actor: Actor,
        reason: &str,
    ) -> Result<Option<TransactionLimit>, EngineError> {
        let reason = require_reason(reason)?;
        if limit.owner_id == 0 {
            return Err(EngineError::Validation("owner id is required".into()));
        }
        let owner_id = limit.owner_id;
        let after = serde_json::to_value(&limit).unwrap_or_default();
        let previous = self.stores.limits.put(limit).await?;

        self.stores
            .audit
            .record(
                AuditEntry::new(actor.clone(), AuditAction::LimitUpdated)
                    .owner(owner_id)
                    .reason(reason)
                    .detail(json!({ "before": previous, "after": after })),
            )
            .await?;
        info!(owner_id, actor = %actor, "Transaction limit updated");
        Ok(previous)
    }
}

fn require_reason(reason: &str) -> Result<&str, EngineError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(EngineError::Validation(
            "administrative changes require a reason".into(),
        ));
    }
    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::core_types::TransactionClass;
    use crate::limits::{InMemoryLimitStore, VerificationTier};
    use crate::transfer::store::InMemoryTransactionStore;
    use crate::wallet::InMemoryWalletStore;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn setup() -> (AdminService, Arc<InMemoryAuditSink>) {
        let audit = Arc::new(InMemoryAuditSink::new());
        let stores = LedgerStores {
            wallets: Arc::new(InMemoryWalletStore::new()),
            transactions: Arc::new(InMemoryTransactionStore::new()),
            limits: Arc::new(InMemoryLimitStore::new()),
            audit: audit.clone(),
        };
        (AdminService::new(stores), audit)
    }

    fn ops() -> Actor {
        Actor::Admin("ops.ada".into())
    }

    #[tokio::test]
    async fn test_adjust_balance_records_before_and_after() {
        let (admin, audit) = setup();
        let wallet = admin.open_wallet(3, &Currency::ngn()).await.unwrap();

        let after = admin
            .adjust_balance(wallet.id, 12_500, ops(), "chargeback reversal")
            .await
            .unwrap();
        assert_eq!(after.balance, 12_500);

        let entries = audit.all().await;
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.action, AuditAction::BalanceAdjusted);
        assert_eq!(entry.actor, ops());
        assert_eq!(entry.reason.as_deref(), Some("chargeback reversal"));
        assert_eq!(entry.detail["before"], 0);
        assert_eq!(entry.detail["after"], 12_500);
        assert_eq!(entry.detail["direction"], "credit");
    }

    #[tokio::test]
    async fn test_reason_is_mandatory() {
        let (admin, audit) = setup();
        let wallet = admin.open_wallet(3, &Currency::ngn()).await.unwrap();

        assert!(matches!(
            admin.adjust_balance(wallet.id, 1, ops(), " ").await,
            Err(EngineError::Validation(_))
        ));
        assert_eq!(admin.wallet(wallet.id).await.unwrap().balance, 0);
        assert!(audit.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_freeze_and_unfreeze() {
        let (admin, audit) = setup();
        let wallet = admin.open_wallet(3, &Currency::ngn()).await.unwrap();

        assert!(
            admin
                .set_frozen(wallet.id, true, ops(), "suspected takeover")
                .await
                .unwrap()
                .frozen
        );
        assert!(
            !admin
                .set_frozen(wallet.id, false, ops(), "owner verified")
                .await
                .unwrap()
                .frozen
        );
        assert_eq!(audit.count(AuditAction::WalletFrozen).await, 1);
        assert_eq!(audit.count(AuditAction::WalletUnfrozen).await, 1);
        assert!(matches!(
            admin.set_frozen(999, true, ops(), "x").await,
            Err(EngineError::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_limit_returns_previous() {
        let (admin, audit) = setup();
        let limit = |cap| TransactionLimit {
            owner_id: 3,
            tier: VerificationTier::Basic,
            caps: HashMap::from([(TransactionClass::Send, cap)]),
        };

        assert!(
            admin
                .set_limit(limit(50_000), ops(), "onboarding")
                .await
                .unwrap()
                .is_none()
        );
        let previous = admin
            .set_limit(limit(80_000), ops(), "tier review")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(previous.cap_for(TransactionClass::Send), Some(50_000));

        let last = audit.all().await.pop().unwrap();
        assert_eq!(last.action, AuditAction::LimitUpdated);
        assert_eq!(last.detail["before"]["caps"]["send"], 50_000);
        assert_eq!(last.detail["after"]["caps"]["send"], 80_000);
    }
}
