//! Internal peer-to-peer adapter
//!
//! "Sending" to another wallet on the platform is a credit on the
//! recipient's wallet. Applied keys are remembered so a repeated
//! `initiate` returns the original result instead of crediting again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::{
    IdempotencyKey, InitiateOutcome, ProviderAdapter, ProviderError, ProviderKind, StatusOutcome,
    TransferDetails, VerifyOutcome,
};
use crate::error::EngineError;
use crate::transfer::types::Counterparty;
use crate::wallet::WalletStore;

pub struct WalletTransferProvider {
    wallets: Arc<dyn WalletStore>,
    /// idempotency key -> reference
    applied: Mutex<HashMap<String, String>>,
}

impl WalletTransferProvider {
    pub fn new(wallets: Arc<dyn WalletStore>) -> Self {
        Self {
            wallets,
            applied: Mutex::new(HashMap::new()),
        }
    }

    fn reference_for(key: &IdempotencyKey) -> String {
        format!("p2p_{}", key.as_str())
    }
}

fn storage(e: EngineError) -> ProviderError {
    ProviderError::Network(e.to_string())
}

#[async_trait]
impl ProviderAdapter for WalletTransferProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Wallet
    }

    async fn verify_counterparty(
        &self,
        counterparty: &Counterparty,
    ) -> Result<VerifyOutcome, ProviderError> {
        let Counterparty::Wallet { wallet_id } = counterparty else {
            return Err(ProviderError::InvalidRequest(
                "wallet provider only serves wallets".into(),
            ));
        };
        counterparty
            .check_identifiers()
            .map_err(ProviderError::InvalidRequest)?;

        Ok(match self.wallets.get(*wallet_id).await.map_err(storage)? {
            Some(w) if w.frozen => VerifyOutcome::Invalid("recipient wallet is frozen".into()),
            Some(w) => VerifyOutcome::Valid {
                display_name: format!("wallet {} ({})", w.id, w.currency),
            },
            None => VerifyOutcome::Invalid(format!("wallet {} does not exist", wallet_id)),
        })
    }

    async fn initiate(
        &self,
        details: &TransferDetails,
        key: &IdempotencyKey,
    ) -> Result<InitiateOutcome, ProviderError> {
        details.validate()?;
        let Counterparty::Wallet { wallet_id } = &details.counterparty else {
            return Err(ProviderError::InvalidRequest(
                "wallet provider only serves wallets".into(),
            ));
        };

        // Held across the credit so two calls with one key cannot both apply
        let mut applied = self.applied.lock().await;
        if let Some(reference) = applied.get(key.as_str()) {
            return Ok(InitiateOutcome::Completed(reference.clone()));
        }

        let recipient = match self.wallets.get(*wallet_id).await.map_err(storage)? {
            Some(w) => w,
            None => {
                return Ok(InitiateOutcome::Rejected(format!(
                    "wallet {} does not exist",
                    wallet_id
                )));
            }
        };
        if recipient.currency != details.currency {
            return Ok(InitiateOutcome::Rejected(format!(
                "recipient wallet holds {}, not {}",
                recipient.currency, details.currency
            )));
        }
        if recipient.owner_id == details.owner_id {
            return Ok(InitiateOutcome::Rejected(
                "cannot send to your own wallet".into(),
            ));
        }

        self.wallets
            .credit(recipient.id, details.amount)
            .await
            .map_err(storage)?;
        let reference = Self::reference_for(key);
        applied.insert(key.as_str().to_string(), reference.clone());
        info!(
            transaction_id = %details.transaction_id,
            recipient_wallet = recipient.id,
            amount = details.amount,
            "Internal transfer credited"
        );
        Ok(InitiateOutcome::Completed(reference))
    }

    async fn query_status(&self, reference: &str) -> Result<StatusOutcome, ProviderError> {
        let applied = self.applied.lock().await;
        if applied.values().any(|r| r == reference) {
            Ok(StatusOutcome::Completed)
        } else {
            Ok(StatusOutcome::StillPending)
        }
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<InitiateOutcome>, ProviderError> {
        Ok(self
            .applied
            .lock()
            .await
            .get(key.as_str())
            .map(|reference| InitiateOutcome::Completed(reference.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Currency, TransactionId};
    use crate::wallet::InMemoryWalletStore;

    async fn setup() -> (WalletTransferProvider, Arc<InMemoryWalletStore>, u64) {
        let wallets = Arc::new(InMemoryWalletStore::new());
        let recipient = wallets.open(2, &Currency::ngn()).await.unwrap();
        (
            WalletTransferProvider::new(wallets.clone()),
            wallets,
            recipient.id,
        )
    }

    fn details(wallet_id: u64, amount: u64) -> TransferDetails {
        TransferDetails {
            transaction_id: TransactionId::new(),
            owner_id: 1,
            amount,
            currency: Currency::ngn(),
            counterparty: Counterparty::Wallet { wallet_id },
            description: "lunch".into(),
        }
    }

    #[tokio::test]
    async fn test_same_key_credits_once() {
        let (p, wallets, wid) = setup().await;
        let d = details(wid, 700);
        let key = IdempotencyKey::for_transaction(d.transaction_id);

        let first = p.initiate(&d, &key).await.unwrap();
        let second = p.initiate(&d, &key).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(wallets.get(wid).await.unwrap().unwrap().balance, 700);

        let InitiateOutcome::Completed(reference) = first else {
            panic!("expected completion");
        };
        assert_eq!(
            p.query_status(&reference).await.unwrap(),
            StatusOutcome::Completed
        );
        assert_eq!(
            p.lookup(&key).await.unwrap(),
            Some(InitiateOutcome::Completed(reference))
        );
        let unseen = IdempotencyKey::for_transaction(TransactionId::new());
        assert_eq!(p.lookup(&unseen).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejections() {
        let (p, wallets, wid) = setup().await;

        let missing = details(999, 10);
        assert!(matches!(
            p.initiate(&missing, &IdempotencyKey::for_transaction(missing.transaction_id))
                .await
                .unwrap(),
            InitiateOutcome::Rejected(_)
        ));

        let mut own = details(wid, 10);
        own.owner_id = 2;
        assert!(matches!(
            p.initiate(&own, &IdempotencyKey::for_transaction(own.transaction_id))
                .await
                .unwrap(),
            InitiateOutcome::Rejected(_)
        ));

        wallets.set_frozen(wid, true).await.unwrap();
        assert!(matches!(
            p.verify_counterparty(&Counterparty::Wallet { wallet_id: wid })
                .await
                .unwrap(),
            VerifyOutcome::Invalid(_)
        ));
    }
}
