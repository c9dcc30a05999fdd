//! Failure after the debit
//!
//! Moving an in-flight transaction to `Failed` and handing the money back
//! are two writes. The `compensated` flag is claimed with a CAS before the
//! credit so the refund is applied at most once no matter how many paths
//! (orchestrator, worker, operator) race on the same row. A credit that
//! fails releases the claim; the sweep retries it later.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use super::state::TransactionStatus;
use super::store::TransactionStore;
use super::types::{FailureInfo, Transaction};
use crate::audit::{Actor, AuditAction, AuditEntry, AuditSink, record_or_log};
use crate::error::EngineError;
use crate::wallet::WalletStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Someone else moved the row first; nothing was done
    Lost,
    Failed { refunded: bool },
}

pub struct Compensator {
    transactions: Arc<dyn TransactionStore>,
    wallets: Arc<dyn WalletStore>,
    audit: Arc<dyn AuditSink>,
}

impl Compensator {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        wallets: Arc<dyn WalletStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            transactions,
            wallets,
            audit,
        }
    }

    /// CAS `expected → Failed`, then refund if the wallet had been debited
    pub async fn fail(
        &self,
        tx: &Transaction,
        expected: TransactionStatus,
        failure: FailureInfo,
        actor: &Actor,
    ) -> Result<FailOutcome, EngineError> {
        if !expected.can_transition_to(TransactionStatus::Failed) {
            return Err(EngineError::InvalidTransition {
                from: expected,
                to: TransactionStatus::Failed,
            });
        }

        let moved = self
            .transactions
            .update_status_if(tx.id, expected, TransactionStatus::Failed, Some(&failure))
            .await?;
        if !moved {
            warn!(
                transaction_id = %tx.id,
                expected = %expected,
                "Fail transition lost the race"
            );
            return Ok(FailOutcome::Lost);
        }

        record_or_log(
            self.audit.as_ref(),
            AuditEntry::new(actor.clone(), AuditAction::StatusChanged)
                .transaction(tx.id)
                .owner(tx.owner_id)
                .wallet(tx.wallet_id)
                .transition(expected, TransactionStatus::Failed)
                .reason(failure.message.clone())
                .detail(json!({ "reason_code": failure.reason_code })),
        )
        .await;

        // `debited` covers a debit that landed before its status was recorded
        if !expected.is_in_flight() && !tx.debited {
            return Ok(FailOutcome::Failed { refunded: false });
        }

        let refunded = match self.refund(tx, actor).await {
            Ok(applied) => applied,
            // Row is Failed with compensated = false; the sweep picks it up
            Err(_) => false,
        };
        Ok(FailOutcome::Failed { refunded })
    }

    /// Apply the compensating credit. Returns true when this call applied it.
    pub async fn refund(&self, tx: &Transaction, actor: &Actor) -> Result<bool, EngineError> {
        if !self.transactions.set_compensated_if(tx.id, false, true).await? {
            return Ok(false);
        }

        match self.wallets.credit(tx.wallet_id, tx.amount).await {
            Ok(wallet) => {
                info!(
                    transaction_id = %tx.id,
                    wallet_id = tx.wallet_id,
                    amount = tx.amount,
                    balance = wallet.balance,
                    "Compensating credit applied"
                );
                record_or_log(
                    self.audit.as_ref(),
                    AuditEntry::new(actor.clone(), AuditAction::Compensated)
                        .transaction(tx.id)
                        .owner(tx.owner_id)
                        .wallet(tx.wallet_id)
                        .detail(json!({
                            "amount": tx.amount,
                            "balance_after": wallet.balance,
                        })),
                )
                .await;
                Ok(true)
            }
            Err(e) => {
                error!(
                    transaction_id = %tx.id,
                    wallet_id = tx.wallet_id,
                    error = %e,
                    "Compensating credit failed"
                );
                if let Err(release) = self.transactions.set_compensated_if(tx.id, true, false).await
                {
                    error!(
                        transaction_id = %tx.id,
                        error = %release,
                        "Failed to release compensation claim"
                    );
                }
                record_or_log(
                    self.audit.as_ref(),
                    AuditEntry::new(actor.clone(), AuditAction::CompensationFailed)
                        .transaction(tx.id)
                        .owner(tx.owner_id)
                        .wallet(tx.wallet_id)
                        .reason(e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }
}
