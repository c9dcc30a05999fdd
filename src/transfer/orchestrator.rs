//! Transfer Orchestrator
//!
//! Drives one request through the lifecycle:
//!
//! ```text
//! validate → verify counterparty → limit → risk → persist (RISK_CHECKED)
//!   → debit (DEBITED) → persist (PROVIDER_SUBMITTED) → initiate
//!   → COMPLETED | PENDING | FAILED + compensating credit
//! ```
//!
//! Every gate before the debit aborts without touching money and leaves a
//! rejection in the audit log. Once a request is admitted the rest runs on a
//! detached task, so a caller that goes away cannot strand a debit.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::LedgerStores;
use super::compensation::{Compensator, FailOutcome};
use super::state::TransactionStatus;
use super::types::{
    FailureInfo, ProviderReference, Transaction, TransferRequest, TransferResponse,
};
use crate::audit::{Actor, AuditAction, AuditEntry, record_or_log};
use crate::config::EngineConfig;
use crate::core_types::TransactionId;
use crate::error::EngineError;
use crate::limits::{LimitAggregator, LimitReservation, VerificationTier, day_start};
use crate::notify::{Notification, Notifier, dispatch};
use crate::providers::{
    IdempotencyKey, InitiateOutcome, ProviderAdapter, ProviderError, ProviderRegistry,
    TransferDetails, VerifyOutcome,
};
use crate::risk::{RiskAssessment, RiskInputs, RiskScorer};
use crate::wallet::Wallet;

/// First call plus one retry
const MAX_PROVIDER_ATTEMPTS: u32 = 2;
const MAX_DESCRIPTION_LEN: usize = 255;
const MAX_CLIENT_REFERENCE_LEN: usize = 64;
const FAILURE_LOOKBACK_HOURS: i64 = 24;

/// Source of "now" for limit windows and risk factors
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A request that passed every pre-debit gate
struct Admitted {
    wallet: Wallet,
    adapter: Arc<dyn ProviderAdapter>,
    reservation: LimitReservation,
    assessment: RiskAssessment,
}

pub struct TransferOrchestrator {
    stores: LedgerStores,
    limiter: LimitAggregator,
    compensator: Compensator,
    registry: ProviderRegistry,
    scorer: RiskScorer,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    clock: Clock,
}

impl TransferOrchestrator {
    pub fn new(
        stores: LedgerStores,
        registry: ProviderRegistry,
        scorer: RiskScorer,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let limiter = LimitAggregator::new(
            stores.limits.clone(),
            stores.transactions.clone(),
            config.day_offset(),
        );
        Self {
            compensator: stores.compensator(),
            limiter,
            stores,
            registry,
            scorer,
            notifier,
            config,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock, e.g. to pin the time of day in tests
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Run a request and report it in the caller-facing shape
    pub async fn respond(self: &Arc<Self>, req: TransferRequest) -> TransferResponse {
        let id = TransactionId::new();
        match self.submit_with_id(id, req).await {
            Ok(tx) => TransferResponse::from_transaction(&tx),
            Err(e) => TransferResponse::rejected(id, e.code()),
        }
    }

    pub async fn submit(self: &Arc<Self>, req: TransferRequest) -> Result<Transaction, EngineError> {
        self.submit_with_id(TransactionId::new(), req).await
    }

    /// Run a request under a caller-chosen id
    ///
    /// Errors mean the request stopped before money left the wallet (or was
    /// handed straight back). Once debited, the outcome is on the returned
    /// transaction: `Completed`, `Pending`, or `Failed` with a refund. A
    /// storage error after the debit leaves the row in flight for the
    /// reconciliation sweep to finish.
    pub async fn submit_with_id(
        self: &Arc<Self>,
        id: TransactionId,
        req: TransferRequest,
    ) -> Result<Transaction, EngineError> {
        if let Some(client_ref) = req.client_reference.as_deref()
            && let Some(existing) = self
                .stores
                .transactions
                .get_by_client_ref(req.owner_id, client_ref)
                .await?
        {
            debug!(
                transaction_id = %existing.id,
                client_reference = client_ref,
                "Repeated client reference, returning existing transaction"
            );
            return Ok(existing);
        }

        let admitted = match self.admit(id, &req).await {
            Ok(admitted) => admitted,
            Err(e) => {
                self.audit_rejection(id, &req, &e).await;
                return Err(e);
            }
        };

        let this = self.clone();
        let handle = tokio::spawn(async move { this.execute(id, req, admitted).await });
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(transaction_id = %id, error = %e, "Transfer task aborted");
                Err(EngineError::Storage(format!("transfer task aborted: {}", e)))
            }
        }
    }

    pub async fn transaction(&self, id: TransactionId) -> Result<Transaction, EngineError> {
        self.stores
            .transactions
            .get(id)
            .await?
            .ok_or_else(|| EngineError::TransactionNotFound(id.to_string()))
    }

    // ========================================================================
    // Pre-debit gates
    // ========================================================================

    async fn admit(&self, id: TransactionId, req: &TransferRequest) -> Result<Admitted, EngineError> {
        validate_request(req)?;

        let wallet = self
            .stores
            .wallets
            .find(req.owner_id, &req.currency)
            .await?
            .ok_or_else(|| {
                EngineError::WalletNotFound(format!(
                    "owner {} has no {} wallet",
                    req.owner_id, req.currency
                ))
            })?;

        let adapter = self.registry.for_class(req.class)?;
        let outcome = self
            .call_provider("verify_counterparty", || {
                adapter.verify_counterparty(&req.counterparty)
            })
            .await?;
        match outcome {
            VerifyOutcome::Valid { display_name } => {
                debug!(transaction_id = %id, counterparty = %display_name, "Counterparty verified");
            }
            VerifyOutcome::Invalid(reason) => return Err(EngineError::CounterpartyInvalid(reason)),
        }

        let reservation = self
            .limiter
            .check_and_reserve_at(req.owner_id, req.class, req.amount, (self.clock)())
            .await?;
        debug!(
            transaction_id = %id,
            status = %TransactionStatus::LimitChecked,
            reserved = reservation.amount(),
            "Limit check passed"
        );

        let assessment = self.assess(req, reservation.tier()).await?;
        record_or_log(
            self.stores.audit.as_ref(),
            AuditEntry::new(Actor::Owner(req.owner_id), AuditAction::RiskAssessed)
                .transaction(id)
                .owner(req.owner_id)
                .wallet(wallet.id)
                .detail(serde_json::to_value(&assessment).unwrap_or_default()),
        )
        .await;

        if !assessment.is_allowed() {
            warn!(
                transaction_id = %id,
                score = assessment.score,
                level = %assessment.level,
                "Transfer denied by risk check"
            );
            return Err(EngineError::RiskDenied {
                level: assessment.level,
                score: assessment.score,
            });
        }

        Ok(Admitted {
            wallet,
            adapter,
            reservation,
            assessment,
        })
    }

    async fn assess(
        &self,
        req: &TransferRequest,
        tier: VerificationTier,
    ) -> Result<RiskAssessment, EngineError> {
        let now = (self.clock)();
        let txs = &self.stores.transactions;
        let recent = txs.recent(req.owner_id, self.config.history_depth).await?;
        let today = txs
            .since(req.owner_id, day_start(now, self.config.day_offset()))
            .await?;
        let counterparty_known = txs
            .has_counterparty(req.owner_id, &req.counterparty.key())
            .await?;
        let recent_failures = txs
            .failures_since(req.owner_id, now - Duration::hours(FAILURE_LOOKBACK_HOURS))
            .await?;

        Ok(self.scorer.assess(&RiskInputs {
            amount: req.amount,
            tier,
            recent: &recent,
            today: &today,
            counterparty_known,
            device_new: req.context.device_new,
            location_new: req.context.location_new,
            recent_failures,
            at: now,
        }))
    }

    // ========================================================================
    // Detached part: persist, debit, initiate
    // ========================================================================

    async fn execute(
        self: Arc<Self>,
        id: TransactionId,
        req: TransferRequest,
        admitted: Admitted,
    ) -> Result<Transaction, EngineError> {
        let Admitted {
            wallet,
            adapter,
            reservation,
            assessment,
        } = admitted;

        let mut tx = Transaction::new(
            id,
            req.owner_id,
            wallet.id,
            req.class,
            req.amount,
            req.currency.clone(),
            req.counterparty.clone(),
            req.description.clone(),
            req.client_reference.clone(),
        );
        tx.status = TransactionStatus::RiskChecked;
        tx.risk = Some(assessment);
        tx.created_at = (self.clock)();

        if let Err(e) = self.stores.transactions.create(&tx).await {
            // A concurrent duplicate won the client reference
            if let (EngineError::Conflict(_), Some(client_ref)) =
                (&e, req.client_reference.as_deref())
            {
                match self
                    .stores
                    .transactions
                    .get_by_client_ref(req.owner_id, client_ref)
                    .await
                {
                    Ok(Some(existing)) => return Ok(existing),
                    Ok(None) => {}
                    Err(lookup) => error!(
                        transaction_id = %id,
                        error = %lookup,
                        "Failed to load the transaction holding this client reference"
                    ),
                }
            }
            self.audit_rejection(id, &req, &e).await;
            return Err(e);
        }

        if let Err(e) = self.debit(&tx, &reservation).await {
            self.abort_persisted(&tx, &req, &e).await;
            return Err(e);
        }
        // The row now counts toward the limit on its own
        drop(reservation);

        self.settle(tx, adapter).await
    }

    async fn debit(&self, tx: &Transaction, reservation: &LimitReservation) -> Result<(), EngineError> {
        self.limiter.recheck_at(reservation, (self.clock)()).await?;
        let wallet = self.stores.wallets.debit(tx.wallet_id, tx.amount).await?;

        let marked = self
            .stores
            .transactions
            .update_status_if(
                tx.id,
                TransactionStatus::RiskChecked,
                TransactionStatus::Debited,
                None,
            )
            .await;
        if !matches!(marked, Ok(true)) {
            error!(
                transaction_id = %tx.id,
                result = ?marked,
                "Debit applied but not recorded, reversing"
            );
            // If the refund fails too, the flag is what lets the sweep find it
            if let Err(e) = self.stores.transactions.mark_debited(tx.id).await {
                error!(transaction_id = %tx.id, error = %e, "Failed to flag the debit");
            }
            self.compensator.refund(tx, &Actor::System).await?;
            return Err(marked.err().unwrap_or_else(|| {
                EngineError::Conflict(format!("transaction {} moved during debit", tx.id))
            }));
        }

        info!(
            transaction_id = %tx.id,
            wallet_id = tx.wallet_id,
            amount = tx.amount,
            balance = wallet.balance,
            "Wallet debited"
        );
        self.audit_transition(tx, TransactionStatus::RiskChecked, TransactionStatus::Debited)
            .await;
        Ok(())
    }

    async fn settle(
        &self,
        tx: Transaction,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Result<Transaction, EngineError> {
        // Persist before the call: a crash mid-call leaves a visible row
        if !self
            .transition(&tx, TransactionStatus::Debited, TransactionStatus::ProviderSubmitted)
            .await?
        {
            return self.transaction(tx.id).await;
        }

        let key = IdempotencyKey::for_transaction(tx.id);
        let details = TransferDetails {
            transaction_id: tx.id,
            owner_id: tx.owner_id,
            amount: tx.amount,
            currency: tx.currency.clone(),
            counterparty: tx.counterparty.clone(),
            description: tx.description.clone(),
        };
        let outcome = self
            .call_provider("initiate", || adapter.initiate(&details, &key))
            .await;

        match outcome {
            Ok(InitiateOutcome::Completed(reference)) => {
                self.record_reference(&tx, &adapter, reference).await;
                if self
                    .transition(&tx, TransactionStatus::ProviderSubmitted, TransactionStatus::Completed)
                    .await?
                {
                    info!(transaction_id = %tx.id, class = %tx.class, "Transfer completed");
                    dispatch(
                        &self.notifier,
                        Notification::TransferCompleted {
                            owner_id: tx.owner_id,
                            transaction_id: tx.id,
                            amount: tx.amount,
                            currency: tx.currency.clone(),
                        },
                    );
                }
            }
            Ok(InitiateOutcome::Pending(reference)) => {
                self.record_reference(&tx, &adapter, reference).await;
                if self
                    .transition(&tx, TransactionStatus::ProviderSubmitted, TransactionStatus::Pending)
                    .await?
                {
                    info!(transaction_id = %tx.id, "Transfer pending provider confirmation");
                    dispatch(
                        &self.notifier,
                        Notification::TransferPending {
                            owner_id: tx.owner_id,
                            transaction_id: tx.id,
                        },
                    );
                }
            }
            Ok(InitiateOutcome::Rejected(reason)) => {
                let err = EngineError::ProviderRejected(reason);
                self.fail_in_flight(&tx, &err).await?;
            }
            Err(e) => {
                let err = EngineError::from(e);
                self.fail_in_flight(&tx, &err).await?;
            }
        }

        self.transaction(tx.id).await
    }

    async fn fail_in_flight(&self, tx: &Transaction, err: &EngineError) -> Result<(), EngineError> {
        let failure = FailureInfo::new(err.code(), err.to_string());
        let outcome = self
            .compensator
            .fail(tx, TransactionStatus::ProviderSubmitted, failure, &Actor::System)
            .await?;
        if let FailOutcome::Failed { refunded } = outcome {
            warn!(
                transaction_id = %tx.id,
                reason_code = err.code(),
                refunded,
                "Transfer failed after debit"
            );
            dispatch(
                &self.notifier,
                Notification::TransferFailed {
                    owner_id: tx.owner_id,
                    transaction_id: tx.id,
                    reason: err.to_string(),
                    refunded,
                },
            );
        }
        Ok(())
    }

    /// Failure between persisting the row and the debit being recorded
    async fn abort_persisted(&self, tx: &Transaction, req: &TransferRequest, err: &EngineError) {
        let failure = FailureInfo::new(err.code(), err.to_string());
        // Re-read so a debit flagged by `debit` is refunded on the way out
        let current = match self.stores.transactions.get(tx.id).await {
            Ok(Some(current)) => current,
            _ => tx.clone(),
        };
        if let Err(e) = self
            .compensator
            .fail(&current, TransactionStatus::RiskChecked, failure, &Actor::Owner(tx.owner_id))
            .await
        {
            error!(transaction_id = %tx.id, error = %e, "Failed to mark aborted transaction");
        }
        self.audit_rejection(tx.id, req, err).await;
    }

    async fn record_reference(
        &self,
        tx: &Transaction,
        adapter: &Arc<dyn ProviderAdapter>,
        reference: String,
    ) {
        let provider_ref = ProviderReference::new(adapter.kind(), reference);
        // The status transition still goes ahead; the reference is in the log
        if let Err(e) = self
            .stores
            .transactions
            .set_provider_ref(tx.id, &provider_ref)
            .await
        {
            error!(
                transaction_id = %tx.id,
                provider_reference = %provider_ref.reference,
                error = %e,
                "Failed to store provider reference"
            );
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Bounded call with one retry on transient failure, same arguments each time
    async fn call_provider<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match timeout(self.config.provider_timeout(), call()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < MAX_PROVIDER_ATTEMPTS => {
                    warn!(operation, attempt, error = %e, "Provider call failed, retrying");
                    attempt += 1;
                    sleep(self.config.retry_backoff()).await;
                }
                other => return other,
            }
        }
    }

    async fn transition(
        &self,
        tx: &Transaction,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<bool, EngineError> {
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        let moved = self
            .stores
            .transactions
            .update_status_if(tx.id, from, to, None)
            .await?;
        if moved {
            self.audit_transition(tx, from, to).await;
        } else {
            warn!(transaction_id = %tx.id, from = %from, to = %to, "Transition lost the race");
        }
        Ok(moved)
    }

    async fn audit_transition(&self, tx: &Transaction, from: TransactionStatus, to: TransactionStatus) {
        record_or_log(
            self.stores.audit.as_ref(),
            AuditEntry::new(Actor::System, AuditAction::StatusChanged)
                .transaction(tx.id)
                .owner(tx.owner_id)
                .wallet(tx.wallet_id)
                .transition(from, to),
        )
        .await;
    }

    async fn audit_rejection(&self, id: TransactionId, req: &TransferRequest, err: &EngineError) {
        info!(
            transaction_id = %id,
            owner_id = req.owner_id,
            reason_code = err.code(),
            "Transfer rejected"
        );
        let mut detail = json!({
            "reason_code": err.code(),
            "class": req.class,
            "amount": req.amount,
            "currency": req.currency,
        });
        match err {
            EngineError::LimitExceeded { available } => detail["available"] = json!(available),
            EngineError::RiskDenied { level, score } => {
                detail["risk_level"] = json!(level);
                detail["risk_score"] = json!(score);
            }
            _ => {}
        }
        record_or_log(
            self.stores.audit.as_ref(),
            AuditEntry::new(Actor::Owner(req.owner_id), AuditAction::TransferRejected)
                .transaction(id)
                .owner(req.owner_id)
                .reason(err.to_string())
                .detail(detail),
        )
        .await;
    }
}

fn validate_request(req: &TransferRequest) -> Result<(), EngineError> {
    if req.owner_id == 0 {
        return Err(EngineError::Validation("owner id is required".into()));
    }
    if req.amount == 0 {
        return Err(EngineError::Validation(
            "amount must be greater than zero".into(),
        ));
    }
    if !req.counterparty.matches_class(req.class) {
        return Err(EngineError::Validation(format!(
            "counterparty does not fit a {} transfer",
            req.class
        )));
    }
    req.counterparty
        .check_identifiers()
        .map_err(EngineError::Validation)?;
    if req.description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::Validation(format!(
            "description longer than {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    if let Some(client_ref) = &req.client_reference
        && (client_ref.trim().is_empty() || client_ref.len() > MAX_CLIENT_REFERENCE_LEN)
    {
        return Err(EngineError::Validation(format!(
            "client_reference must be 1-{} characters",
            MAX_CLIENT_REFERENCE_LEN
        )));
    }
    Ok(())
}
