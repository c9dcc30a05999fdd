//! Reconciliation Worker
//!
//! Resolves `PENDING` transactions by asking the provider, on demand or on a
//! schedule, and carries the operator overrides for unresolved rows. Work on
//! one transaction id is serialized by a per-id async lock; different ids
//! run concurrently.
//!
//! The scheduled sweep also finishes rows a crash or storage error left
//! between the debit and a provider answer, and retries compensating
//! credits that failed when first attempted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::LedgerStores;
use super::compensation::{Compensator, FailOutcome};
use super::state::TransactionStatus;
use super::types::{FailureInfo, ProviderReference, Transaction};
use crate::audit::{Actor, AuditAction, AuditEntry, record_or_log};
use crate::config::ReconcileConfig;
use crate::core_types::TransactionId;
use crate::error::EngineError;
use crate::notify::{Notification, Notifier, dispatch};
use crate::providers::{
    IdempotencyKey, InitiateOutcome, ProviderError, ProviderKind, ProviderRegistry, StatusOutcome,
};

pub const WORKER_NAME: &str = "reconciliation-worker";

/// Where a crash or storage error can strand a row the orchestrator owned
const IN_FLIGHT: [TransactionStatus; 3] = [
    TransactionStatus::RiskChecked,
    TransactionStatus::Debited,
    TransactionStatus::ProviderSubmitted,
];

const UNRESOLVED: [TransactionStatus; 4] = [
    TransactionStatus::RiskChecked,
    TransactionStatus::Debited,
    TransactionStatus::ProviderSubmitted,
    TransactionStatus::Pending,
];

const NOT_SUBMITTED: &str = "NOT_SUBMITTED";

/// A transaction unresolved for too long to trust the sweep alone
#[derive(Debug, Clone)]
pub struct Indeterminate {
    pub transaction: Transaction,
    /// Seconds since the row entered its current status
    pub pending_secs: i64,
}

impl Indeterminate {
    pub fn to_error(&self) -> EngineError {
        EngineError::IndeterminateState {
            transaction_id: self.transaction.id.to_string(),
            pending_secs: self.pending_secs,
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale rows looked at, in flight and pending together
    pub examined: usize,
    /// Of `examined`, rows stranded before reaching `Pending`
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub errors: usize,
    pub refunds_applied: usize,
    pub indeterminate: usize,
}

impl SweepReport {
    fn tally(&mut self, results: Vec<(TransactionId, Result<TransactionStatus, EngineError>)>) {
        for (id, result) in results {
            match result {
                Ok(TransactionStatus::Completed) => self.completed += 1,
                Ok(TransactionStatus::Failed) => self.failed += 1,
                Ok(_) => self.still_pending += 1,
                Err(e) => {
                    error!(transaction_id = %id, error = %e, "Reconciliation failed");
                    self.errors += 1;
                }
            }
        }
    }
}

pub struct ReconciliationWorker {
    stores: LedgerStores,
    compensator: Compensator,
    registry: ProviderRegistry,
    notifier: Arc<dyn Notifier>,
    config: ReconcileConfig,
    provider_timeout: Duration,
    locks: DashMap<TransactionId, Arc<Mutex<()>>>,
}

impl ReconciliationWorker {
    pub fn new(
        stores: LedgerStores,
        registry: ProviderRegistry,
        notifier: Arc<dyn Notifier>,
        config: ReconcileConfig,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            compensator: stores.compensator(),
            stores,
            registry,
            notifier,
            config,
            provider_timeout,
            locks: DashMap::new(),
        }
    }

    fn actor() -> Actor {
        Actor::Worker(WORKER_NAME.to_string())
    }

    /// Run `f` holding the lock for `id`
    async fn with_lock<T, F, Fut>(&self, id: TransactionId, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let lock = self.locks.entry(id).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            f().await
        };
        drop(lock);
        // Only the map still holds it: nobody is waiting
        self.locks
            .remove_if(&id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn load(&self, id: TransactionId) -> Result<Transaction, EngineError> {
        self.stores
            .transactions
            .get(id)
            .await?
            .ok_or_else(|| EngineError::TransactionNotFound(id.to_string()))
    }

    fn stale_cutoff(&self) -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::seconds(self.config.reconcile_after_secs as i64)
    }

    // ========================================================================
    // Provider-driven resolution
    // ========================================================================

    /// Ask the provider about a pending transaction and apply a definitive
    /// answer. Returns the status after the check.
    pub async fn reconcile(&self, id: TransactionId) -> Result<TransactionStatus, EngineError> {
        self.with_lock(id, || self.reconcile_locked(id)).await
    }

    async fn reconcile_locked(&self, id: TransactionId) -> Result<TransactionStatus, EngineError> {
        let tx = self.load(id).await?;
        if tx.status != TransactionStatus::Pending {
            debug!(transaction_id = %id, status = %tx.status, "Nothing to reconcile");
            return Ok(tx.status);
        }

        let Some(reference) = tx.provider_ref.clone() else {
            warn!(transaction_id = %id, "Pending transaction has no provider reference");
            self.audit_check(&tx, "no provider reference", None).await;
            return Ok(tx.status);
        };

        let adapter = self.registry.for_kind(reference.kind)?;
        let outcome = match timeout(self.provider_timeout, adapter.query_status(&reference.reference)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(transaction_id = %id, error = %e, "Status query failed");
                self.audit_check(&tx, &e.to_string(), None).await;
                return Err(e.into());
            }
        };

        let checked = ProviderReference {
            last_status: Some(outcome.label().to_string()),
            last_checked_at: Some(Utc::now()),
            ..reference
        };
        if let Err(e) = self.stores.transactions.set_provider_ref(id, &checked).await {
            error!(transaction_id = %id, error = %e, "Failed to record status check");
        }

        match outcome {
            StatusOutcome::Completed => {
                self.complete(
                    &tx,
                    TransactionStatus::Pending,
                    &Self::actor(),
                    AuditAction::StatusChanged,
                    None,
                )
                .await?;
            }
            StatusOutcome::Failed(reason) => {
                let err = EngineError::ProviderRejected(reason);
                self.fail(
                    &tx,
                    TransactionStatus::Pending,
                    &Self::actor(),
                    FailureInfo::new(err.code(), err.to_string()),
                )
                .await?;
            }
            StatusOutcome::StillPending => {
                debug!(transaction_id = %id, "Provider still pending");
                self.audit_check(&tx, "provider still pending", Some(&checked)).await;
            }
        }

        Ok(self.load(id).await?.status)
    }

    /// Finish a row stranded between persisting and a provider answer.
    /// Returns the status afterwards.
    pub async fn recover(&self, id: TransactionId) -> Result<TransactionStatus, EngineError> {
        self.with_lock(id, || self.recover_locked(id)).await
    }

    async fn recover_locked(&self, id: TransactionId) -> Result<TransactionStatus, EngineError> {
        let tx = self.load(id).await?;
        match tx.status {
            TransactionStatus::RiskChecked | TransactionStatus::Debited => {
                // The provider was never called; give the money back if it left
                warn!(
                    transaction_id = %id,
                    status = %tx.status,
                    debited = tx.debited,
                    "Transaction stopped before reaching the provider"
                );
                if tx.status == TransactionStatus::RiskChecked && !tx.debited {
                    self.audit_check(&tx, "no debit recorded, failed without a refund", None)
                        .await;
                }
                self.fail(
                    &tx,
                    tx.status,
                    &Self::actor(),
                    FailureInfo::new(NOT_SUBMITTED, "interrupted before the provider call"),
                )
                .await?;
            }
            TransactionStatus::ProviderSubmitted => self.recover_submitted(&tx).await?,
            status => debug!(transaction_id = %id, status = %status, "Nothing to recover"),
        }
        Ok(self.load(id).await?.status)
    }

    /// The call went out but its answer was never recorded: ask the
    /// provider what it did with our idempotency key
    async fn recover_submitted(&self, tx: &Transaction) -> Result<(), EngineError> {
        let adapter = match &tx.provider_ref {
            Some(reference) => self.registry.for_kind(reference.kind)?,
            None => self.registry.for_class(tx.class)?,
        };
        let key = IdempotencyKey::for_transaction(tx.id);
        let found = match timeout(self.provider_timeout, adapter.lookup(&key)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };
        let found = match found {
            Ok(found) => found,
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "Provider lookup failed");
                self.audit_check(tx, &e.to_string(), None).await;
                return Err(e.into());
            }
        };

        let from = TransactionStatus::ProviderSubmitted;
        match found {
            Some(InitiateOutcome::Completed(reference)) => {
                self.record_lookup(tx, adapter.kind(), reference, "completed")
                    .await;
                self.complete(tx, from, &Self::actor(), AuditAction::StatusChanged, None)
                    .await?;
            }
            Some(InitiateOutcome::Pending(reference)) => {
                self.record_lookup(tx, adapter.kind(), reference, "pending")
                    .await;
                let moved = self
                    .stores
                    .transactions
                    .update_status_if(tx.id, from, TransactionStatus::Pending, None)
                    .await?;
                if moved {
                    self.audit_transition(tx, from, TransactionStatus::Pending).await;
                    info!(transaction_id = %tx.id, "Recovered transaction is pending at the provider");
                    dispatch(
                        &self.notifier,
                        Notification::TransferPending {
                            owner_id: tx.owner_id,
                            transaction_id: tx.id,
                        },
                    );
                }
            }
            Some(InitiateOutcome::Rejected(reason)) => {
                let err = EngineError::ProviderRejected(reason);
                self.fail(
                    tx,
                    from,
                    &Self::actor(),
                    FailureInfo::new(err.code(), err.to_string()),
                )
                .await?;
            }
            None => {
                // Absence is not proof nothing moved; left for an operator
                // once it turns indeterminate
                info!(transaction_id = %tx.id, "Provider has no record of the request yet");
                self.audit_check(tx, "provider has no record of this key", None)
                    .await;
            }
        }
        Ok(())
    }

    async fn record_lookup(&self, tx: &Transaction, kind: ProviderKind, reference: String, label: &str) {
        let found = ProviderReference {
            last_status: Some(label.to_string()),
            last_checked_at: Some(Utc::now()),
            ..ProviderReference::new(kind, reference)
        };
        if let Err(e) = self.stores.transactions.set_provider_ref(tx.id, &found).await {
            error!(transaction_id = %tx.id, error = %e, "Failed to store provider reference");
        }
    }

    // ========================================================================
    // Operator overrides
    // ========================================================================

    /// Mark an unresolved transaction completed without asking the provider
    pub async fn force_complete(
        &self,
        id: TransactionId,
        actor: Actor,
        note: &str,
    ) -> Result<Transaction, EngineError> {
        let note = require_note(note)?;
        self.with_lock(id, || async {
            let tx = self.load(id).await?;
            self.check_override(&tx, TransactionStatus::Completed)?;
            if !self
                .complete(&tx, tx.status, &actor, AuditAction::ForceCompleted, Some(note))
                .await?
            {
                return Err(EngineError::Conflict(format!(
                    "transaction {} changed during force-complete",
                    id
                )));
            }
            warn!(transaction_id = %id, actor = %actor, "Transaction force-completed");
            self.load(id).await
        })
        .await
    }

    /// Mark an unresolved transaction failed and refund the wallet if it
    /// was debited
    pub async fn force_fail(
        &self,
        id: TransactionId,
        actor: Actor,
        note: &str,
    ) -> Result<Transaction, EngineError> {
        let note = require_note(note)?;
        self.with_lock(id, || async {
            let tx = self.load(id).await?;
            self.check_override(&tx, TransactionStatus::Failed)?;
            let refunded = match self
                .fail(&tx, tx.status, &actor, FailureInfo::new("FORCE_FAILED", note))
                .await?
            {
                FailOutcome::Failed { refunded } => refunded,
                FailOutcome::Lost => {
                    return Err(EngineError::Conflict(format!(
                        "transaction {} changed during force-fail",
                        id
                    )));
                }
            };
            record_or_log(
                self.stores.audit.as_ref(),
                AuditEntry::new(actor.clone(), AuditAction::ForceFailed)
                    .transaction(id)
                    .owner(tx.owner_id)
                    .wallet(tx.wallet_id)
                    .transition(tx.status, TransactionStatus::Failed)
                    .reason(note)
                    .detail(json!({ "refunded": refunded })),
            )
            .await;
            warn!(transaction_id = %id, actor = %actor, refunded, "Transaction force-failed");
            self.load(id).await
        })
        .await
    }

    /// Overrides need a row that can still move to `to`. A row the
    /// orchestrator may still be driving must have gone stale first.
    fn check_override(&self, tx: &Transaction, to: TransactionStatus) -> Result<(), EngineError> {
        if !tx.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                from: tx.status,
                to,
            });
        }
        if tx.status != TransactionStatus::Pending && tx.status_changed_at > self.stale_cutoff() {
            return Err(EngineError::Conflict(format!(
                "transaction {} is still being processed",
                tx.id
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Scheduled work
    // ========================================================================

    /// One pass: finish stranded rows, reconcile stale pending rows, retry
    /// owed refunds, raise indeterminate alerts
    pub async fn sweep(&self) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        let cutoff = self.stale_cutoff();

        let stranded = self
            .stores
            .transactions
            .find_stale(&IN_FLIGHT, cutoff, self.config.batch_size)
            .await?;
        report.in_flight = stranded.len();
        let results: Vec<_> = stream::iter(stranded)
            .map(|tx| async move { (tx.id, self.recover(tx.id).await) })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;
        report.tally(results);

        let pending = self
            .stores
            .transactions
            .find_stale(&[TransactionStatus::Pending], cutoff, self.config.batch_size)
            .await?;
        report.examined = report.in_flight + pending.len();
        let results: Vec<_> = stream::iter(pending)
            .map(|tx| async move { (tx.id, self.reconcile(tx.id).await) })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;
        report.tally(results);

        let owed = self
            .stores
            .transactions
            .find_compensation_due(self.config.batch_size)
            .await?;
        for tx in owed {
            match self.retry_refund(tx.id).await {
                Ok(true) => report.refunds_applied += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(transaction_id = %tx.id, error = %e, "Refund retry failed");
                    report.errors += 1;
                }
            }
        }

        let stuck = self.indeterminate().await?;
        report.indeterminate = stuck.len();
        for item in stuck {
            dispatch(
                &self.notifier,
                Notification::IndeterminateTransaction {
                    transaction_id: item.transaction.id,
                    pending_secs: item.pending_secs,
                },
            );
        }

        if report.examined > 0 || report.refunds_applied > 0 || report.indeterminate > 0 {
            info!(
                examined = report.examined,
                in_flight = report.in_flight,
                completed = report.completed,
                failed = report.failed,
                still_pending = report.still_pending,
                errors = report.errors,
                refunds_applied = report.refunds_applied,
                indeterminate = report.indeterminate,
                "Reconciliation sweep finished"
            );
        } else {
            debug!("Reconciliation sweep found nothing to do");
        }
        Ok(report)
    }

    async fn retry_refund(&self, id: TransactionId) -> Result<bool, EngineError> {
        self.with_lock(id, || async {
            let tx = self.load(id).await?;
            if !tx.compensation_due() {
                return Ok(false);
            }
            self.compensator.refund(&tx, &Self::actor()).await
        })
        .await
    }

    /// Unresolved transactions that have sat in their status longer than
    /// `indeterminate_after_secs`
    pub async fn indeterminate(&self) -> Result<Vec<Indeterminate>, EngineError> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(self.config.indeterminate_after_secs as i64);
        let rows = self
            .stores
            .transactions
            .find_stale(&UNRESOLVED, cutoff, self.config.batch_size)
            .await?;
        Ok(rows
            .into_iter()
            .map(|transaction| Indeterminate {
                pending_secs: (now - transaction.status_changed_at).num_seconds(),
                transaction,
            })
            .collect())
    }

    /// Sweep forever at the configured interval
    pub async fn run(&self) -> ! {
        info!(
            interval_secs = self.config.interval_secs,
            reconcile_after_secs = self.config.reconcile_after_secs,
            concurrency = self.config.concurrency,
            "Starting reconciliation worker"
        );

        let mut ticker = tokio::time::interval(self.config.interval());
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Reconciliation sweep failed");
            }
        }
    }

    // ========================================================================
    // Shared transitions
    // ========================================================================

    async fn complete(
        &self,
        tx: &Transaction,
        from: TransactionStatus,
        actor: &Actor,
        action: AuditAction,
        note: Option<&str>,
    ) -> Result<bool, EngineError> {
        let moved = self
            .stores
            .transactions
            .update_status_if(tx.id, from, TransactionStatus::Completed, None)
            .await?;
        if !moved {
            return Ok(false);
        }

        let mut entry = AuditEntry::new(actor.clone(), action)
            .transaction(tx.id)
            .owner(tx.owner_id)
            .wallet(tx.wallet_id)
            .transition(from, TransactionStatus::Completed);
        if let Some(note) = note {
            entry = entry.reason(note);
        }
        record_or_log(self.stores.audit.as_ref(), entry).await;
        info!(transaction_id = %tx.id, from = %from, actor = %actor, "Transaction completed");

        dispatch(
            &self.notifier,
            Notification::TransferCompleted {
                owner_id: tx.owner_id,
                transaction_id: tx.id,
                amount: tx.amount,
                currency: tx.currency.clone(),
            },
        );
        Ok(true)
    }

    async fn fail(
        &self,
        tx: &Transaction,
        from: TransactionStatus,
        actor: &Actor,
        failure: FailureInfo,
    ) -> Result<FailOutcome, EngineError> {
        let reason = failure.message.clone();
        let outcome = self.compensator.fail(tx, from, failure, actor).await?;
        if let FailOutcome::Failed { refunded } = outcome {
            dispatch(
                &self.notifier,
                Notification::TransferFailed {
                    owner_id: tx.owner_id,
                    transaction_id: tx.id,
                    reason,
                    refunded,
                },
            );
        }
        Ok(outcome)
    }

    async fn audit_transition(&self, tx: &Transaction, from: TransactionStatus, to: TransactionStatus) {
        record_or_log(
            self.stores.audit.as_ref(),
            AuditEntry::new(Self::actor(), AuditAction::StatusChanged)
                .transaction(tx.id)
                .owner(tx.owner_id)
                .wallet(tx.wallet_id)
                .transition(from, to),
        )
        .await;
    }

    async fn audit_check(&self, tx: &Transaction, note: &str, reference: Option<&ProviderReference>) {
        record_or_log(
            self.stores.audit.as_ref(),
            AuditEntry::new(Self::actor(), AuditAction::ReconciliationChecked)
                .transaction(tx.id)
                .owner(tx.owner_id)
                .reason(note)
                .detail(json!({
                    "provider_status": reference.and_then(|r| r.last_status.clone()),
                })),
        )
        .await;
    }
}

fn require_note(note: &str) -> Result<&str, EngineError> {
    let note = note.trim();
    if note.is_empty() {
        return Err(EngineError::Validation(
            "manual overrides require a note".into(),
        ));
    }
    Ok(note)
}
