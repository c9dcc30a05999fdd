//! Transaction storage
//!
//! Status changes go through [`TransactionStore::update_status_if`], an
//! atomic compare-and-swap. Callers validate the edge first; the store only
//! guarantees nobody else moved the row in between.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::state::TransactionStatus;
use super::types::{FailureInfo, ProviderReference, Transaction};
use crate::core_types::{MinorUnits, OwnerId, TransactionClass, TransactionId};
use crate::error::EngineError;
use crate::risk::HistoryEntry;

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Fails with `Conflict` when (owner, client_reference) already exists
    async fn create(&self, tx: &Transaction) -> Result<(), EngineError>;

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, EngineError>;

    async fn get_by_client_ref(
        &self,
        owner_id: OwnerId,
        client_reference: &str,
    ) -> Result<Option<Transaction>, EngineError>;

    /// Returns false if the row was not in `expected`.
    /// Moving to `Debited` also sets the `debited` flag.
    /// Stamps `status_changed_at`.
    async fn update_status_if(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        new: TransactionStatus,
        failure: Option<&FailureInfo>,
    ) -> Result<bool, EngineError>;

    async fn set_provider_ref(
        &self,
        id: TransactionId,
        reference: &ProviderReference,
    ) -> Result<(), EngineError>;

    /// Set the `debited` flag without moving the status.
    /// Returns false if the row does not exist.
    async fn mark_debited(&self, id: TransactionId) -> Result<bool, EngineError>;

    /// CAS on the `compensated` flag
    async fn set_compensated_if(
        &self,
        id: TransactionId,
        expected: bool,
        new: bool,
    ) -> Result<bool, EngineError>;

    /// Newest first
    async fn recent(&self, owner_id: OwnerId, limit: usize)
    -> Result<Vec<HistoryEntry>, EngineError>;

    async fn since(
        &self,
        owner_id: OwnerId,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, EngineError>;

    /// Sum of limit-counting transactions of `class` created at or after `since`
    async fn sum_for_window(
        &self,
        owner_id: OwnerId,
        class: TransactionClass,
        since: DateTime<Utc>,
    ) -> Result<MinorUnits, EngineError>;

    /// Any completed transaction with this counterparty key
    async fn has_counterparty(&self, owner_id: OwnerId, key: &str) -> Result<bool, EngineError>;

    async fn failures_since(
        &self,
        owner_id: OwnerId,
        since: DateTime<Utc>,
    ) -> Result<u32, EngineError>;

    /// Rows in one of `statuses` that entered it before `cutoff`,
    /// longest-stuck first
    async fn find_stale(
        &self,
        statuses: &[TransactionStatus],
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, EngineError>;

    /// `Failed` rows that were debited but never compensated
    async fn find_compensation_due(&self, limit: usize) -> Result<Vec<Transaction>, EngineError>;
}

/// In-process transaction store for tests and local runs
#[derive(Default)]
pub struct InMemoryTransactionStore {
    rows: DashMap<TransactionId, Transaction>,
    client_refs: DashMap<(OwnerId, String), TransactionId>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect<F>(&self, filter: F) -> Vec<Transaction>
    where
        F: Fn(&Transaction) -> bool,
    {
        self.rows
            .iter()
            .filter(|r| filter(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn create(&self, tx: &Transaction) -> Result<(), EngineError> {
        if let Some(client_ref) = &tx.client_reference {
            match self.client_refs.entry((tx.owner_id, client_ref.clone())) {
                Entry::Occupied(_) => {
                    return Err(EngineError::Conflict(format!(
                        "client reference {} already used",
                        client_ref
                    )));
                }
                Entry::Vacant(e) => {
                    e.insert(tx.id);
                }
            }
        }
        match self.rows.entry(tx.id) {
            Entry::Occupied(_) => Err(EngineError::Conflict(format!(
                "transaction {} already exists",
                tx.id
            ))),
            Entry::Vacant(e) => {
                e.insert(tx.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, EngineError> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn get_by_client_ref(
        &self,
        owner_id: OwnerId,
        client_reference: &str,
    ) -> Result<Option<Transaction>, EngineError> {
        let id = match self
            .client_refs
            .get(&(owner_id, client_reference.to_string()))
        {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get(id).await
    }

    async fn update_status_if(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        new: TransactionStatus,
        failure: Option<&FailureInfo>,
    ) -> Result<bool, EngineError> {
        let mut row = match self.rows.get_mut(&id) {
            Some(row) => row,
            None => return Ok(false),
        };
        if row.status != expected {
            return Ok(false);
        }
        let now = Utc::now();
        row.status = new;
        if new == TransactionStatus::Debited {
            row.debited = true;
        }
        if let Some(f) = failure {
            row.reason_code = Some(f.reason_code.clone());
            row.last_error = Some(f.message.clone());
        }
        row.updated_at = now;
        row.status_changed_at = now;
        Ok(true)
    }

    async fn set_provider_ref(
        &self,
        id: TransactionId,
        reference: &ProviderReference,
    ) -> Result<(), EngineError> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| EngineError::TransactionNotFound(id.to_string()))?;
        row.provider_ref = Some(reference.clone());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_debited(&self, id: TransactionId) -> Result<bool, EngineError> {
        let mut row = match self.rows.get_mut(&id) {
            Some(row) => row,
            None => return Ok(false),
        };
        row.debited = true;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_compensated_if(
        &self,
        id: TransactionId,
        expected: bool,
        new: bool,
    ) -> Result<bool, EngineError> {
        let mut row = match self.rows.get_mut(&id) {
            Some(row) => row,
            None => return Ok(false),
        };
        if row.compensated != expected {
            return Ok(false);
        }
        row.compensated = new;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn recent(
        &self,
        owner_id: OwnerId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        let mut rows = self.collect(|t| t.owner_id == owner_id);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows.iter().take(limit).map(Transaction::history_entry).collect())
    }

    async fn since(
        &self,
        owner_id: OwnerId,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        let mut rows = self.collect(|t| t.owner_id == owner_id && t.created_at >= since);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows.iter().map(Transaction::history_entry).collect())
    }

    async fn sum_for_window(
        &self,
        owner_id: OwnerId,
        class: TransactionClass,
        since: DateTime<Utc>,
    ) -> Result<MinorUnits, EngineError> {
        Ok(self
            .collect(|t| {
                t.owner_id == owner_id
                    && t.class == class
                    && t.created_at >= since
                    && t.status.counts_toward_limit()
            })
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.amount)))
    }

    async fn has_counterparty(&self, owner_id: OwnerId, key: &str) -> Result<bool, EngineError> {
        Ok(self.rows.iter().any(|r| {
            r.owner_id == owner_id
                && r.status == TransactionStatus::Completed
                && r.counterparty.key() == key
        }))
    }

    async fn failures_since(
        &self,
        owner_id: OwnerId,
        since: DateTime<Utc>,
    ) -> Result<u32, EngineError> {
        Ok(self
            .collect(|t| {
                t.owner_id == owner_id
                    && t.status == TransactionStatus::Failed
                    && t.created_at >= since
            })
            .len() as u32)
    }

    async fn find_stale(
        &self,
        statuses: &[TransactionStatus],
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, EngineError> {
        let mut rows =
            self.collect(|t| statuses.contains(&t.status) && t.status_changed_at < cutoff);
        rows.sort_by(|a, b| a.status_changed_at.cmp(&b.status_changed_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn find_compensation_due(&self, limit: usize) -> Result<Vec<Transaction>, EngineError> {
        let mut rows = self.collect(Transaction::compensation_due);
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows.truncate(limit);
        Ok(rows)
    }
}
