//! Transaction Database Layer
//!
//! PostgreSQL persistence for transaction rows.
//! All status updates use atomic CAS (Compare-And-Swap) operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgRow;

use super::state::TransactionStatus;
use super::store::TransactionStore;
use super::types::{Counterparty, FailureInfo, ProviderReference, Transaction};
use crate::core_types::{Currency, MinorUnits, OwnerId, TransactionClass, TransactionId, WalletId};
use crate::db::SafeRow;
use crate::error::EngineError;
use crate::providers::ProviderKind;
use crate::risk::{HistoryEntry, RiskAssessment};

const TX_COLUMNS: &str = r#"
    transaction_id, owner_id, wallet_id, class, amount, currency, counterparty,
    description, status, provider_kind, provider_reference, provider_last_status,
    provider_checked_at, risk, client_reference, debited, compensated,
    reason_code, last_error, created_at, updated_at, status_changed_at
"#;

/// Postgres unique-violation SQLSTATE
const UNIQUE_VIOLATION: &str = "23505";

pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_transaction(row: &PgRow) -> Result<Transaction, EngineError> {
        let missing = |col: &str| EngineError::Storage(format!("transaction row missing {}", col));
        let corrupt =
            |col: &str, e: String| EngineError::Storage(format!("invalid {}: {}", col, e));

        let id: String = row
            .try_get_log("transaction_id")
            .ok_or_else(|| missing("transaction_id"))?;
        let owner_id: i64 = row.try_get_log("owner_id").ok_or_else(|| missing("owner_id"))?;
        let wallet_id: i64 = row.try_get_log("wallet_id").ok_or_else(|| missing("wallet_id"))?;
        let class: String = row.try_get_log("class").ok_or_else(|| missing("class"))?;
        let amount: i64 = row.try_get_log("amount").ok_or_else(|| missing("amount"))?;
        let currency: String = row.try_get_log("currency").ok_or_else(|| missing("currency"))?;
        let counterparty: serde_json::Value = row
            .try_get_log("counterparty")
            .ok_or_else(|| missing("counterparty"))?;
        let status: i16 = row.try_get_log("status").ok_or_else(|| missing("status"))?;

        let provider_kind: Option<String> = row.try_get_log("provider_kind").flatten();
        let provider_ref = match provider_kind {
            Some(kind) => Some(ProviderReference {
                kind: kind
                    .parse::<ProviderKind>()
                    .map_err(|e| corrupt("provider_kind", e))?,
                reference: row
                    .try_get_log::<Option<String>>("provider_reference")
                    .flatten()
                    .ok_or_else(|| missing("provider_reference"))?,
                last_status: row.try_get_log("provider_last_status").flatten(),
                last_checked_at: row.try_get_log("provider_checked_at").flatten(),
            }),
            None => None,
        };

        let risk: Option<serde_json::Value> = row.try_get_log("risk").flatten();
        let risk = risk
            .map(serde_json::from_value::<RiskAssessment>)
            .transpose()
            .map_err(|e| corrupt("risk", e.to_string()))?;

        Ok(Transaction {
            id: id
                .parse::<TransactionId>()
                .map_err(|e| corrupt("transaction_id", e.to_string()))?,
            owner_id: owner_id as OwnerId,
            wallet_id: wallet_id as WalletId,
            class: class
                .parse::<TransactionClass>()
                .map_err(|e| corrupt("class", e))?,
            amount: amount as MinorUnits,
            currency: Currency::new(&currency).map_err(|e| corrupt("currency", e))?,
            counterparty: serde_json::from_value::<Counterparty>(counterparty)
                .map_err(|e| corrupt("counterparty", e.to_string()))?,
            description: row.try_get_log("description").unwrap_or_default(),
            status: TransactionStatus::from_id(status)
                .ok_or_else(|| corrupt("status", status.to_string()))?,
            provider_ref,
            risk,
            client_reference: row.try_get_log("client_reference").flatten(),
            debited: row.try_get_log("debited").unwrap_or(false),
            compensated: row.try_get_log("compensated").unwrap_or(false),
            reason_code: row.try_get_log("reason_code").flatten(),
            last_error: row.try_get_log("last_error").flatten(),
            created_at: row.try_get_log("created_at").ok_or_else(|| missing("created_at"))?,
            updated_at: row.try_get_log("updated_at").ok_or_else(|| missing("updated_at"))?,
            status_changed_at: row
                .try_get_log("status_changed_at")
                .ok_or_else(|| missing("status_changed_at"))?,
        })
    }

    fn row_to_history(row: &PgRow) -> Option<HistoryEntry> {
        let amount: i64 = row.try_get_log("amount")?;
        let status: i16 = row.try_get_log("status")?;
        Some(HistoryEntry {
            amount: amount as MinorUnits,
            status: TransactionStatus::from_id(status)?,
            created_at: row.try_get_log("created_at")?,
        })
    }

    async fn fetch_many(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Transaction>, EngineError> {
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_transaction).collect()
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn create(&self, tx: &Transaction) -> Result<(), EngineError> {
        let counterparty = serde_json::to_value(&tx.counterparty)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let risk = tx
            .risk
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let amount = i64::try_from(tx.amount)
            .map_err(|_| EngineError::Validation("amount exceeds storable range".into()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO transactions_tb
                (transaction_id, owner_id, wallet_id, class, amount, currency, counterparty,
                 counterparty_key, description, status, risk, client_reference, debited,
                 compensated, created_at, updated_at, status_changed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(tx.id.to_string())
        .bind(tx.owner_id as i64)
        .bind(tx.wallet_id as i64)
        .bind(tx.class.as_str())
        .bind(amount)
        .bind(tx.currency.as_str())
        .bind(counterparty)
        .bind(tx.counterparty.key())
        .bind(&tx.description)
        .bind(tx.status.id())
        .bind(risk)
        .bind(&tx.client_reference)
        .bind(tx.debited)
        .bind(tx.compensated)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .bind(tx.status_changed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(EngineError::Conflict(format!(
                    "transaction {} or its client reference already exists",
                    tx.id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, EngineError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions_tb WHERE transaction_id = $1",
            TX_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn get_by_client_ref(
        &self,
        owner_id: OwnerId,
        client_reference: &str,
    ) -> Result<Option<Transaction>, EngineError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions_tb WHERE owner_id = $1 AND client_reference = $2",
            TX_COLUMNS
        ))
        .bind(owner_id as i64)
        .bind(client_reference)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn update_status_if(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        new: TransactionStatus,
        failure: Option<&FailureInfo>,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET status = $1,
                debited = debited OR $2,
                reason_code = COALESCE($3, reason_code),
                last_error = COALESCE($4, last_error),
                updated_at = NOW(),
                status_changed_at = NOW()
            WHERE transaction_id = $5 AND status = $6
            "#,
        )
        .bind(new.id())
        .bind(new == TransactionStatus::Debited)
        .bind(failure.map(|f| f.reason_code.as_str()))
        .bind(failure.map(|f| f.message.as_str()))
        .bind(id.to_string())
        .bind(expected.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_provider_ref(
        &self,
        id: TransactionId,
        reference: &ProviderReference,
    ) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET provider_kind = $1, provider_reference = $2, provider_last_status = $3,
                provider_checked_at = $4, updated_at = NOW()
            WHERE transaction_id = $5
            "#,
        )
        .bind(reference.kind.as_str())
        .bind(&reference.reference)
        .bind(&reference.last_status)
        .bind(reference.last_checked_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::TransactionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_debited(&self, id: TransactionId) -> Result<bool, EngineError> {
        let result = sqlx::query(
            "UPDATE transactions_tb SET debited = TRUE, updated_at = NOW() WHERE transaction_id = $1",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_compensated_if(
        &self,
        id: TransactionId,
        expected: bool,
        new: bool,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET compensated = $1, updated_at = NOW()
            WHERE transaction_id = $2 AND compensated = $3
            "#,
        )
        .bind(new)
        .bind(id.to_string())
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn recent(
        &self,
        owner_id: OwnerId,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT amount, status, created_at FROM transactions_tb
            WHERE owner_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(owner_id as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(Self::row_to_history).collect())
    }

    async fn since(
        &self,
        owner_id: OwnerId,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT amount, status, created_at FROM transactions_tb
            WHERE owner_id = $1 AND created_at >= $2
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner_id as i64)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().filter_map(Self::row_to_history).collect())
    }

    async fn sum_for_window(
        &self,
        owner_id: OwnerId,
        class: TransactionClass,
        since: DateTime<Utc>,
    ) -> Result<MinorUnits, EngineError> {
        let counted: Vec<i16> = [
            TransactionStatus::Debited,
            TransactionStatus::ProviderSubmitted,
            TransactionStatus::Pending,
            TransactionStatus::Completed,
        ]
        .iter()
        .map(|s| s.id())
        .collect();

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT FROM transactions_tb
            WHERE owner_id = $1 AND class = $2 AND created_at >= $3 AND status = ANY($4)
            "#,
        )
        .bind(owner_id as i64)
        .bind(class.as_str())
        .bind(since)
        .bind(counted)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.max(0) as MinorUnits)
    }

    async fn has_counterparty(&self, owner_id: OwnerId, key: &str) -> Result<bool, EngineError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM transactions_tb
                WHERE owner_id = $1 AND counterparty_key = $2 AND status = $3
            )
            "#,
        )
        .bind(owner_id as i64)
        .bind(key)
        .bind(TransactionStatus::Completed.id())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn failures_since(
        &self,
        owner_id: OwnerId,
        since: DateTime<Utc>,
    ) -> Result<u32, EngineError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM transactions_tb
            WHERE owner_id = $1 AND status = $2 AND created_at >= $3
            "#,
        )
        .bind(owner_id as i64)
        .bind(TransactionStatus::Failed.id())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn find_stale(
        &self,
        statuses: &[TransactionStatus],
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, EngineError> {
        let ids: Vec<i16> = statuses.iter().map(|s| s.id()).collect();
        let sql = format!(
            r#"
            SELECT {} FROM transactions_tb
            WHERE status = ANY($1) AND status_changed_at < $2
            ORDER BY status_changed_at ASC
            LIMIT $3
            "#,
            TX_COLUMNS
        );
        self.fetch_many(
            sqlx::query(&sql)
                .bind(ids)
                .bind(cutoff)
                .bind(limit as i64),
        )
        .await
    }

    async fn find_compensation_due(&self, limit: usize) -> Result<Vec<Transaction>, EngineError> {
        let sql = format!(
            r#"
            SELECT {} FROM transactions_tb
            WHERE status = $1 AND debited AND NOT compensated
            ORDER BY created_at ASC
            LIMIT $2
            "#,
            TX_COLUMNS
        );
        self.fetch_many(
            sqlx::query(&sql)
                .bind(TransactionStatus::Failed.id())
                .bind(limit as i64),
        )
        .await
    }
}
