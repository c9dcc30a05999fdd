//! PostgreSQL audit log (insert-only)

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgRow;

use super::{Actor, AuditAction, AuditEntry, AuditSink};
use crate::core_types::{OwnerId, TransactionId, WalletId};
use crate::db::SafeRow;
use crate::error::EngineError;
use crate::transfer::state::TransactionStatus;

pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &PgRow) -> Result<AuditEntry, EngineError> {
        let missing = |col: &str| EngineError::Storage(format!("audit row missing {}", col));

        let transaction_id: Option<String> = row.try_get_log("transaction_id").flatten();
        let actor: String = row.try_get_log("actor").ok_or_else(|| missing("actor"))?;
        let action: String = row.try_get_log("action").ok_or_else(|| missing("action"))?;
        let from_status: Option<i16> = row.try_get_log("from_status").flatten();
        let to_status: Option<i16> = row.try_get_log("to_status").flatten();

        Ok(AuditEntry {
            id: row.try_get_log("entry_id").ok_or_else(|| missing("entry_id"))?,
            transaction_id: transaction_id
                .map(|s| s.parse::<TransactionId>())
                .transpose()
                .map_err(|e| EngineError::Storage(e.to_string()))?,
            wallet_id: row
                .try_get_log::<Option<i64>>("wallet_id")
                .flatten()
                .map(|v| v as WalletId),
            owner_id: row
                .try_get_log::<Option<i64>>("owner_id")
                .flatten()
                .map(|v| v as OwnerId),
            actor: actor.parse::<Actor>().map_err(EngineError::Storage)?,
            action: action.parse::<AuditAction>().map_err(EngineError::Storage)?,
            from_status: from_status.and_then(TransactionStatus::from_id),
            to_status: to_status.and_then(TransactionStatus::from_id),
            reason: row.try_get_log("reason").flatten(),
            detail: row.try_get_log("detail").unwrap_or(serde_json::Value::Null),
            at: row.try_get_log("created_at").ok_or_else(|| missing("created_at"))?,
        })
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log_tb
                (entry_id, transaction_id, wallet_id, owner_id, actor, action,
                 from_status, to_status, reason, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.id)
        .bind(entry.transaction_id.map(|id| id.to_string()))
        .bind(entry.wallet_id.map(|id| id as i64))
        .bind(entry.owner_id.map(|id| id as i64))
        .bind(entry.actor.to_string())
        .bind(entry.action.as_str())
        .bind(entry.from_status.map(|s| s.id()))
        .bind(entry.to_status.map(|s| s.id()))
        .bind(&entry.reason)
        .bind(&entry.detail)
        .bind(entry.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn for_transaction(&self, id: TransactionId) -> Result<Vec<AuditEntry>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, transaction_id, wallet_id, owner_id, actor, action,
                   from_status, to_status, reason, detail, created_at
            FROM audit_log_tb
            WHERE transaction_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }
}
