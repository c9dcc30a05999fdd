//! PostgreSQL limit rows
//!
//! Caps are stored as a JSONB object keyed by class name.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgRow;

use super::{LimitStore, TransactionLimit, VerificationTier};
use crate::core_types::{MinorUnits, OwnerId, TransactionClass};
use crate::db::SafeRow;
use crate::error::EngineError;

pub struct PgLimitStore {
    pool: PgPool,
}

impl PgLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_limit(row: &PgRow) -> Result<TransactionLimit, EngineError> {
        let owner_id: i64 = row
            .try_get_log("owner_id")
            .ok_or_else(|| EngineError::Storage("limit row missing owner_id".into()))?;
        let tier: i16 = row
            .try_get_log("tier")
            .ok_or_else(|| EngineError::Storage("limit row missing tier".into()))?;
        let caps: serde_json::Value = row
            .try_get_log("caps")
            .ok_or_else(|| EngineError::Storage("limit row missing caps".into()))?;

        let tier = VerificationTier::try_from(tier as u8).map_err(EngineError::Storage)?;
        let caps: HashMap<TransactionClass, MinorUnits> = serde_json::from_value(caps)
            .map_err(|e| EngineError::Storage(format!("invalid caps for owner {}: {}", owner_id, e)))?;

        Ok(TransactionLimit {
            owner_id: owner_id as OwnerId,
            tier,
            caps,
        })
    }
}

#[async_trait]
impl LimitStore for PgLimitStore {
    async fn get(&self, owner_id: OwnerId) -> Result<Option<TransactionLimit>, EngineError> {
        let row = sqlx::query(
            "SELECT owner_id, tier, caps FROM transaction_limits_tb WHERE owner_id = $1",
        )
        .bind(owner_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_limit).transpose()
    }

    async fn put(&self, limit: TransactionLimit) -> Result<Option<TransactionLimit>, EngineError> {
        let caps = serde_json::to_value(&limit.caps)
            .map_err(|e| EngineError::Storage(format!("serialize caps: {}", e)))?;

        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query(
            "SELECT owner_id, tier, caps FROM transaction_limits_tb WHERE owner_id = $1 FOR UPDATE",
        )
        .bind(limit.owner_id as i64)
        .fetch_optional(&mut *tx)
        .await?;
        let previous = previous.as_ref().map(Self::row_to_limit).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO transaction_limits_tb (owner_id, tier, caps, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (owner_id)
            DO UPDATE SET tier = EXCLUDED.tier, caps = EXCLUDED.caps, updated_at = NOW()
            "#,
        )
        .bind(limit.owner_id as i64)
        .bind(u8::from(limit.tier) as i16)
        .bind(caps)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(previous)
    }
}
