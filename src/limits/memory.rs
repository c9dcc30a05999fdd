use async_trait::async_trait;
use dashmap::DashMap;

use super::{LimitStore, TransactionLimit};
use crate::core_types::OwnerId;
use crate::error::EngineError;

/// In-process limit rows for tests and local runs
#[derive(Default)]
pub struct InMemoryLimitStore {
    rows: DashMap<OwnerId, TransactionLimit>,
}

impl InMemoryLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LimitStore for InMemoryLimitStore {
    async fn get(&self, owner_id: OwnerId) -> Result<Option<TransactionLimit>, EngineError> {
        Ok(self.rows.get(&owner_id).map(|row| row.clone()))
    }

    async fn put(&self, limit: TransactionLimit) -> Result<Option<TransactionLimit>, EngineError> {
        Ok(self.rows.insert(limit.owner_id, limit))
    }
}
