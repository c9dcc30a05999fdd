use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AuditAction, AuditEntry, AuditSink};
use crate::core_types::TransactionId;
use crate::error::EngineError;

/// Vec-backed audit log for tests and local runs
#[derive(Default)]
pub struct InMemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn count(&self, action: AuditAction) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), EngineError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn for_transaction(&self, id: TransactionId) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.transaction_id == Some(id))
            .cloned()
            .collect())
    }
}
