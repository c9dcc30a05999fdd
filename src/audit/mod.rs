//! Audit Recorder
//!
//! Append-only trail of every state transition, rejection, compensation and
//! manual override. Entries are never updated or deleted.

pub mod db;
pub mod memory;

pub use db::PgAuditSink;
pub use memory::InMemoryAuditSink;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::core_types::{OwnerId, TransactionId, WalletId};
use crate::error::EngineError;
use crate::transfer::state::TransactionStatus;

/// Who caused an entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Actor {
    System,
    Owner(OwnerId),
    Worker(String),
    Admin(String),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Owner(id) => write!(f, "owner:{}", id),
            Actor::Worker(name) => write!(f, "worker:{}", name),
            Actor::Admin(name) => write!(f, "admin:{}", name),
        }
    }
}

impl FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "system" {
            return Ok(Actor::System);
        }
        match s.split_once(':') {
            Some(("owner", id)) => id
                .parse()
                .map(Actor::Owner)
                .map_err(|_| format!("invalid owner actor: {}", s)),
            Some(("worker", name)) if !name.is_empty() => Ok(Actor::Worker(name.to_string())),
            Some(("admin", name)) if !name.is_empty() => Ok(Actor::Admin(name.to_string())),
            _ => Err(format!("invalid actor: {}", s)),
        }
    }
}

impl TryFrom<String> for Actor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Actor> for String {
    fn from(value: Actor) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Request aborted before any money moved
    TransferRejected,
    RiskAssessed,
    StatusChanged,
    Compensated,
    CompensationFailed,
    ReconciliationChecked,
    ForceCompleted,
    ForceFailed,
    BalanceAdjusted,
    WalletFrozen,
    WalletUnfrozen,
    LimitUpdated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::TransferRejected => "transfer_rejected",
            AuditAction::RiskAssessed => "risk_assessed",
            AuditAction::StatusChanged => "status_changed",
            AuditAction::Compensated => "compensated",
            AuditAction::CompensationFailed => "compensation_failed",
            AuditAction::ReconciliationChecked => "reconciliation_checked",
            AuditAction::ForceCompleted => "force_completed",
            AuditAction::ForceFailed => "force_failed",
            AuditAction::BalanceAdjusted => "balance_adjusted",
            AuditAction::WalletFrozen => "wallet_frozen",
            AuditAction::WalletUnfrozen => "wallet_unfrozen",
            AuditAction::LimitUpdated => "limit_updated",
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown audit action: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub transaction_id: Option<TransactionId>,
    pub wallet_id: Option<WalletId>,
    pub owner_id: Option<OwnerId>,
    pub actor: Actor,
    pub action: AuditAction,
    pub from_status: Option<TransactionStatus>,
    pub to_status: Option<TransactionStatus>,
    pub reason: Option<String>,
    /// Structured payload: risk snapshot, before/after values, provider detail
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(actor: Actor, action: AuditAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id: None,
            wallet_id: None,
            owner_id: None,
            actor,
            action,
            from_status: None,
            to_status: None,
            reason: None,
            detail: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn transaction(mut self, id: TransactionId) -> Self {
        self.transaction_id = Some(id);
        self
    }

    pub fn wallet(mut self, id: WalletId) -> Self {
        self.wallet_id = Some(id);
        self
    }

    pub fn owner(mut self, id: OwnerId) -> Self {
        self.owner_id = Some(id);
        self
    }

    pub fn transition(mut self, from: TransactionStatus, to: TransactionStatus) -> Self {
        self.from_status = Some(from);
        self.to_status = Some(to);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), EngineError>;

    /// Entries for one transaction, oldest first
    async fn for_transaction(&self, id: TransactionId) -> Result<Vec<AuditEntry>, EngineError>;
}

/// Record an entry on a path that must not fail because the audit log did
pub async fn record_or_log(sink: &dyn AuditSink, entry: AuditEntry) {
    let action = entry.action;
    let transaction_id = entry.transaction_id;
    if let Err(e) = sink.record(entry).await {
        error!(
            action = action.as_str(),
            transaction_id = ?transaction_id,
            error = %e,
            "Failed to write audit entry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_string_form() {
        for actor in [
            Actor::System,
            Actor::Owner(42),
            Actor::Worker("reconciliation-worker".into()),
            Actor::Admin("ops.ada".into()),
        ] {
            assert_eq!(actor.to_string().parse::<Actor>(), Ok(actor));
        }
        assert!("admin:".parse::<Actor>().is_err());
        assert!("owner:abc".parse::<Actor>().is_err());
        assert!("root".parse::<Actor>().is_err());
    }

    #[test]
    fn test_action_names_match_serde() {
        let action = AuditAction::ForceCompleted;
        assert_eq!(action.as_str().parse::<AuditAction>(), Ok(action));
        assert_eq!(
            serde_json::to_value(action).unwrap(),
            serde_json::json!("force_completed")
        );
    }

    #[test]
    fn test_entry_builder() {
        let id = TransactionId::new();
        let entry = AuditEntry::new(Actor::System, AuditAction::StatusChanged)
            .transaction(id)
            .transition(TransactionStatus::Debited, TransactionStatus::ProviderSubmitted)
            .reason("initiate");
        assert_eq!(entry.transaction_id, Some(id));
        assert_eq!(entry.to_status, Some(TransactionStatus::ProviderSubmitted));
        assert_eq!(entry.reason.as_deref(), Some("initiate"));
    }
}
