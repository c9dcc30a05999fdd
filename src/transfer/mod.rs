//! Transfer Orchestration
//!
//! Sequences verification, limit and risk gates, the wallet debit, the
//! provider call and outcome persistence for one money movement, and
//! resolves outcomes the provider could not confirm immediately.
//!
//! # Modules
//!
//! - `state`: lifecycle states and legal edges
//! - `types`: requests, transaction rows, receipts
//! - `store` / `db`: transaction persistence (in-memory and PostgreSQL)
//! - `compensation`: failure after the debit and the compensating credit
//! - `orchestrator`: the request path
//! - `reconcile`: pending resolution, force actions, the scheduled sweep
//! - `admin`: audited balance, freeze and limit changes
//! - `api`: HTTP handlers

pub mod admin;
pub mod api;
pub mod compensation;
pub mod db;
pub mod orchestrator;
pub mod reconcile;
pub mod state;
pub mod store;
pub mod types;

pub use admin::AdminService;
pub use compensation::{Compensator, FailOutcome};
pub use db::PgTransactionStore;
pub use orchestrator::TransferOrchestrator;
pub use reconcile::ReconciliationWorker;
pub use state::TransactionStatus;
pub use store::{InMemoryTransactionStore, TransactionStore};
pub use types::{
    Counterparty, FailureInfo, ProviderReference, ResponseStatus, Transaction, TransferContext,
    TransferRequest, TransferResponse,
};

use std::sync::Arc;

use crate::audit::{AuditSink, InMemoryAuditSink};
use crate::limits::{InMemoryLimitStore, LimitStore};
use crate::wallet::{InMemoryWalletStore, WalletStore};

/// The four record stores every service in this module works against
#[derive(Clone)]
pub struct LedgerStores {
    pub wallets: Arc<dyn WalletStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub limits: Arc<dyn LimitStore>,
    pub audit: Arc<dyn AuditSink>,
}

impl LedgerStores {
    /// Process-local stores; nothing survives a restart
    pub fn in_memory() -> Self {
        Self {
            wallets: Arc::new(InMemoryWalletStore::new()),
            transactions: Arc::new(InMemoryTransactionStore::new()),
            limits: Arc::new(InMemoryLimitStore::new()),
            audit: Arc::new(InMemoryAuditSink::new()),
        }
    }

    pub(crate) fn compensator(&self) -> Compensator {
        Compensator::new(
            self.transactions.clone(),
            self.wallets.clone(),
            self.audit.clone(),
        )
    }
}
