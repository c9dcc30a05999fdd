//! Wallet Ledger - transfer orchestration over a double-guarded balance store
//!
//! A transfer is verified, limit-checked, risk-scored, debited and only then
//! handed to the provider serving its class. Every step is persisted before
//! the next one runs, so a crash or a lost provider answer leaves a row that
//! reconciliation can finish or compensate.
//!
//! # Modules
//!
//! - [`core_types`] - ids, currency, transaction classes
//! - [`money`] - minor/major unit conversion
//! - [`error`] - engine error taxonomy
//! - [`wallet`] - balances with atomic debit/credit
//! - [`limits`] - per-owner daily caps and reservations
//! - [`risk`] - weighted risk scoring
//! - [`audit`] - append-only audit trail
//! - [`providers`] - provider adapters and routing
//! - [`transfer`] - orchestration, compensation, reconciliation, HTTP API
//! - [`notify`] - owner notifications
//! - [`config`] / [`logging`] / [`db`] - service plumbing

// Core types - must be first!
pub mod core_types;

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod limits;
pub mod logging;
pub mod money;
pub mod notify;
pub mod providers;
pub mod risk;
pub mod transfer;
pub mod wallet;

pub use core_types::{Currency, MinorUnits, OwnerId, TransactionClass, TransactionId, WalletId};
pub use error::EngineError;
pub use transfer::{
    AdminService, LedgerStores, ReconciliationWorker, Transaction, TransactionStatus,
    TransferOrchestrator, TransferRequest, TransferResponse,
};
