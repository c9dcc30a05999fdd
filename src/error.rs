//! Engine Error Types
//!
//! One taxonomy for every component. Each variant maps to a stable reason
//! code (reported to callers) and an HTTP status suggestion.

use thiserror::Error;

use crate::core_types::MinorUnits;
use crate::risk::RiskLevel;
use crate::transfer::state::TransactionStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    // === Caller errors (nothing touched) ===
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Counterparty could not be verified: {0}")]
    CounterpartyInvalid(String),

    // === Policy denials (nothing moved) ===
    #[error("Daily limit exceeded (available: {available})")]
    LimitExceeded { available: MinorUnits },

    /// Detail stays in the audit log; the message is deliberately generic.
    #[error("Transaction declined")]
    RiskDenied { level: RiskLevel, score: u32 },

    // === Ledger errors ===
    #[error("Insufficient funds")]
    InsufficientFunds {
        available: MinorUnits,
        requested: MinorUnits,
    },

    #[error("Wallet is frozen")]
    WalletFrozen,

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    // === Provider stage ===
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider rejected the transfer: {0}")]
    ProviderRejected(String),

    #[error("Transaction {transaction_id} pending for {pending_secs}s")]
    IndeterminateState {
        transaction_id: String,
        pending_secs: i64,
    },

    // === Lifecycle ===
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    // === System ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable reason code for API responses and audit entries
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::CounterpartyInvalid(_) => "COUNTERPARTY_INVALID",
            EngineError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            EngineError::RiskDenied { .. } => "RISK_DENIED",
            EngineError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            EngineError::WalletFrozen => "WALLET_FROZEN",
            EngineError::WalletNotFound(_) => "WALLET_NOT_FOUND",
            EngineError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            EngineError::ProviderRejected(_) => "PROVIDER_REJECTED",
            EngineError::IndeterminateState { .. } => "INDETERMINATE_STATE",
            EngineError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            EngineError::InvalidTransition { .. } => "INVALID_STATE_TRANSITION",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_) | EngineError::CounterpartyInvalid(_) => 400,
            EngineError::RiskDenied { .. } => 403,
            EngineError::WalletNotFound(_) | EngineError::TransactionNotFound(_) => 404,
            EngineError::InvalidTransition { .. } | EngineError::Conflict(_) => 409,
            EngineError::LimitExceeded { .. }
            | EngineError::InsufficientFunds { .. }
            | EngineError::WalletFrozen
            | EngineError::ProviderRejected(_) => 422,
            EngineError::IndeterminateState { .. } => 202,
            EngineError::ProviderUnavailable(_) => 503,
            EngineError::Storage(_) | EngineError::Config(_) => 500,
        }
    }

    /// True when the failure happened before any money moved
    pub fn is_pre_debit(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::CounterpartyInvalid(_)
                | EngineError::LimitExceeded { .. }
                | EngineError::RiskDenied { .. }
                | EngineError::InsufficientFunds { .. }
                | EngineError::WalletFrozen
                | EngineError::WalletNotFound(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            EngineError::LimitExceeded { available: 5000 }.code(),
            "LIMIT_EXCEEDED"
        );
        assert_eq!(EngineError::WalletFrozen.code(), "WALLET_FROZEN");
        assert_eq!(
            EngineError::ProviderUnavailable("timeout".into()).code(),
            "PROVIDER_UNAVAILABLE"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(EngineError::Validation("x".into()).http_status(), 400);
        assert_eq!(
            EngineError::InsufficientFunds {
                available: 100,
                requested: 500
            }
            .http_status(),
            422
        );
        assert_eq!(EngineError::Storage("down".into()).http_status(), 500);
    }

    #[test]
    fn test_risk_denial_message_is_generic() {
        let err = EngineError::RiskDenied {
            level: RiskLevel::Critical,
            score: 95,
        };
        assert_eq!(err.to_string(), "Transaction declined");
        assert!(err.is_pre_debit());
    }

    #[test]
    fn test_limit_message_carries_available() {
        let err = EngineError::LimitExceeded { available: 5000 };
        assert_eq!(err.to_string(), "Daily limit exceeded (available: 5000)");
    }
}
