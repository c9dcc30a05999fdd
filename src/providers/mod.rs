//! Provider Adapters
//!
//! One adapter per external provider, all behind the same capability
//! contract: verify a counterparty, initiate a movement, query its status.
//! The orchestrator only ever sees [`ProviderAdapter`]; which concrete
//! provider serves a class is decided by the [`ProviderRegistry`].
//!
//! `initiate` MUST be idempotent per [`IdempotencyKey`]: a second call with
//! the same key must not move money twice. A provider that answers a repeated
//! key with "duplicate" is asked what the first call became
//! ([`ProviderAdapter::lookup`]); the duplicate reply itself is never a
//! rejection.

pub mod bank;
pub mod bills;
pub mod card;
pub mod gift_card;
pub mod http;
pub mod mock;
pub mod registry;
pub mod wallet;

pub use bank::BankTransferProvider;
pub use bills::BillPaymentProvider;
pub use card::CardFundingProvider;
pub use gift_card::GiftCardProvider;
pub use http::{Credentials, ProviderContext};
pub use mock::{MockProvider, MockStep};
pub use registry::ProviderRegistry;
pub use wallet::WalletTransferProvider;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::{Currency, MinorUnits, OwnerId, TransactionId};
use crate::error::EngineError;
use crate::transfer::types::Counterparty;

/// Tag stored with a provider reference so reconciliation can find the
/// adapter again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Wallet,
    Bank,
    Bills,
    Card,
    GiftCard,
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Wallet => "wallet",
            ProviderKind::Bank => "bank",
            ProviderKind::Bills => "bills",
            ProviderKind::Card => "card",
            ProviderKind::GiftCard => "gift_card",
            ProviderKind::Mock => "mock",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wallet" => Ok(ProviderKind::Wallet),
            "bank" => Ok(ProviderKind::Bank),
            "bills" => Ok(ProviderKind::Bills),
            "card" => Ok(ProviderKind::Card),
            "gift_card" => Ok(ProviderKind::GiftCard),
            "mock" => Ok(ProviderKind::Mock),
            other => Err(format!("unknown provider kind: {}", other)),
        }
    }
}

/// Deterministic per-transaction key carried on every provider call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn for_transaction(id: TransactionId) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an adapter needs to move money
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDetails {
    pub transaction_id: TransactionId,
    pub owner_id: OwnerId,
    pub amount: MinorUnits,
    pub currency: Currency,
    pub counterparty: Counterparty,
    pub description: String,
}

impl TransferDetails {
    /// Local checks done before any network call
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.amount == 0 {
            return Err(ProviderError::InvalidRequest(
                "amount must be greater than zero".into(),
            ));
        }
        self.counterparty
            .check_identifiers()
            .map_err(ProviderError::InvalidRequest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Valid { display_name: String },
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiateOutcome {
    /// Settled; carries the provider reference
    Completed(String),
    /// Accepted, settlement unconfirmed
    Pending(String),
    /// Definitively refused; nothing moved at the provider
    Rejected(String),
}

impl InitiateOutcome {
    /// Express a status answer for a known reference as an initiate outcome
    pub fn from_status(reference: String, status: StatusOutcome) -> Self {
        match status {
            StatusOutcome::Completed => InitiateOutcome::Completed(reference),
            StatusOutcome::StillPending => InitiateOutcome::Pending(reference),
            StatusOutcome::Failed(reason) => InitiateOutcome::Rejected(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    Completed,
    Failed(String),
    StillPending,
}

impl StatusOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StatusOutcome::Completed => "completed",
            StatusOutcome::Failed(_) => "failed",
            StatusOutcome::StillPending => "pending",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider call timed out")]
    Timeout,

    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Unexpected provider response: {0}")]
    Decode(String),

    #[error("Provider authentication failed: {0}")]
    Auth(String),

    #[error("Provider not configured for {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Transient failures worth one more attempt with the same key
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout => true,
            ProviderError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::InvalidRequest(msg) => EngineError::Validation(msg),
            other => EngineError::ProviderUnavailable(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn verify_counterparty(
        &self,
        counterparty: &Counterparty,
    ) -> Result<VerifyOutcome, ProviderError>;

    /// # Idempotency
    /// A repeated key returns the original outcome without a second movement.
    async fn initiate(
        &self,
        details: &TransferDetails,
        key: &IdempotencyKey,
    ) -> Result<InitiateOutcome, ProviderError>;

    async fn query_status(&self, reference: &str) -> Result<StatusOutcome, ProviderError>;

    /// What became of the movement started under `key`.
    ///
    /// Used when `initiate`'s reply was lost or the provider flagged the key
    /// as a duplicate. `Ok(None)` means the provider has no record of the
    /// key, which is not proof that nothing moved.
    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<InitiateOutcome>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let id = TransactionId::new();
        assert_eq!(
            IdempotencyKey::for_transaction(id),
            IdempotencyKey::for_transaction(id)
        );
        assert_eq!(IdempotencyKey::for_transaction(id).as_str(), id.to_string());
    }

    #[test]
    fn test_details_validation() {
        let mut details = TransferDetails {
            transaction_id: TransactionId::new(),
            owner_id: 1,
            amount: 0,
            currency: Currency::ngn(),
            counterparty: Counterparty::Card {
                card_id: "c1".into(),
            },
            description: String::new(),
        };
        assert!(matches!(
            details.validate(),
            Err(ProviderError::InvalidRequest(_))
        ));

        details.amount = 100;
        assert!(details.validate().is_ok());

        details.counterparty = Counterparty::Card {
            card_id: String::new(),
        };
        assert!(details.validate().is_err());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(
            ProviderError::Http {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !ProviderError::Http {
                status: 401,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!ProviderError::InvalidRequest("x".into()).is_retryable());
    }

    #[test]
    fn test_status_as_initiate_outcome() {
        assert_eq!(
            InitiateOutcome::from_status("r1".into(), StatusOutcome::StillPending),
            InitiateOutcome::Pending("r1".into())
        );
        assert_eq!(
            InitiateOutcome::from_status("r1".into(), StatusOutcome::Failed("reversed".into())),
            InitiateOutcome::Rejected("reversed".into())
        );
    }

    #[test]
    fn test_kind_names() {
        for kind in [
            ProviderKind::Wallet,
            ProviderKind::Bank,
            ProviderKind::Bills,
            ProviderKind::Card,
            ProviderKind::GiftCard,
            ProviderKind::Mock,
        ] {
            assert_eq!(kind.as_str().parse::<ProviderKind>(), Ok(kind));
        }
    }
}
