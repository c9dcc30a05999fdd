//! Transfer types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::TransactionStatus;
use crate::core_types::{
    Currency, MinorUnits, OwnerId, TransactionClass, TransactionId, WalletId,
};
use crate::providers::ProviderKind;
use crate::risk::{HistoryEntry, RiskAssessment};

/// Destination of a movement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Counterparty {
    Wallet {
        wallet_id: WalletId,
    },
    BankAccount {
        account_number: String,
        bank_code: String,
    },
    Biller {
        service_id: String,
        customer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variation_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phone: Option<String>,
    },
    Card {
        card_id: String,
    },
    GiftCard {
        product_id: u64,
        recipient_email: String,
    },
}

impl Counterparty {
    /// Stable identity used for first-time-counterparty detection
    pub fn key(&self) -> String {
        match self {
            Counterparty::Wallet { wallet_id } => format!("wallet:{}", wallet_id),
            Counterparty::BankAccount {
                account_number,
                bank_code,
            } => format!("bank:{}:{}", bank_code, account_number),
            Counterparty::Biller {
                service_id,
                customer_id,
                ..
            } => format!("biller:{}:{}", service_id, customer_id),
            Counterparty::Card { card_id } => format!("card:{}", card_id),
            Counterparty::GiftCard {
                product_id,
                recipient_email,
            } => format!(
                "gift_card:{}:{}",
                product_id,
                recipient_email.to_ascii_lowercase()
            ),
        }
    }

    /// Whether this descriptor is the right shape for `class`
    pub fn matches_class(&self, class: TransactionClass) -> bool {
        matches!(
            (self, class),
            (Counterparty::Wallet { .. }, TransactionClass::Send)
                | (Counterparty::BankAccount { .. }, TransactionClass::BankTransfer)
                | (Counterparty::Biller { .. }, TransactionClass::Bill)
                | (Counterparty::Card { .. }, TransactionClass::CardFund)
                | (Counterparty::GiftCard { .. }, TransactionClass::GiftCard)
        )
    }

    /// Rejects blank identifiers
    pub fn check_identifiers(&self) -> Result<(), String> {
        let blank = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(format!("counterparty {} is empty", field))
            } else {
                Ok(())
            }
        };
        match self {
            Counterparty::Wallet { wallet_id } => {
                if *wallet_id == 0 {
                    return Err("counterparty wallet_id is empty".into());
                }
                Ok(())
            }
            Counterparty::BankAccount {
                account_number,
                bank_code,
            } => {
                blank("account_number", account_number)?;
                blank("bank_code", bank_code)
            }
            Counterparty::Biller {
                service_id,
                customer_id,
                ..
            } => {
                blank("service_id", service_id)?;
                blank("customer_id", customer_id)
            }
            Counterparty::Card { card_id } => blank("card_id", card_id),
            Counterparty::GiftCard {
                product_id,
                recipient_email,
            } => {
                if *product_id == 0 {
                    return Err("counterparty product_id is empty".into());
                }
                blank("recipient_email", recipient_email)
            }
        }
    }
}

/// Device/location novelty supplied by the session layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferContext {
    #[serde(default)]
    pub device_new: bool,
    #[serde(default)]
    pub location_new: bool,
}

/// Inbound request, owner already authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub owner_id: OwnerId,
    pub class: TransactionClass,
    pub amount: MinorUnits,
    pub currency: Currency,
    pub counterparty: Counterparty,
    pub description: String,
    pub context: TransferContext,
    /// Caller idempotency key
    pub client_reference: Option<String>,
}

/// Provider-side handle on a submitted movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReference {
    pub kind: ProviderKind,
    pub reference: String,
    pub last_status: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ProviderReference {
    pub fn new(kind: ProviderKind, reference: impl Into<String>) -> Self {
        Self {
            kind,
            reference: reference.into(),
            last_status: None,
            last_checked_at: None,
        }
    }
}

/// Transaction record
///
/// Persisted from `RiskChecked` onwards. Immutable once terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub owner_id: OwnerId,
    pub wallet_id: WalletId,
    pub class: TransactionClass,
    pub amount: MinorUnits,
    pub currency: Currency,
    pub counterparty: Counterparty,
    pub description: String,
    pub status: TransactionStatus,
    pub provider_ref: Option<ProviderReference>,
    pub risk: Option<RiskAssessment>,
    pub client_reference: Option<String>,
    /// The wallet was debited for this transaction
    pub debited: bool,
    /// The compensating credit has been applied
    pub compensated: bool,
    pub reason_code: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the row entered its current status
    pub status_changed_at: DateTime<Utc>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TransactionId,
        owner_id: OwnerId,
        wallet_id: WalletId,
        class: TransactionClass,
        amount: MinorUnits,
        currency: Currency,
        counterparty: Counterparty,
        description: String,
        client_reference: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            wallet_id,
            class,
            amount,
            currency,
            counterparty,
            description,
            status: TransactionStatus::Requested,
            provider_ref: None,
            risk: None,
            client_reference,
            debited: false,
            compensated: false,
            reason_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            status_changed_at: now,
        }
    }

    /// Failed after the debit without the money going back yet
    pub fn compensation_due(&self) -> bool {
        self.status == TransactionStatus::Failed && self.debited && !self.compensated
    }

    pub fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            amount: self.amount,
            status: self.status,
            created_at: self.created_at,
        }
    }
}

/// Failure detail written with a CAS transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub reason_code: String,
    pub message: String,
}

impl FailureInfo {
    pub fn new(reason_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Completed,
    Pending,
    Rejected,
}

/// Caller-facing outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResponse {
    pub status: ResponseStatus,
    pub transaction_id: TransactionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}

impl TransferResponse {
    pub fn from_transaction(tx: &Transaction) -> Self {
        let status = match tx.status {
            TransactionStatus::Completed => ResponseStatus::Completed,
            TransactionStatus::Failed => ResponseStatus::Rejected,
            // Everything in flight is reported as pending
            _ => ResponseStatus::Pending,
        };
        Self {
            status,
            transaction_id: tx.id,
            provider_ref: tx.provider_ref.as_ref().map(|r| r.reference.clone()),
            reason_code: tx.reason_code.clone(),
        }
    }

    pub fn rejected(transaction_id: TransactionId, reason_code: &str) -> Self {
        Self {
            status: ResponseStatus::Rejected,
            transaction_id,
            provider_ref: None,
            reason_code: Some(reason_code.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> Counterparty {
        Counterparty::BankAccount {
            account_number: "0123456789".into(),
            bank_code: "058".into(),
        }
    }

    #[test]
    fn test_counterparty_wire_format() {
        let json = serde_json::to_value(bank()).unwrap();
        assert_eq!(json["type"], "bank_account");
        assert_eq!(json["bank_code"], "058");

        let biller: Counterparty = serde_json::from_str(
            r#"{"type":"biller","service_id":"mtn","customer_id":"08030000000"}"#,
        )
        .unwrap();
        assert_eq!(biller.key(), "biller:mtn:08030000000");
    }

    #[test]
    fn test_class_shape_and_identifiers() {
        assert!(bank().matches_class(TransactionClass::BankTransfer));
        assert!(!bank().matches_class(TransactionClass::Send));

        let blank = Counterparty::Card {
            card_id: "  ".into(),
        };
        assert!(blank.check_identifiers().is_err());
        assert!(bank().check_identifiers().is_ok());
        assert!(
            Counterparty::Wallet { wallet_id: 0 }
                .check_identifiers()
                .is_err()
        );
    }

    #[test]
    fn test_response_mapping() {
        let mut tx = Transaction::new(
            TransactionId::new(),
            1,
            1,
            TransactionClass::BankTransfer,
            500,
            Currency::ngn(),
            bank(),
            String::new(),
            None,
        );
        tx.status = TransactionStatus::ProviderSubmitted;
        assert_eq!(
            TransferResponse::from_transaction(&tx).status,
            ResponseStatus::Pending
        );

        tx.status = TransactionStatus::Failed;
        tx.reason_code = Some("PROVIDER_REJECTED".into());
        let resp = TransferResponse::from_transaction(&tx);
        assert_eq!(resp.status, ResponseStatus::Rejected);
        assert_eq!(resp.reason_code.as_deref(), Some("PROVIDER_REJECTED"));
    }
}
