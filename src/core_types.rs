//! Core types used throughout the engine
//!
//! Identifiers and the currency code. Money itself is always `u64` minor
//! units; see [`crate::money`] for conversions at the edges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Owner ID - supplied by the identity store, trusted as-is.
pub type OwnerId = u64;

/// Wallet ID - one wallet per (owner, currency) pair.
pub type WalletId = u64;

/// Amount in minor currency units (kobo for NGN, cents for USD).
pub type MinorUnits = u64;

/// Transaction ID - ULID-based unique identifier
///
/// Sortable by creation time and generated without coordination, so the
/// orchestrator can allocate one before anything is persisted. The string
/// form doubles as the provider idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(ulid::Ulid);

impl TransactionId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// ISO-4217 currency code (always upper-case, three ASCII letters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, String> {
        let code = code.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid currency code: {:?}", code));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn ngn() -> Self {
        Self("NGN".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of minor-unit decimals for display/provider conversion
    pub fn decimals(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "XOF" | "XAF" => 0,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Currency {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

/// Movement class; each class has its own daily cap and provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionClass {
    /// Peer-to-peer send to another wallet on the platform
    Send,
    BankTransfer,
    Bill,
    CardFund,
    GiftCard,
}

impl TransactionClass {
    pub const ALL: [TransactionClass; 5] = [
        TransactionClass::Send,
        TransactionClass::BankTransfer,
        TransactionClass::Bill,
        TransactionClass::CardFund,
        TransactionClass::GiftCard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionClass::Send => "send",
            TransactionClass::BankTransfer => "bank_transfer",
            TransactionClass::Bill => "bill",
            TransactionClass::CardFund => "card_fund",
            TransactionClass::GiftCard => "gift_card",
        }
    }
}

impl fmt::Display for TransactionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown transaction class: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_roundtrip_string() {
        let id = TransactionId::new();
        let parsed: TransactionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_transaction_ids_unique() {
        assert_ne!(TransactionId::new(), TransactionId::new());
    }

    #[test]
    fn test_currency_normalizes_case() {
        let c = Currency::new("ngn").unwrap();
        assert_eq!(c.as_str(), "NGN");
        assert_eq!(c.decimals(), 2);
        assert_eq!(Currency::new("JPY").unwrap().decimals(), 0);
    }

    #[test]
    fn test_transaction_class_names() {
        for class in TransactionClass::ALL {
            assert_eq!(class.as_str().parse::<TransactionClass>(), Ok(class));
            let json = serde_json::to_string(&class).unwrap();
            assert_eq!(json, format!("\"{}\"", class.as_str()));
        }
        assert!("crypto".parse::<TransactionClass>().is_err());
    }

    #[test]
    fn test_currency_rejects_garbage() {
        assert!(Currency::new("NG").is_err());
        assert!(Currency::new("N1N").is_err());
        assert!(serde_json::from_str::<Currency>("\"usd\"").is_ok());
        assert!(serde_json::from_str::<Currency>("\"dollars\"").is_err());
    }
}
