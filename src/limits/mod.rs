//! Daily Transaction Limits
//!
//! A [`TransactionLimit`] row holds one owner's verification tier and the
//! per-class daily caps. The [`LimitAggregator`] compares the day's spend
//! against those caps.

pub mod aggregator;
pub mod db;
pub mod memory;

pub use aggregator::{LimitAggregator, LimitReservation};
pub use db::PgLimitStore;
pub use memory::InMemoryLimitStore;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{MinorUnits, OwnerId, TransactionClass};
use crate::error::EngineError;

/// Identity-verification level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum VerificationTier {
    Unverified = 0,
    Basic = 1,
    Standard = 2,
    Full = 3,
}

impl VerificationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationTier::Unverified => "unverified",
            VerificationTier::Basic => "basic",
            VerificationTier::Standard => "standard",
            VerificationTier::Full => "full",
        }
    }
}

impl fmt::Display for VerificationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {} ({})", *self as u8, self.as_str())
    }
}

impl TryFrom<u8> for VerificationTier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(VerificationTier::Unverified),
            1 => Ok(VerificationTier::Basic),
            2 => Ok(VerificationTier::Standard),
            3 => Ok(VerificationTier::Full),
            other => Err(format!("unknown verification tier: {}", other)),
        }
    }
}

impl From<VerificationTier> for u8 {
    fn from(value: VerificationTier) -> Self {
        value as u8
    }
}

/// Per-owner limit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLimit {
    pub owner_id: OwnerId,
    pub tier: VerificationTier,
    /// Daily cap per class, minor units. A missing class means no allowance.
    pub caps: HashMap<TransactionClass, MinorUnits>,
}

impl TransactionLimit {
    pub fn cap_for(&self, class: TransactionClass) -> Option<MinorUnits> {
        self.caps.get(&class).copied()
    }
}

/// Storage for limit rows
#[async_trait]
pub trait LimitStore: Send + Sync {
    async fn get(&self, owner_id: OwnerId) -> Result<Option<TransactionLimit>, EngineError>;

    /// Insert or replace; returns the previous row
    async fn put(&self, limit: TransactionLimit) -> Result<Option<TransactionLimit>, EngineError>;
}

/// Start of the calendar day containing `now`, in the given local offset
pub fn day_start(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local_midnight = now
        .with_timezone(&offset)
        .date_naive()
        .and_time(NaiveTime::MIN);
    // A fixed offset has no gaps, so the local midnight always maps.
    offset
        .from_local_datetime(&local_midnight)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_start_uses_local_offset() {
        let wat = FixedOffset::east_opt(3600).unwrap();

        // 23:30 UTC on the 10th is already 00:30 on the 11th in Lagos
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 23, 30, 0).unwrap();
        assert_eq!(
            day_start(now, wat),
            Utc.with_ymd_and_hms(2026, 3, 10, 23, 0, 0).unwrap()
        );

        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            day_start(now, wat),
            Utc.with_ymd_and_hms(2026, 3, 9, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_tier_serde_as_number() {
        let json = serde_json::to_string(&VerificationTier::Standard).unwrap();
        assert_eq!(json, "2");
        let tier: VerificationTier = serde_json::from_str("0").unwrap();
        assert_eq!(tier, VerificationTier::Unverified);
        assert!(serde_json::from_str::<VerificationTier>("7").is_err());
    }

    #[test]
    fn test_limit_caps_by_class() {
        let limit = TransactionLimit {
            owner_id: 1,
            tier: VerificationTier::Basic,
            caps: HashMap::from([(TransactionClass::Bill, 20_000)]),
        };
        assert_eq!(limit.cap_for(TransactionClass::Bill), Some(20_000));
        assert_eq!(limit.cap_for(TransactionClass::GiftCard), None);

        let json = serde_json::to_value(&limit).unwrap();
        assert_eq!(json["caps"]["bill"], 20_000);
    }
}
