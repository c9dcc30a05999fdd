//! Risk Scoring
//!
//! A pure function of the facts the orchestrator gathers for one request:
//! no clock reads, no randomness, no I/O. Identical inputs always yield an
//! identical [`RiskAssessment`].

pub mod scorer;

pub use scorer::{RiskConfig, RiskScorer, RiskWeights};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::MinorUnits;
use crate::limits::VerificationTier;
use crate::transfer::state::TransactionStatus;

/// Risk bucket derived from the additive score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn decision(&self) -> Decision {
        match self {
            RiskLevel::Low | RiskLevel::Medium => Decision::Allow,
            RiskLevel::High | RiskLevel::Critical => Decision::Deny,
        }
    }

    /// What the caller has to do next, if anything
    pub fn required_action(&self) -> Option<RequiredAction> {
        match self {
            RiskLevel::Low => None,
            RiskLevel::Medium => Some(RequiredAction::Monitor),
            RiskLevel::High => Some(RequiredAction::StepUpAuthentication),
            RiskLevel::Critical => Some(RequiredAction::ManualReview),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAction {
    Monitor,
    StepUpAuthentication,
    ManualReview,
}

/// Individual scoring factors, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    AmountAboveAverage,
    LargeAmount,
    HighDailyCount,
    VelocityBurst,
    UnverifiedIdentity,
    AboveTierCeiling,
    OffHours,
    NewCounterparty,
    NewDevice,
    NewLocation,
    RecentFailures,
}

/// One contributing reason, in the order it was evaluated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub factor: RiskFactor,
    pub points: u32,
    pub reason: String,
}

/// Snapshot persisted in the audit trail and on the transaction row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    pub flags: Vec<RiskFlag>,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_action: Option<RequiredAction>,
}

impl RiskAssessment {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// One past transaction, as far as risk is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub amount: MinorUnits,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// Everything the scorer looks at
#[derive(Debug, Clone)]
pub struct RiskInputs<'a> {
    pub amount: MinorUnits,
    pub tier: VerificationTier,
    /// Most recent transactions, newest first
    pub recent: &'a [HistoryEntry],
    /// Transactions created since the start of the owner's local day
    pub today: &'a [HistoryEntry],
    pub counterparty_known: bool,
    pub device_new: bool,
    pub location_new: bool,
    pub recent_failures: u32,
    /// Evaluation instant, supplied by the caller
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_decisions() {
        assert_eq!(RiskLevel::Low.decision(), Decision::Allow);
        assert_eq!(RiskLevel::Medium.decision(), Decision::Allow);
        assert_eq!(RiskLevel::High.decision(), Decision::Deny);
        assert_eq!(RiskLevel::Critical.decision(), Decision::Deny);
        assert_eq!(
            RiskLevel::High.required_action(),
            Some(RequiredAction::StepUpAuthentication)
        );
        assert_eq!(
            RiskLevel::Critical.required_action(),
            Some(RequiredAction::ManualReview)
        );
    }

    #[test]
    fn test_assessment_serializes_for_audit() {
        let a = RiskAssessment {
            score: 45,
            level: RiskLevel::Medium,
            flags: vec![RiskFlag {
                factor: RiskFactor::NewDevice,
                points: 15,
                reason: "new device".into(),
            }],
            decision: Decision::Allow,
            required_action: Some(RequiredAction::Monitor),
        };
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["level"], "medium");
        assert_eq!(json["flags"][0]["factor"], "new_device");
        assert_eq!(json["required_action"], "monitor");
    }
}
