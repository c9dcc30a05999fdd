//! Transaction Lifecycle States
//!
//! State IDs are stored in PostgreSQL as SMALLINT.
//!
//! ```text
//! REQUESTED → LIMIT_CHECKED → RISK_CHECKED → DEBITED → PROVIDER_SUBMITTED ─┬→ COMPLETED
//!      ↓            ↓              ↓            ↓                          ├→ FAILED
//!    FAILED       FAILED         FAILED       FAILED                       └→ PENDING ─┬→ COMPLETED
//!                                                                                      └→ FAILED
//! ```
//!
//! `PENDING → *` is only taken by the reconciliation worker or an operator.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransactionStatus {
    /// Request accepted for evaluation
    Requested = 0,

    /// Daily limit check passed
    LimitChecked = 10,

    /// Risk check passed; the row is persisted from here on
    RiskChecked = 20,

    /// Wallet debited - funds are IN-FLIGHT
    /// CRITICAL: Must eventually reach COMPLETED, or FAILED with a compensating credit
    Debited = 30,

    /// Provider `initiate` issued (persist-before-call)
    ProviderSubmitted = 40,

    /// Provider accepted but has not confirmed settlement
    Pending = 50,

    /// Terminal: provider confirmed the movement
    Completed = 60,

    /// Terminal: aborted or failed (compensated if a debit happened)
    Failed = -10,
}

impl TransactionStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }

    /// Money has left the wallet but the outcome is not final
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Debited
                | TransactionStatus::ProviderSubmitted
                | TransactionStatus::Pending
        )
    }

    /// Completed-or-processing: these count toward daily limits
    #[inline]
    pub fn counts_toward_limit(&self) -> bool {
        self.is_in_flight() || *self == TransactionStatus::Completed
    }

    /// Whether `self → next` is a legal edge of the lifecycle graph
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Requested, LimitChecked)
                | (LimitChecked, RiskChecked)
                | (RiskChecked, Debited)
                | (Debited, ProviderSubmitted)
                | (ProviderSubmitted, Completed)
                | (ProviderSubmitted, Pending)
                | (Pending, Completed)
                | (Requested | LimitChecked | RiskChecked | Debited, Failed)
                | (ProviderSubmitted | Pending, Failed)
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransactionStatus::Requested),
            10 => Some(TransactionStatus::LimitChecked),
            20 => Some(TransactionStatus::RiskChecked),
            30 => Some(TransactionStatus::Debited),
            40 => Some(TransactionStatus::ProviderSubmitted),
            50 => Some(TransactionStatus::Pending),
            60 => Some(TransactionStatus::Completed),
            -10 => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Requested => "REQUESTED",
            TransactionStatus::LimitChecked => "LIMIT_CHECKED",
            TransactionStatus::RiskChecked => "RISK_CHECKED",
            TransactionStatus::Debited => "DEBITED",
            TransactionStatus::ProviderSubmitted => "PROVIDER_SUBMITTED",
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransactionStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransactionStatus::from_id(value).ok_or(())
    }
}
