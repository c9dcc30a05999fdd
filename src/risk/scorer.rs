//! Additive risk scorer
//!
//! Every factor contributes a fixed weight. Weights and thresholds are a
//! starting configuration, not derived from labelled fraud data, so all of
//! them are loaded from config.

use chrono::{Duration, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{RiskAssessment, RiskFactor, RiskFlag, RiskInputs, RiskLevel};
use crate::core_types::MinorUnits;
use crate::limits::VerificationTier;

/// Points per factor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RiskWeights {
    pub amount_above_average: u32,
    pub large_amount: u32,
    pub high_daily_count: u32,
    pub velocity_burst: u32,
    pub unverified_identity: u32,
    pub above_tier_ceiling: u32,
    pub off_hours: u32,
    pub new_counterparty: u32,
    pub new_device: u32,
    pub new_location: u32,
    pub recent_failures: u32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            amount_above_average: 20,
            large_amount: 15,
            high_daily_count: 15,
            velocity_burst: 20,
            unverified_identity: 20,
            above_tier_ceiling: 25,
            off_hours: 10,
            new_counterparty: 15,
            new_device: 15,
            new_location: 10,
            recent_failures: 20,
        }
    }
}

impl RiskWeights {
    fn all(&self) -> [u32; 11] {
        [
            self.amount_above_average,
            self.large_amount,
            self.high_daily_count,
            self.velocity_burst,
            self.unverified_identity,
            self.above_tier_ceiling,
            self.off_hours,
            self.new_counterparty,
            self.new_device,
            self.new_location,
            self.recent_failures,
        ]
    }
}

/// Single-transaction ceiling per verification tier (minor units)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TierCeilings {
    pub unverified: MinorUnits,
    pub basic: MinorUnits,
    pub standard: MinorUnits,
    pub full: MinorUnits,
}

impl Default for TierCeilings {
    fn default() -> Self {
        Self {
            unverified: 1_000_000,
            basic: 5_000_000,
            standard: 50_000_000,
            full: 500_000_000,
        }
    }
}

impl TierCeilings {
    pub fn for_tier(&self, tier: VerificationTier) -> MinorUnits {
        match tier {
            VerificationTier::Unverified => self.unverified,
            VerificationTier::Basic => self.basic,
            VerificationTier::Standard => self.standard,
            VerificationTier::Full => self.full,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    pub medium_threshold: u32,
    pub high_threshold: u32,
    pub critical_threshold: u32,
    /// Flag when amount > multiplier × historical mean
    pub average_multiplier: u64,
    /// Below this many past transactions there is no meaningful mean
    pub min_history_for_average: usize,
    pub large_amount: MinorUnits,
    pub daily_count_threshold: usize,
    pub burst_count: usize,
    pub burst_window_secs: i64,
    /// Local hours [start, end) considered off-hours
    pub off_hours_start: u32,
    pub off_hours_end: u32,
    pub failure_threshold: u32,
    pub tier_ceilings: TierCeilings,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            medium_threshold: 40,
            high_threshold: 60,
            critical_threshold: 80,
            average_multiplier: 3,
            min_history_for_average: 3,
            large_amount: 1_000_000,
            daily_count_threshold: 10,
            burst_count: 3,
            burst_window_secs: 600,
            off_hours_start: 0,
            off_hours_end: 5,
            failure_threshold: 2,
            tier_ceilings: TierCeilings::default(),
        }
    }
}

impl RiskConfig {
    /// Thresholds must be ordered and no single factor may deny on its own.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.medium_threshold < self.high_threshold
            && self.high_threshold < self.critical_threshold)
        {
            return Err(format!(
                "risk thresholds must be increasing: medium={} high={} critical={}",
                self.medium_threshold, self.high_threshold, self.critical_threshold
            ));
        }
        if let Some(w) = self
            .weights
            .all()
            .into_iter()
            .find(|w| *w >= self.high_threshold)
        {
            return Err(format!(
                "risk weight {} alone reaches the deny threshold {}",
                w, self.high_threshold
            ));
        }
        if self.off_hours_start > 23 || self.off_hours_end > 24 {
            return Err("off-hours bounds must be valid hours".to_string());
        }
        Ok(())
    }

    pub fn level_for(&self, score: u32) -> RiskLevel {
        if score >= self.critical_threshold {
            RiskLevel::Critical
        } else if score >= self.high_threshold {
            RiskLevel::High
        } else if score >= self.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

pub struct RiskScorer {
    config: RiskConfig,
    local_offset: FixedOffset,
}

impl RiskScorer {
    pub fn new(config: RiskConfig, local_offset: FixedOffset) -> Self {
        Self {
            config,
            local_offset,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn assess(&self, inputs: &RiskInputs<'_>) -> RiskAssessment {
        let cfg = &self.config;
        let w = &cfg.weights;
        let mut flags = Vec::new();
        let mut add = |factor: RiskFactor, points: u32, reason: String| {
            if points > 0 {
                flags.push(RiskFlag {
                    factor,
                    points,
                    reason,
                });
            }
        };

        // Historical mean over movements that actually happened
        let settled: Vec<MinorUnits> = inputs
            .recent
            .iter()
            .filter(|h| h.status.counts_toward_limit())
            .map(|h| h.amount)
            .collect();
        if settled.len() >= cfg.min_history_for_average {
            let mean = settled.iter().map(|a| *a as u128).sum::<u128>() / settled.len() as u128;
            if (inputs.amount as u128) > mean * cfg.average_multiplier as u128 {
                add(
                    RiskFactor::AmountAboveAverage,
                    w.amount_above_average,
                    format!(
                        "amount {} exceeds {}x historical average {}",
                        inputs.amount, cfg.average_multiplier, mean
                    ),
                );
            }
        }

        if inputs.amount >= cfg.large_amount {
            add(
                RiskFactor::LargeAmount,
                w.large_amount,
                format!("large amount {}", inputs.amount),
            );
        }

        if inputs.today.len() >= cfg.daily_count_threshold {
            add(
                RiskFactor::HighDailyCount,
                w.high_daily_count,
                format!("{} transactions today", inputs.today.len()),
            );
        }

        let burst_start = inputs.at - Duration::seconds(cfg.burst_window_secs);
        let burst = inputs
            .recent
            .iter()
            .filter(|h| h.created_at >= burst_start && h.created_at <= inputs.at)
            .count();
        if burst >= cfg.burst_count {
            add(
                RiskFactor::VelocityBurst,
                w.velocity_burst,
                format!(
                    "{} transactions within {}s",
                    burst, cfg.burst_window_secs
                ),
            );
        }

        if inputs.tier == VerificationTier::Unverified {
            add(
                RiskFactor::UnverifiedIdentity,
                w.unverified_identity,
                "identity not verified".to_string(),
            );
        }

        let ceiling = cfg.tier_ceilings.for_tier(inputs.tier);
        if inputs.amount > ceiling {
            add(
                RiskFactor::AboveTierCeiling,
                w.above_tier_ceiling,
                format!("amount {} above {} ceiling {}", inputs.amount, inputs.tier, ceiling),
            );
        }

        let hour = inputs.at.with_timezone(&self.local_offset).hour();
        if self.is_off_hours(hour) {
            add(
                RiskFactor::OffHours,
                w.off_hours,
                format!("off-hours request at {:02}:00 local", hour),
            );
        }

        if !inputs.counterparty_known {
            add(
                RiskFactor::NewCounterparty,
                w.new_counterparty,
                "first transaction with this counterparty".to_string(),
            );
        }

        if inputs.device_new {
            add(RiskFactor::NewDevice, w.new_device, "new device".to_string());
        }

        if inputs.location_new {
            add(
                RiskFactor::NewLocation,
                w.new_location,
                "new location".to_string(),
            );
        }

        if inputs.recent_failures >= cfg.failure_threshold {
            add(
                RiskFactor::RecentFailures,
                w.recent_failures,
                format!("{} recent failed transactions", inputs.recent_failures),
            );
        }

        let score: u32 = flags.iter().map(|f| f.points).sum();
        let level = cfg.level_for(score);
        debug!(score, level = %level, flags = flags.len(), "Risk assessed");

        RiskAssessment {
            score,
            level,
            flags,
            decision: level.decision(),
            required_action: level.required_action(),
        }
    }

    fn is_off_hours(&self, hour: u32) -> bool {
        let (start, end) = (self.config.off_hours_start, self.config.off_hours_end);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}
