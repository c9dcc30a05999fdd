//! Money Conversion Module
//!
//! Internally every amount is a `u64` count of minor units. Conversions to
//! and from major-unit strings/decimals happen only at the edges: inbound
//! API parsing and outbound provider payloads that expect e.g. naira rather
//! than kobo. All of them go through this module.
//!
//! ```rust
//! use wallet_ledger::money::{format_minor, parse_major};
//!
//! // Client sends "500.25" NGN
//! assert_eq!(parse_major("500.25", 2).unwrap(), 50_025);
//! assert_eq!(format_minor(50_025, 2), "500.25");
//! ```

use rust_decimal::prelude::*;
use thiserror::Error;

use crate::core_types::MinorUnits;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Parse a major-unit string ("1500.50") into minor units.
///
/// Rejects signs, exponents, separators, ambiguous dots (".5", "5.") and
/// more fractional digits than the currency allows. Zero is rejected: no
/// movement is ever made for nothing.
pub fn parse_major(amount_str: &str, decimals: u32) -> Result<MinorUnits, MoneyError> {
    let s = amount_str.trim();
    if s.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    if s.starts_with('-') || s.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }

    let (whole, frac) = match s.split_once('.') {
        None => (s, ""),
        Some((w, f)) => {
            if w.is_empty() || f.is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "both sides of the decimal point are required".into(),
                ));
            }
            if decimals == 0 {
                return Err(MoneyError::InvalidFormat(
                    "currency has no minor units, but dot provided".into(),
                ));
            }
            (w, f)
        }
    };

    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(MoneyError::InvalidFormat(format!(
            "non-digit character in {:?}",
            s
        )));
    }

    if frac.len() > decimals as usize {
        return Err(MoneyError::PrecisionOverflow {
            provided: frac.len() as u32,
            max: decimals,
        });
    }

    let whole_num: u64 = whole.parse().map_err(|_| MoneyError::Overflow)?;
    let frac_num: u64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<width$}", frac, width = decimals as usize)
            .parse()
            .map_err(|_| MoneyError::InvalidFormat("invalid fractional part".into()))?
    };

    let amount = 10u64
        .checked_pow(decimals)
        .and_then(|m| whole_num.checked_mul(m))
        .and_then(|v| v.checked_add(frac_num))
        .ok_or(MoneyError::Overflow)?;

    if amount == 0 {
        return Err(MoneyError::InvalidAmount);
    }
    Ok(amount)
}

/// Minor units → exact major-unit `Decimal` (for providers that price in
/// major units).
pub fn to_major(value: MinorUnits, decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(value as i128, decimals)
}

/// Minor units → major-unit string with full precision ("500.25").
pub fn format_minor(value: MinorUnits, decimals: u32) -> String {
    let d = to_major(value, decimals);
    format!("{:.prec$}", d, prec = decimals as usize)
}

/// Major-unit `Decimal` reported by a provider → minor units.
///
/// Fractions below one minor unit are a provider error, not something to
/// round away.
pub fn from_major(value: Decimal, decimals: u32) -> Result<MinorUnits, MoneyError> {
    if value.is_sign_negative() {
        return Err(MoneyError::InvalidAmount);
    }
    let scaled = value * Decimal::from(10u64.pow(decimals));
    if !scaled.fract().is_zero() {
        return Err(MoneyError::PrecisionOverflow {
            provided: value.scale(),
            max: decimals,
        });
    }
    scaled.to_u64().ok_or(MoneyError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_parse_major_variations() {
        assert_eq!(parse_major("1.23", 2).unwrap(), 123);
        assert_eq!(parse_major("50000", 2).unwrap(), 5_000_000);
        assert_eq!(parse_major("001.5", 2).unwrap(), 150);
        assert_eq!(parse_major("7", 0).unwrap(), 7);
        assert_eq!(parse_major("0", 2), Err(MoneyError::InvalidAmount));
        assert_eq!(parse_major("0.00", 2), Err(MoneyError::InvalidAmount));
    }

    #[test]
    fn test_parse_major_rejects_ambiguous_input() {
        for case in ["1,000.00", "1.2.3", "1. 23", "+1", "-5", "1e2", ".5", "5.", "abc", ""] {
            assert!(parse_major(case, 2).is_err(), "should reject {:?}", case);
        }
        assert!(parse_major("100.0", 0).is_err());
    }

    #[test]
    fn test_parse_major_precision_and_overflow() {
        assert!(matches!(
            parse_major("1.234", 2),
            Err(MoneyError::PrecisionOverflow { provided: 3, max: 2 })
        ));
        assert_eq!(
            parse_major("184467440737095516.15", 2).unwrap(),
            u64::MAX
        );
        assert_eq!(
            parse_major("184467440737095516.16", 2),
            Err(MoneyError::Overflow)
        );
    }

    #[test]
    fn test_format_and_major_conversions() {
        assert_eq!(format_minor(50_025, 2), "500.25");
        assert_eq!(format_minor(5, 2), "0.05");
        assert_eq!(format_minor(12, 0), "12");
        assert_eq!(to_major(150, 2), Decimal::from_str("1.50").unwrap());
        assert_eq!(from_major(Decimal::from_str("1.5").unwrap(), 2).unwrap(), 150);
        assert!(from_major(Decimal::from_str("1.555").unwrap(), 2).is_err());
        assert!(from_major(Decimal::from_str("-1").unwrap(), 2).is_err());
    }
}
