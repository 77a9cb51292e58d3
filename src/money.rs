//! Money conversion module
//!
//! Unified conversion between the internal scaled `u64` representation and
//! the client-facing `Decimal` representation. All conversions MUST go
//! through this module.
//!
//! ## Internal representation
//! - All amounts are stored as `u64`, scaled by `10^scale` for the owning
//!   asset (e.g. 10^8 for BTC = satoshi).
//! - Prices are scaled by the QUOTE asset scale, so
//!   `price * qty / 10^base_scale` lands directly in quote asset units.
//! - Asset scales never exceed [`MAX_SCALE`] fractional digits.
//! - Intermediate products use `u128`; arithmetic is exact, never floating
//!   point.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;

/// Maximum fractional digits for any asset or price scale.
pub const MAX_SCALE: u32 = 10;

/// Money conversion errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("amount too large, would overflow")]
    Overflow,
}

/// Scale factor for a given number of fractional digits.
#[inline]
pub fn unit(scale: u32) -> u64 {
    10u64.pow(scale)
}

/// Convert a client `Decimal` to a scaled `u64`. Rejects zero and negative
/// amounts and any value with more fractional digits than `scale`.
pub fn parse_decimal(d: Decimal, scale: u32) -> Result<u64, MoneyError> {
    let raw = parse_decimal_allow_zero(d, scale)?;
    if raw == 0 {
        return Err(MoneyError::InvalidAmount);
    }
    Ok(raw)
}

/// Like [`parse_decimal`] but zero is legal (fees, residuals).
pub fn parse_decimal_allow_zero(d: Decimal, scale: u32) -> Result<u64, MoneyError> {
    if d.is_sign_negative() {
        return Err(MoneyError::InvalidAmount);
    }
    let normalized = d.normalize();
    if normalized.scale() > scale {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: scale,
        });
    }
    let scaled = normalized
        .checked_mul(Decimal::from(unit(scale)))
        .ok_or(MoneyError::Overflow)?;
    scaled.to_u64().ok_or(MoneyError::Overflow)
}

/// Convert a scaled `u64` back to a `Decimal` for display / serialization.
pub fn to_decimal(value: u64, scale: u32) -> Decimal {
    Decimal::from_i128_with_scale(value as i128, scale).normalize()
}

/// Quote amount for a fill: `price * qty / 10^base_scale`, truncating.
/// Both counterparties settle the same truncated amount, so conservation
/// holds regardless of the remainder.
pub fn quote_amount(price: u64, qty: u64, base_scale: u32) -> Result<u64, MoneyError> {
    let amount = (price as u128 * qty as u128) / unit(base_scale) as u128;
    u64::try_from(amount).map_err(|_| MoneyError::Overflow)
}

/// Integer division rounding half to even (banker's rounding).
///
/// Commission amounts round half-to-even to the asset's minimum increment;
/// since internal amounts already ARE minimum increments, the rounding
/// happens at this division.
pub fn div_round_half_even(numerator: u128, denominator: u128) -> u128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder == 0 {
        return quotient;
    }
    // Compare remainder against denominator/2 without overflowing 2*remainder.
    match remainder.cmp(&(denominator - remainder)) {
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Equal => {
            if quotient % 2 == 0 {
                quotient
            } else {
                quotient + 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_decimal_basic() {
        assert_eq!(parse_decimal(dec!(1), 8).unwrap(), 100_000_000);
        assert_eq!(parse_decimal(dec!(0.999), 8).unwrap(), 99_900_000);
        assert_eq!(parse_decimal(dec!(30000), 6).unwrap(), 30_000_000_000);
    }

    #[test]
    fn test_parse_decimal_rejects_bad_input() {
        assert_eq!(parse_decimal(dec!(0), 8), Err(MoneyError::InvalidAmount));
        assert_eq!(parse_decimal(dec!(-1), 8), Err(MoneyError::InvalidAmount));
        assert!(matches!(
            parse_decimal(dec!(0.123456789), 6),
            Err(MoneyError::PrecisionOverflow { provided: 9, max: 6 })
        ));
    }

    #[test]
    fn test_parse_trailing_zeros_do_not_count() {
        // 1.50 normalizes to scale 1
        assert_eq!(parse_decimal(dec!(1.50), 1).unwrap(), 15);
    }

    #[test]
    fn test_to_decimal_round_trip() {
        assert_eq!(to_decimal(99_900_000, 8), dec!(0.999));
        assert_eq!(to_decimal(30_000_000_000, 6), dec!(30000));
    }

    #[test]
    fn test_quote_amount() {
        // 1 BTC (1e8) at 30_000 USDT (3e10 at scale 6) -> 30_000 USDT (3e10)
        assert_eq!(
            quote_amount(30_000_000_000, 100_000_000, 8).unwrap(),
            30_000_000_000
        );
        // 0.5 BTC at 100.000001 USDT -> 50.0000005 truncated to 50.000000
        assert_eq!(quote_amount(100_000_001, 50_000_000, 8).unwrap(), 50_000_000);
    }

    #[test]
    fn test_div_round_half_even() {
        assert_eq!(div_round_half_even(10, 4), 2); // 2.5 -> 2 (even)
        assert_eq!(div_round_half_even(14, 4), 4); // 3.5 -> 4 (even)
        assert_eq!(div_round_half_even(11, 4), 3); // 2.75 -> 3
        assert_eq!(div_round_half_even(9, 4), 2); // 2.25 -> 2
        assert_eq!(div_round_half_even(12, 4), 3); // exact
    }
}
