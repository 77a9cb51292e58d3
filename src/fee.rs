//! Commission calculation
//!
//! All fee rates use 10^6 precision: 1000 = 0.10%. Commission is charged on
//! the received asset (buyer pays in base, seller pays in quote) and rounds
//! half to even at the asset's minimum increment.

use crate::money;

/// Fee rate precision (10^6 = 1,000,000)
pub const FEE_PRECISION: u64 = 1_000_000;

/// Default maker fee rate (1000 = 0.10%)
pub const DEFAULT_MAKER_FEE: u64 = 1000;

/// Default taker fee rate (1000 = 0.10%)
pub const DEFAULT_TAKER_FEE: u64 = 1000;

/// Calculate commission from amount and rate.
///
/// Uses u128 intermediate to prevent overflow; the quotient rounds half to
/// even.
///
/// # Arguments
/// * `amount` - Amount in scaled units (e.g. satoshis for BTC)
/// * `rate` - Fee rate in 10^6 precision (1000 = 0.10%)
#[inline]
pub fn calculate_fee(amount: u64, rate: u64) -> u64 {
    money::div_round_half_even(amount as u128 * rate as u128, FEE_PRECISION as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_fee_basic() {
        // 1 BTC (100M satoshis) * 0.10% = 100,000 satoshis
        assert_eq!(calculate_fee(100_000_000, 1000), 100_000);
        // 30,000 USDT (3e10 at scale 6) * 0.10% = 30 USDT
        assert_eq!(calculate_fee(30_000_000_000, 1000), 30_000_000);
    }

    #[test]
    fn test_calculate_fee_zero() {
        assert_eq!(calculate_fee(0, 1000), 0);
        assert_eq!(calculate_fee(100_000, 0), 0);
    }

    #[test]
    fn test_calculate_fee_rounds_half_to_even() {
        // 500 * 1000 / 1e6 = 0.5 -> rounds to 0 (even)
        assert_eq!(calculate_fee(500, 1000), 0);
        // 1500 * 1000 / 1e6 = 1.5 -> rounds to 2 (even)
        assert_eq!(calculate_fee(1500, 1000), 2);
        // 2500 * 1000 / 1e6 = 2.5 -> rounds to 2 (even)
        assert_eq!(calculate_fee(2500, 1000), 2);
    }

    #[test]
    fn test_no_overflow() {
        let large_amount: u64 = 10_000_000_000_000_000_000; // 10^19
        assert_eq!(calculate_fee(large_amount, 1000), 10_000_000_000_000_000);
    }
}
