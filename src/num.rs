//! Numeric Primitives
//!
//! Fixed-precision decimal helpers shared by every monetary, quantity, price
//! and ratio computation in the engine. All accounting arithmetic goes through
//! `rust_decimal::Decimal`; floating point is reserved for statistics where
//! sub-satoshi precision is irrelevant (Sharpe ratios, Monte Carlo paths).

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Decimal scale used for quantities, prices and cash. Division truncates to
/// this scale instead of rounding so accounting errors never accumulate in
/// the trader's favour.
pub const SCALE: u32 = 8;

/// Basis-point denominator.
pub const BPS_DENOM: Decimal = dec!(10000);

/// Divide `numerator / denominator`, truncating toward zero at [`SCALE`].
///
/// Returns `None` when the denominator is zero; callers decide whether that
/// is an invariant breach or an expected empty-input case.
#[inline]
pub fn div_scaled(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    if denominator.is_zero() {
        return None;
    }
    Some((numerator / denominator).round_dp_with_strategy(SCALE, RoundingStrategy::ToZero))
}

/// Apply a basis-point factor: `value * bps / 10_000`, truncated at [`SCALE`].
#[inline]
pub fn apply_bps(value: Decimal, bps: Decimal) -> Decimal {
    (value * bps / BPS_DENOM).round_dp_with_strategy(SCALE, RoundingStrategy::ToZero)
}

/// Fractional difference `(a - b) / b` in basis points.
/// Returns `None` when `b` is zero.
#[inline]
pub fn diff_bps(a: Decimal, b: Decimal) -> Option<Decimal> {
    div_scaled((a - b) * BPS_DENOM, b)
}

/// Lossy bridge into f64 for the statistics layer.
#[inline]
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Bridge from f64 back into Decimal, truncated at [`SCALE`].
/// Returns `None` for NaN or infinite inputs so numeric edge cases surface
/// instead of silently becoming zero.
#[inline]
pub fn from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value).map(|d| d.round_dp_with_strategy(SCALE, RoundingStrategy::ToZero))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_div_scaled_truncates() {
        // 1 / 3 truncated at 8 decimal places, never rounded up
        let result = div_scaled(dec!(1), dec!(3)).unwrap();
        assert_eq!(result, dec!(0.33333333));

        let result = div_scaled(dec!(2), dec!(3)).unwrap();
        assert_eq!(result, dec!(0.66666666));
    }

    #[test]
    fn test_div_scaled_zero_denominator() {
        assert!(div_scaled(dec!(1), Decimal::ZERO).is_none());
    }

    #[test]
    fn test_apply_bps() {
        // 10 bps on a 10_000 notional = 10
        assert_eq!(apply_bps(dec!(10000), dec!(10)), dec!(10));
        // 0.5 bps on 1_000 = 0.05
        assert_eq!(apply_bps(dec!(1000), dec!(0.5)), dec!(0.05));
    }

    #[test]
    fn test_diff_bps() {
        let bps = diff_bps(dec!(101), dec!(100)).unwrap();
        assert_eq!(bps, dec!(100));
        assert!(diff_bps(dec!(1), Decimal::ZERO).is_none());
    }

    #[test]
    fn test_f64_bridges() {
        assert_eq!(to_f64(dec!(1.5)), 1.5);
        assert_eq!(from_f64(1.5), Some(dec!(1.5)));
        assert!(from_f64(f64::NAN).is_none());
        assert!(from_f64(f64::INFINITY).is_none());
    }
}
