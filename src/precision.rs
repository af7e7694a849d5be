//! Integer-precision arithmetic
//!
//! Every equality and ordering decision on amounts goes through the chain's
//! integer representation. Comparing floats directly produces phantom dust
//! that triggers spurious state transitions.

use std::cmp::Ordering;

use log::warn;

use crate::consts::PRICE_TOLERANCE_FALLBACK_PERCENT;
use crate::errors::{EngineError, EngineResult};
use crate::order::SlotRole;

/// Convert an asset amount to the chain's integer representation.
///
/// Fails with `Overflow` when the scaled value does not fit a signed
/// 64-bit integer.
pub fn to_int(value: f64, precision: u32) -> EngineResult<i64> {
    let scaled = value * 10f64.powi(precision as i32);
    if !scaled.is_finite() || scaled >= i64::MAX as f64 || scaled <= i64::MIN as f64 {
        return Err(EngineError::Overflow { value, precision });
    }
    Ok(scaled.round() as i64)
}

/// Like [`to_int`] but clamps to the 64-bit range instead of failing.
///
/// Used by comparison paths that must not abort; the clamp is logged once
/// per offending value.
pub fn to_int_saturating(value: f64, precision: u32) -> i64 {
    match to_int(value, precision) {
        Ok(v) => v,
        Err(_) => {
            warn!(
                "amount {} at precision {} clamped to 64-bit range",
                value, precision
            );
            if value.is_sign_negative() {
                i64::MIN
            } else {
                i64::MAX
            }
        }
    }
}

/// Convert a chain integer back to an asset amount.
pub fn to_float(value: i64, precision: u32) -> f64 {
    value as f64 / 10f64.powi(precision as i32)
}

/// Compare two amounts at the chain's integer precision.
pub fn compare_sizes(a: f64, b: f64, precision: u32) -> Ordering {
    to_int_saturating(a, precision).cmp(&to_int_saturating(b, precision))
}

/// True when two amounts quantize to the same chain integer.
pub fn sizes_equal(a: f64, b: f64, precision: u32) -> bool {
    compare_sizes(a, b, precision) == Ordering::Equal
}

/// Price tolerance for matching a grid slot against a chain order.
///
/// One integer unit on either leg of the order moves its implied price by
/// `price / (size_leg x 10^precision)`; the tolerance is the sum over both
/// legs. Sell sizes are denominated in base, buy sizes in quote, so the
/// legs are derived from the role. Falls back to 0.1% of the price when
/// the size is missing or degenerate.
pub fn calc_price_tolerance(
    price: f64,
    size: f64,
    role: SlotRole,
    base_precision: u32,
    quote_precision: u32,
) -> f64 {
    let fallback = price * PRICE_TOLERANCE_FALLBACK_PERCENT / 100.0;
    if !(price > 0.0) || !(size > 0.0) {
        return fallback;
    }

    let (base_size, quote_size) = match role {
        SlotRole::Sell => (size, size * price),
        SlotRole::Buy => (size / price, size),
        SlotRole::Spread => return fallback,
    };
    if !(base_size > 0.0) || !(quote_size > 0.0) {
        return fallback;
    }

    let base_unit = 1.0 / (base_size * 10f64.powi(base_precision as i32));
    let quote_unit = 1.0 / (quote_size * 10f64.powi(quote_precision as i32));
    price * (base_unit + quote_unit)
}

/// Check that both legs of an order are positive and representable as
/// chain integers.
pub fn validate_order_amounts(
    sell_amount: f64,
    min_receive: f64,
    sell_precision: u32,
    receive_precision: u32,
) -> bool {
    matches!(to_int(sell_amount, sell_precision), Ok(v) if v > 0)
        && matches!(to_int(min_receive, receive_precision), Ok(v) if v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_int_round_trip() {
        // to_float(to_int(x, p), p) equals x rounded at precision p
        let cases = [8.62251, 0.00001, 123.456789, 19.999999, 0.1 + 0.2];
        for x in cases {
            let i = to_int(x, 5).unwrap();
            let back = to_float(i, 5);
            let redone = to_int(back, 5).unwrap();
            assert_eq!(i, redone, "round trip drifted for {}", x);
        }
    }

    #[test]
    fn test_to_int_quantizes_like_the_chain() {
        assert_eq!(to_int(8.62251, 5).unwrap(), 862251);
        assert_eq!(to_int(1.0, 8).unwrap(), 100_000_000);
        assert_eq!(to_int(0.0, 5).unwrap(), 0);
    }

    #[test]
    fn test_to_int_overflow() {
        assert!(matches!(
            to_int(1e15, 8),
            Err(EngineError::Overflow { .. })
        ));
        assert!(matches!(
            to_int(f64::NAN, 2),
            Err(EngineError::Overflow { .. })
        ));
    }

    #[test]
    fn test_saturating_clamps() {
        assert_eq!(to_int_saturating(1e18, 8), i64::MAX);
        assert_eq!(to_int_saturating(-1e18, 8), i64::MIN);
        assert_eq!(to_int_saturating(2.5, 2), 250);
    }

    #[test]
    fn test_compare_sizes_ignores_float_noise() {
        // 0.1 + 0.2 != 0.3 in floats, but equal at any chain precision
        assert_eq!(compare_sizes(0.1 + 0.2, 0.3, 8), Ordering::Equal);
        assert_eq!(compare_sizes(1.00000001, 1.0, 5), Ordering::Equal);
        assert_eq!(compare_sizes(1.00001, 1.0, 5), Ordering::Greater);
        assert_eq!(compare_sizes(0.99999, 1.0, 5), Ordering::Less);
    }

    #[test]
    fn test_price_tolerance_sell() {
        // Sell 2.0 base at 1.25: one base unit at precision 5 moves the
        // price by 1.25 / (2.0 * 1e5), one quote unit by 1.25 / (2.5 * 1e5)
        let tol = calc_price_tolerance(1.25, 2.0, SlotRole::Sell, 5, 5);
        let expected = 1.25 * (1.0 / 200_000.0 + 1.0 / 250_000.0);
        assert!((tol - expected).abs() < 1e-12);
    }

    #[test]
    fn test_price_tolerance_fallback() {
        let tol = calc_price_tolerance(1.25, 0.0, SlotRole::Sell, 5, 5);
        assert!((tol - 1.25 * 0.001).abs() < 1e-12);

        let tol = calc_price_tolerance(1.25, 1.0, SlotRole::Spread, 5, 5);
        assert!((tol - 1.25 * 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_validate_order_amounts() {
        assert!(validate_order_amounts(1.0, 0.5, 5, 5));
        assert!(!validate_order_amounts(0.0, 0.5, 5, 5));
        assert!(!validate_order_amounts(1.0, -0.5, 5, 5));
        assert!(!validate_order_amounts(1e15, 0.5, 8, 5));
    }
}
