//! Geometric capital allocation
//!
//! Spreads a side's budget across its slots with a weight-controlled
//! geometric profile, quantized to the chain's integer precision without
//! losing a single unit of the total.

use crate::errors::{EngineError, EngineResult};
use crate::precision::{to_float, to_int};

/// Lowest accepted weight coefficient.
pub const MIN_WEIGHT: f64 = -1.0;
/// Highest accepted weight coefficient.
pub const MAX_WEIGHT: f64 = 2.0;

/// Allocate `total` across `n` buckets with a geometric weight profile.
///
/// The profile is `base^(idx * weight)` with `base = 1 - increment`; under
/// `reverse` the index runs from the far end, which maps the sell side's
/// ascending-price ordering onto the same outer-to-inner shape as the buy
/// side. Results are quantized to `precision` and the rounding residue is
/// folded into the largest bucket so the quantized sum equals the
/// quantized total exactly.
pub fn allocate_by_weights(
    total: f64,
    n: usize,
    weight: f64,
    increment: f64,
    reverse: bool,
    precision: u32,
) -> EngineResult<Vec<f64>> {
    if !(increment > 0.0 && increment < 1.0) {
        return Err(EngineError::InvalidConfig(format!(
            "increment fraction {} outside (0, 1)",
            increment
        )));
    }
    if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
        return Err(EngineError::InvalidConfig(format!(
            "weight {} outside [{}, {}]",
            weight, MIN_WEIGHT, MAX_WEIGHT
        )));
    }
    if n == 0 {
        return Ok(Vec::new());
    }
    if total <= 0.0 {
        return Ok(vec![0.0; n]);
    }

    let base = 1.0 - increment;
    let raw: Vec<f64> = (0..n)
        .map(|i| {
            let idx = if reverse { n - 1 - i } else { i };
            base.powf(idx as f64 * weight)
        })
        .collect();
    let raw_sum: f64 = raw.iter().sum();

    let total_int = to_int(total, precision)?;
    let mut ints: Vec<i64> = raw
        .iter()
        .map(|r| to_int(total * r / raw_sum, precision))
        .collect::<EngineResult<_>>()?;

    // fold the rounding residue into the largest bucket
    let allocated: i64 = ints.iter().sum();
    let residue = total_int - allocated;
    if residue != 0 {
        let largest = ints
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| **v)
            .map(|(i, _)| i)
            .unwrap_or(0);
        ints[largest] += residue;
    }

    Ok(ints.into_iter().map(|v| to_float(v, precision)).collect())
}

/// Cap size increases by the capital actually available.
///
/// When the summed growth exceeds `available_pool`, every increase is
/// scaled by `pool / growth`; shrinkages always apply in full since they
/// release capital. Results are quantized to `precision`.
pub fn cap_growth(
    current: &[f64],
    ideal: &[f64],
    available_pool: f64,
    precision: u32,
) -> Vec<f64> {
    debug_assert_eq!(current.len(), ideal.len());

    let total_growth: f64 = current
        .iter()
        .zip(ideal)
        .map(|(c, i)| (i - c).max(0.0))
        .sum();

    let scale = if total_growth > available_pool.max(0.0) && total_growth > 0.0 {
        available_pool.max(0.0) / total_growth
    } else {
        1.0
    };

    current
        .iter()
        .zip(ideal)
        .map(|(&c, &i)| {
            let capped = if i > c { c + (i - c) * scale } else { i };
            to_int(capped, precision)
                .map(|v| to_float(v, precision))
                .unwrap_or(c)
        })
        .collect()
}
