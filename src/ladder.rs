//! Grid initializer
//!
//! Lays out the geometric ladder of slots between the configured price
//! bounds, bands the middle with spread placeholders, and allocates the
//! initial per-side budgets. Slots are created here once and live for the
//! lifetime of the grid.

use log::info;

use crate::consts::MIN_SPREAD_FACTOR;
use crate::errors::{EngineError, EngineResult};
use crate::order::{SidePair, Slot, SlotRole};
use crate::strategy::allocate_by_weights;

/// Number of geometric steps needed to span the target spread.
///
/// The spread floor is `MIN_SPREAD_FACTOR` increments, so the band is
/// never narrower than the floor even when the configured target is.
pub fn gap_slot_count(increment_percent: f64, target_spread_percent: f64) -> usize {
    let spread = target_spread_percent.max(MIN_SPREAD_FACTOR * increment_percent);
    let steps = ((1.0 + spread / 100.0).ln() / (1.0 + increment_percent / 100.0).ln()).ceil();
    (steps as usize).max(1)
}

/// Parameters for building a ladder.
#[derive(Debug, Clone)]
pub struct LadderSpec {
    pub reference_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    /// Geometric step between adjacent slots, percent
    pub increment_percent: f64,
    pub target_spread_percent: f64,
    /// Weight coefficient per side, in [-1, 2]
    pub weights: SidePair<f64>,
    /// Initial budget per side: quote for buys, base for sells
    pub allocation: SidePair<f64>,
    /// Chain precision per side: quote for buys, base for sells
    pub precisions: SidePair<u32>,
}

impl LadderSpec {
    fn validate(&self) -> EngineResult<()> {
        if !(self.increment_percent > 0.0 && self.increment_percent < 100.0) {
            return Err(EngineError::InvalidConfig(format!(
                "increment_percent {} outside (0, 100)",
                self.increment_percent
            )));
        }
        if !(self.min_price > 0.0 && self.min_price < self.max_price) {
            return Err(EngineError::InvalidConfig(format!(
                "price bounds [{}, {}] invalid",
                self.min_price, self.max_price
            )));
        }
        if !(self.reference_price > 0.0) {
            return Err(EngineError::InvalidConfig(
                "reference price must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Build the ladder: geometric prices from the lower bound, buys below
    /// the reference, sells above, and a spread band in between. Every
    /// slot starts virtual with no chain id.
    pub fn build(&self) -> EngineResult<Vec<Slot>> {
        self.validate()?;

        let step = 1.0 + self.increment_percent / 100.0;
        let count = ((self.max_price / self.min_price).ln() / step.ln()).ceil() as usize;
        if count == 0 {
            return Err(EngineError::InvalidConfig(
                "price bounds span less than one increment".into(),
            ));
        }

        let prices: Vec<f64> = (0..count)
            .map(|i| self.min_price * step.powi(i as i32))
            .collect();

        let gap = gap_slot_count(self.increment_percent, self.target_spread_percent);
        let center = prices
            .iter()
            .position(|p| *p >= self.reference_price)
            .unwrap_or(count);
        let band_start = center.saturating_sub(gap / 2).min(count.saturating_sub(gap));
        let band_end = (band_start + gap).min(count);

        let buy_count = band_start;
        let sell_count = count - band_end;

        let buy_sizes = allocate_by_weights(
            self.allocation.buy,
            buy_count,
            self.weights.buy,
            self.increment_percent / 100.0,
            false,
            self.precisions.buy,
        )?;
        let sell_sizes = allocate_by_weights(
            self.allocation.sell,
            sell_count,
            self.weights.sell,
            self.increment_percent / 100.0,
            true,
            self.precisions.sell,
        )?;

        let mut slots = Vec::with_capacity(count);
        for (i, price) in prices.iter().enumerate() {
            let slot = if i < band_start {
                // buys numbered from the innermost outward
                let ordinal = band_start - 1 - i;
                Slot::new_virtual(format!("buy-{}", ordinal), *price, SlotRole::Buy, buy_sizes[i])
            } else if i < band_end {
                Slot::new_virtual(
                    format!("spread-{}", i - band_start),
                    *price,
                    SlotRole::Spread,
                    0.0,
                )
            } else {
                let ordinal = i - band_end;
                Slot::new_virtual(
                    format!("sell-{}", ordinal),
                    *price,
                    SlotRole::Sell,
                    sell_sizes[ordinal],
                )
            };
            slots.push(slot);
        }

        info!(
            "ladder built: {} slots [{:.6} .. {:.6}], {} buys / {} spread / {} sells",
            count,
            prices.first().copied().unwrap_or_default(),
            prices.last().copied().unwrap_or_default(),
            buy_count,
            gap.min(count - band_start),
            sell_count
        );
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LadderSpec {
        LadderSpec {
            reference_price: 1.0,
            min_price: 0.5,
            max_price: 2.0,
            increment_percent: 5.0,
            target_spread_percent: 10.0,
            weights: SidePair::splat(0.0),
            allocation: SidePair::new(1000.0, 1000.0),
            precisions: SidePair::splat(5),
        }
    }

    #[test]
    fn test_slot_count_matches_geometric_span() {
        let slots = spec().build().unwrap();
        let expected = ((2.0f64 / 0.5).ln() / 1.05f64.ln()).ceil() as usize;
        assert_eq!(slots.len(), expected);
    }

    #[test]
    fn test_prices_are_geometric_from_min() {
        let slots = spec().build().unwrap();
        for (i, slot) in slots.iter().enumerate() {
            let expected = 0.5 * 1.05f64.powi(i as i32);
            assert!(
                (slot.price - expected).abs() < 1e-9,
                "slot {} price {} != {}",
                i,
                slot.price,
                expected
            );
        }
    }

    #[test]
    fn test_band_straddles_reference() {
        let slots = spec().build().unwrap();
        let spread: Vec<_> = slots.iter().filter(|s| s.role == SlotRole::Spread).collect();
        assert_eq!(spread.len(), gap_slot_count(5.0, 10.0));
        assert!(spread.iter().any(|s| s.price <= 1.0) || spread[0].price >= 1.0);

        // contiguity: buys, then spread, then sells
        let roles: Vec<_> = slots.iter().map(|s| s.role).collect();
        let first_spread = roles.iter().position(|r| *r == SlotRole::Spread).unwrap();
        let last_spread = roles.iter().rposition(|r| *r == SlotRole::Spread).unwrap();
        assert!(roles[..first_spread].iter().all(|r| *r == SlotRole::Buy));
        assert!(roles[last_spread + 1..].iter().all(|r| *r == SlotRole::Sell));
    }

    #[test]
    fn test_all_slots_start_virtual() {
        let slots = spec().build().unwrap();
        for slot in &slots {
            assert_eq!(slot.state, crate::order::SlotState::Virtual);
            assert!(slot.chain_id().is_none());
        }
    }

    #[test]
    fn test_ids_count_from_the_band_outward() {
        let slots = spec().build().unwrap();
        let first_spread = slots.iter().position(|s| s.role == SlotRole::Spread).unwrap();
        assert_eq!(slots[first_spread - 1].id, "buy-0");
        assert_eq!(slots[0].id, format!("buy-{}", first_spread - 1));

        let last_spread = slots.iter().rposition(|s| s.role == SlotRole::Spread).unwrap();
        assert_eq!(slots[last_spread + 1].id, "sell-0");
    }

    #[test]
    fn test_side_budgets_are_allocated_exactly() {
        let slots = spec().build().unwrap();
        let buy_total: f64 = slots
            .iter()
            .filter(|s| s.role == SlotRole::Buy)
            .map(|s| s.size)
            .sum();
        let sell_total: f64 = slots
            .iter()
            .filter(|s| s.role == SlotRole::Sell)
            .map(|s| s.size)
            .sum();
        assert!((buy_total - 1000.0).abs() < 1e-6);
        assert!((sell_total - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_increment_bounds_are_rejected() {
        let mut bad = spec();
        bad.increment_percent = 0.0;
        assert!(bad.build().is_err());

        let mut bad = spec();
        bad.increment_percent = 100.0;
        assert!(bad.build().is_err());

        let mut bad = spec();
        bad.increment_percent = 150.0;
        assert!(bad.build().is_err());
    }

    #[test]
    fn test_gap_slot_count_floor() {
        // target spread below the floor: the floor wins
        let with_floor = gap_slot_count(5.0, 1.0);
        let floored_spread = MIN_SPREAD_FACTOR * 5.0;
        let expected = ((1.0 + floored_spread / 100.0).ln() / 1.05f64.ln()).ceil() as usize;
        assert_eq!(with_floor, expected);

        // generous target spread wins over the floor
        assert!(gap_slot_count(2.0, 20.0) > gap_slot_count(2.0, 1.0));
    }
}
