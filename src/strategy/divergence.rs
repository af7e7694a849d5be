//! Grid divergence detection
//!
//! After rotation-producing cycles the in-memory ladder drifts from what
//! the chain last acknowledged. This module measures that drift per side
//! as an RMS percentage and, for flagged sides, plans amount-only update
//! operations that bring the chain back in line. Prices never change
//! through this path.

use log::debug;

use crate::consts::{GRID_REGENERATION_PERCENTAGE, RMS_PERCENTAGE};
use crate::fees::PairSpec;
use crate::order::{OrderStore, Side, SidePair, Slot};
use crate::precision::sizes_equal;

/// Per-side drift between the live and persisted ladders.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DivergenceReport {
    pub rms_percent: SidePair<f64>,
    pub flagged: SidePair<bool>,
}

/// An amount-only update restoring a chain order to the intended size.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeCorrection {
    pub slot_id: String,
    pub chain_id: String,
    /// Size the chain last acknowledged
    pub old_size: f64,
    /// Size the grid intends
    pub new_size: f64,
}

/// RMS of per-slot relative size error, matched by slot id.
///
/// A persisted double order counts at its size plus the merged portion;
/// a live order missing from the persisted ladder contributes a full
/// unit of error.
pub fn measure_divergence(store: &OrderStore, persisted: &[Slot]) -> DivergenceReport {
    let mut squared = SidePair::<Vec<f64>>::default();

    for live in store.slots() {
        let Some(side) = live.side() else { continue };
        let err = match persisted.iter().find(|p| p.id == live.id) {
            Some(pers) => {
                let effective =
                    pers.size + pers.merge.map(|m| m.merged_size).unwrap_or(0.0);
                if effective > 0.0 {
                    (live.size - effective) / effective
                } else if live.size > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            None => 1.0,
        };
        squared.get_mut(side).push(err * err);
    }

    let mut report = DivergenceReport::default();
    for side in Side::BOTH {
        let errs = squared.get(side);
        if errs.is_empty() {
            continue;
        }
        let rms = (errs.iter().sum::<f64>() / errs.len() as f64).sqrt() * 100.0;
        report.rms_percent.set(side, rms);
        report
            .flagged
            .set(side, rms >= GRID_REGENERATION_PERCENTAGE || rms >= RMS_PERCENTAGE);
        debug!("{} side divergence: {:.3}% rms", side.as_str(), rms);
    }
    report
}

/// Amount-only corrections for every flagged side's on-chain slots whose
/// live size disagrees with the persisted (chain-acknowledged) size at
/// integer precision.
pub fn plan_size_corrections(
    store: &OrderStore,
    persisted: &[Slot],
    flagged: SidePair<bool>,
    pair: &PairSpec,
) -> Vec<SizeCorrection> {
    let mut corrections = Vec::new();
    for live in store.slots() {
        let Some(side) = live.side() else { continue };
        if !flagged.get(side) {
            continue;
        }
        let Some(chain_id) = live.chain_id() else { continue };
        let Some(pers) = persisted.iter().find(|p| p.id == live.id) else { continue };
        if sizes_equal(live.size, pers.size, pair.precision(side)) {
            continue;
        }
        corrections.push(SizeCorrection {
            slot_id: live.id.clone(),
            chain_id: chain_id.to_string(),
            old_size: pers.size,
            new_size: live.size,
        });
    }
    corrections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::AssetInfo;
    use crate::order::{MergeTracker, SlotRole};

    fn asset(symbol: &str, id: &str) -> AssetInfo {
        AssetInfo {
            id: id.into(),
            symbol: symbol.into(),
            precision: 5,
            market_fee_percent: 0.0,
            taker_fee_percent: None,
            max_market_fee: f64::MAX,
        }
    }

    fn pair() -> PairSpec {
        PairSpec { base: asset("GOLD", "1.3.106"), quote: asset("USD", "1.3.121") }
    }

    fn active(id: &str, price: f64, role: SlotRole, size: f64, chain: &str) -> Slot {
        let mut s = Slot::new_virtual(id, price, role, size);
        s.mark_active(chain);
        s
    }

    #[test]
    fn test_identical_ladders_have_zero_divergence() {
        let slots = vec![
            active("buy-0", 0.95, SlotRole::Buy, 10.0, "1.7.1"),
            active("sell-0", 1.05, SlotRole::Sell, 10.0, "1.7.2"),
        ];
        let store = OrderStore::new(slots.clone());
        let report = measure_divergence(&store, &slots);
        assert_eq!(report.rms_percent.buy, 0.0);
        assert_eq!(report.rms_percent.sell, 0.0);
        assert!(!report.flagged.buy && !report.flagged.sell);
    }

    #[test]
    fn test_three_percent_drift_flags_only_that_side() {
        let persisted = vec![
            active("buy-0", 0.95, SlotRole::Buy, 10.0, "1.7.1"),
            active("sell-0", 1.05, SlotRole::Sell, 10.0, "1.7.2"),
        ];
        // buy side drifted exactly 3%
        let live = vec![
            active("buy-0", 0.95, SlotRole::Buy, 10.3, "1.7.1"),
            active("sell-0", 1.05, SlotRole::Sell, 10.0, "1.7.2"),
        ];
        let store = OrderStore::new(live);
        let report = measure_divergence(&store, &persisted);
        assert!((report.rms_percent.buy - 3.0).abs() < 1e-9);
        assert!(report.flagged.buy, "3% is exactly at the trigger");
        assert!(!report.flagged.sell);
    }

    #[test]
    fn test_double_order_counts_merged_portion() {
        let mut pers = active("sell-0", 1.05, SlotRole::Sell, 10.0, "1.7.2");
        pers.merge = Some(MergeTracker::new(2.0));
        let persisted = vec![pers];

        // live matches persisted + merged exactly: no divergence
        let live = vec![active("sell-0", 1.05, SlotRole::Sell, 12.0, "1.7.2")];
        let store = OrderStore::new(live);
        let report = measure_divergence(&store, &persisted);
        assert!(report.rms_percent.sell.abs() < 1e-9);
    }

    #[test]
    fn test_unmatched_order_contributes_full_error() {
        let persisted: Vec<Slot> = Vec::new();
        let live = vec![active("sell-0", 1.05, SlotRole::Sell, 10.0, "1.7.2")];
        let store = OrderStore::new(live);
        let report = measure_divergence(&store, &persisted);
        assert!((report.rms_percent.sell - 100.0).abs() < 1e-9);
        assert!(report.flagged.sell);
    }

    #[test]
    fn test_corrections_only_for_flagged_side_and_changed_sizes() {
        let persisted = vec![
            active("buy-0", 0.95, SlotRole::Buy, 10.0, "1.7.1"),
            active("sell-0", 1.05, SlotRole::Sell, 10.0, "1.7.2"),
            active("sell-1", 1.10, SlotRole::Sell, 8.0, "1.7.3"),
        ];
        let live = vec![
            active("buy-0", 0.95, SlotRole::Buy, 12.0, "1.7.1"),
            active("sell-0", 1.05, SlotRole::Sell, 11.0, "1.7.2"),
            active("sell-1", 1.10, SlotRole::Sell, 8.0, "1.7.3"),
        ];
        let store = OrderStore::new(live);

        let flagged = SidePair::new(false, true);
        let corrections = plan_size_corrections(&store, &persisted, flagged, &pair());

        // buy side not flagged; sell-1 unchanged
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].slot_id, "sell-0");
        assert_eq!(corrections[0].chain_id, "1.7.2");
        assert_eq!(corrections[0].old_size, 10.0);
        assert_eq!(corrections[0].new_size, 11.0);
    }

    #[test]
    fn test_virtual_slots_do_not_get_corrections() {
        let persisted = vec![Slot::new_virtual("sell-0", 1.05, SlotRole::Sell, 10.0)];
        let live = vec![Slot::new_virtual("sell-0", 1.05, SlotRole::Sell, 14.0)];
        let store = OrderStore::new(live);
        let corrections =
            plan_size_corrections(&store, &persisted, SidePair::splat(true), &pair());
        assert!(corrections.is_empty());
    }
}
