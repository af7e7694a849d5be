//! Boundary-crawl rebalancing
//!
//! The rebalancer keeps the on-chain window of orders aligned with the
//! market by crawling a single boundary index along the ladder: every
//! full fill shifts the spread band one slot toward the filled side,
//! pulling the opposite side inward. Given fills and budget it produces a
//! plan of places, rotations, and cancels, and applies in-memory sizing
//! that the size-correction pass later pushes on chain.

use std::collections::HashSet;

use log::{debug, info};

use crate::consts::{DOUBLE_ORDER_MERGE_FACTOR, PARTIAL_DUST_THRESHOLD_PERCENTAGE};
use crate::errors::EngineResult;
use crate::fees::{FeeCache, PairSpec};
use crate::funds::{Accountant, FundsBook};
#[cfg(test)]
use crate::order::Slot;
use crate::order::{MergeTracker, OrderStore, Side, SidePair, SlotRole, StateKind};
use crate::precision::{sizes_equal, to_float, to_int};
use crate::sync::FillRecord;

use super::allocation::{allocate_by_weights, cap_growth};

/// Strategy parameters fixed at startup.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    /// Weight coefficient per side, in [-1, 2]
    pub weights: SidePair<f64>,
    /// Geometric step between adjacent slots, as a fraction
    pub increment_fraction: f64,
    /// Target count of on-chain orders per side
    pub active_orders: SidePair<u32>,
    /// Configured budget per side
    pub allocation: SidePair<f64>,
    /// Count of spread slots between the sides
    pub gap_slots: usize,
    /// Fee-asset amount held back for order operations
    pub fee_reservation: f64,
}

/// The crawling window: a single index locating the last buy slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryState {
    pub boundary_idx: usize,
    pub gap_slots: usize,
}

impl BoundaryState {
    /// Position the spread band so it straddles the reference price
    /// symmetrically. Used on the first run after a restart; afterwards
    /// the boundary only moves by crawling.
    pub fn straddling(store: &OrderStore, reference_price: f64, gap_slots: usize) -> Self {
        let len = store.len();
        let center = store
            .slots()
            .position(|s| s.price >= reference_price)
            .unwrap_or(len);
        let boundary_idx = center
            .saturating_sub(1 + gap_slots / 2)
            .min(len.saturating_sub(1));
        Self { boundary_idx, gap_slots }
    }

    /// Crawl one step toward the filled side.
    pub fn apply_fill(&mut self, fill_side: Side, ladder_len: usize) {
        if ladder_len == 0 {
            return;
        }
        self.boundary_idx = match fill_side {
            Side::Sell => (self.boundary_idx + 1).min(ladder_len - 1),
            Side::Buy => self.boundary_idx.saturating_sub(1),
        };
    }

    /// Half-open spread band `[start, end)` clamped to the ladder.
    fn band(&self, len: usize) -> (usize, usize) {
        let start = (self.boundary_idx + 1).min(len);
        let end = (start + self.gap_slots).min(len);
        (start, end)
    }
}

/// One chain operation in a rebalance plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanAction {
    /// Put a virtual slot on chain at its allocated size
    Place { slot_id: String, size: f64 },
    /// Retire an out-of-window order and place an in-window slot instead
    Rotate {
        cancel_slot_id: String,
        cancel_chain_id: String,
        place_slot_id: String,
        size: f64,
    },
    /// Retire an order with no in-window counterpart
    Cancel { slot_id: String, chain_id: String },
}

/// Output of a rebalance cycle.
#[derive(Debug, Clone, Default)]
pub struct RebalancePlan {
    pub actions: Vec<PlanAction>,
    pub rotations: u32,
    /// On-chain slots whose in-memory size changed; the size-correction
    /// pass turns these into update operations
    pub updates: u32,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.updates == 0
    }

    pub fn places(&self) -> impl Iterator<Item = &PlanAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, PlanAction::Place { .. }))
    }

    pub fn cancels(&self) -> impl Iterator<Item = &PlanAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, PlanAction::Cancel { .. }))
    }
}

/// Boundary-crawl rebalance planner.
pub struct RebalancePlanner {
    settings: StrategySettings,
}

impl RebalancePlanner {
    pub fn new(settings: StrategySettings) -> EngineResult<Self> {
        // weight and increment ranges are enforced by the allocator;
        // probing here turns a bad config into a startup failure
        allocate_by_weights(1.0, 1, settings.weights.buy, settings.increment_fraction, false, 2)?;
        allocate_by_weights(1.0, 1, settings.weights.sell, settings.increment_fraction, true, 2)?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    /// Post-fill orchestration: credit proceeds, charge operation fees,
    /// crawl the boundary, and rebalance when warranted.
    ///
    /// With no full fills and no dust on both sides this returns an empty
    /// plan without touching a single slot.
    #[allow(clippy::too_many_arguments)]
    pub fn process_filled_orders(
        &self,
        store: &mut OrderStore,
        funds: &mut FundsBook,
        accountant: &Accountant,
        fees: &FeeCache,
        pair: &PairSpec,
        boundary: &mut BoundaryState,
        fills: &[FillRecord],
        excluded: &HashSet<String>,
    ) -> EngineResult<RebalancePlan> {
        if store.is_empty() {
            return Ok(RebalancePlan::default());
        }

        let full_fills: Vec<&FillRecord> = fills.iter().filter(|f| f.full).collect();
        let delayed_rotation = fills.iter().any(|f| f.delayed_rotation_trigger);

        let rebalance_due = !full_fills.is_empty()
            || delayed_rotation
            || (self.has_dust_partials(store, funds, accountant, Side::Buy, pair, boundary)
                && self.has_dust_partials(store, funds, accountant, Side::Sell, pair, boundary));
        if !rebalance_due {
            return Ok(RebalancePlan::default());
        }

        store.pause_funds_recalc();

        for fill in full_fills.iter().copied() {
            self.credit_full_fill(store, funds, accountant, fees, pair, fill)?;
            boundary.apply_fill(fill.side, store.len());
        }

        if accountant.fee_asset_side().is_some() && !full_fills.is_empty() {
            funds.fee_debt +=
                full_fills.len() as f64 * (fees.create_fee() + fees.update_fee());
        }

        let reaction_cap = fills.len().max(1);
        self.reassign_roles(store, boundary, excluded);

        let mut plan = RebalancePlan::default();
        for side in Side::BOTH {
            self.plan_side(
                store,
                funds,
                accountant,
                pair,
                boundary,
                side,
                reaction_cap,
                excluded,
                &mut plan,
            )?;
        }

        if accountant.fee_asset_side().is_some() {
            let ops = plan.rotations + plan.updates;
            if ops > 0 {
                funds.fee_debt += fees.update_fee() * ops as f64;
            }
        }

        if store.resume_funds_recalc() {
            accountant.recalculate(store, funds);
        }

        info!(
            "rebalance: {} actions ({} rotations, {} pending size updates), boundary at {}",
            plan.actions.len(),
            plan.rotations,
            plan.updates,
            boundary.boundary_idx
        );
        Ok(plan)
    }

    /// Plan the very first placements after startup: every virtual
    /// window slot with allocated capital goes on chain, uncapped. Used
    /// only when nothing is on chain yet; afterwards fills drive the
    /// crawl.
    pub fn bootstrap_plan(
        &self,
        store: &OrderStore,
        boundary: &BoundaryState,
        excluded: &HashSet<String>,
    ) -> RebalancePlan {
        let mut plan = RebalancePlan::default();
        for side in Side::BOTH {
            let indices = self.side_indices(store, boundary, side);
            for pos in self.window_positions(side, indices.len()) {
                let Some(slot) = indices.get(pos).and_then(|&i| store.slot_at(i)) else {
                    continue;
                };
                if slot.is_on_chain() || excluded.contains(&slot.id) || slot.size <= 0.0 {
                    continue;
                }
                plan.actions.push(PlanAction::Place {
                    slot_id: slot.id.clone(),
                    size: slot.size,
                });
            }
        }
        plan
    }

    /// Finish a rotation's cancel half: if the slot still references the
    /// cancelled chain order, demote it and release its capital.
    pub fn complete_order_rotation(
        &self,
        store: &mut OrderStore,
        funds: &mut FundsBook,
        accountant: &Accountant,
        cancelled_chain_id: &str,
    ) -> EngineResult<()> {
        let Some(old) = store.find_by_chain_id(cancelled_chain_id).cloned() else {
            debug!("rotation cancel {} already settled", cancelled_chain_id);
            return Ok(());
        };
        let mut updated = old.clone();
        updated.mark_virtual();
        accountant.update_optimistic_free_balance(
            funds,
            Some(&old),
            &updated,
            "rotation cancel",
            0.0,
        )?;
        if store.update_order(updated) {
            accountant.recalculate(store, funds);
        }
        Ok(())
    }

    /// Credit a full fill's proceeds: the receiving side gains the fee-
    /// adjusted counter-amount as reallocatable cache, and the paying
    /// side's chain total shrinks by what was sold.
    fn credit_full_fill(
        &self,
        store: &mut OrderStore,
        funds: &mut FundsBook,
        accountant: &Accountant,
        fees: &FeeCache,
        pair: &PairSpec,
        fill: &FillRecord,
    ) -> EngineResult<()> {
        // normally the sync engine already converted the slot; cover the
        // direct path too
        if let Some(slot) = store.find_by_chain_id(&fill.chain_id).cloned() {
            let mut placeholder = slot;
            placeholder.make_spread_placeholder();
            store.update_order(placeholder);
        }

        let receiving = fill.side.opposite();
        let raw = match fill.side {
            Side::Sell => fill.amount * fill.price,
            Side::Buy => fill.amount / fill.price,
        };
        let net = fees
            .net_proceeds(&pair.asset(receiving).symbol, raw)?
            .amount();

        *funds.cache_funds.get_mut(receiving) += net;
        accountant.add_to_chain_free(funds, receiving, net);
        let paying_total = funds.total_chain.get_mut(fill.side);
        *paying_total = (*paying_total - fill.amount).max(0.0);

        debug!(
            "full fill on {}: {} {} sold, {} {} credited",
            fill.slot_id,
            fill.amount,
            fill.side.as_str(),
            net,
            receiving.as_str()
        );
        Ok(())
    }

    /// Ladder indices `[0, band)` are buys, `[band)` spread, rest sells.
    /// Only virtual slots change role; an on-chain slot keeps its role
    /// until its cancel ack lands, so fund attribution never jumps.
    fn reassign_roles(
        &self,
        store: &mut OrderStore,
        boundary: &BoundaryState,
        excluded: &HashSet<String>,
    ) {
        let len = store.len();
        let (band_start, band_end) = boundary.band(len);

        let ids: Vec<String> = store.ladder_ids().to_vec();
        for (idx, id) in ids.iter().enumerate() {
            let target = if idx < band_start {
                SlotRole::Buy
            } else if idx < band_end {
                SlotRole::Spread
            } else {
                SlotRole::Sell
            };
            let Some(slot) = store.get(id) else { continue };
            if slot.role == target || slot.is_on_chain() || excluded.contains(id) {
                continue;
            }
            let mut updated = slot.clone();
            if target == SlotRole::Spread {
                updated.make_spread_placeholder();
            } else {
                updated.role = target;
            }
            store.update_order(updated);
        }
    }

    /// Ladder indices belonging to a side under the current partition,
    /// restricted to slots actually carrying that role.
    fn side_indices(&self, store: &OrderStore, boundary: &BoundaryState, side: Side) -> Vec<usize> {
        let len = store.len();
        let (band_start, band_end) = boundary.band(len);
        let range = match side {
            Side::Buy => 0..band_start,
            Side::Sell => band_end..len,
        };
        range
            .filter(|&i| {
                store
                    .slot_at(i)
                    .map(|s| s.role == SlotRole::from_side(side))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Positions (within the side's index list) of the target window:
    /// the `active_orders` slots nearest the spread band.
    fn window_positions(&self, side: Side, side_len: usize) -> std::ops::Range<usize> {
        let target = *self.settings.active_orders.get(side) as usize;
        match side {
            Side::Buy => side_len.saturating_sub(target)..side_len,
            Side::Sell => 0..target.min(side_len),
        }
    }

    /// Budget actually spendable on a side this cycle.
    fn effective_budget(&self, funds: &FundsBook, accountant: &Accountant, side: Side) -> f64 {
        let target = self.settings.allocation.get(side) + funds.cache_funds.get(side);
        let reality = *funds.total_chain.get(side);
        let mut budget = target.min(reality);
        if accountant.fee_asset_side() == Some(side) {
            budget -= self.settings.fee_reservation;
        }
        budget.max(0.0)
    }

    fn ideal_sizes(
        &self,
        funds: &FundsBook,
        accountant: &Accountant,
        pair: &PairSpec,
        side: Side,
        n: usize,
    ) -> EngineResult<Vec<f64>> {
        allocate_by_weights(
            self.effective_budget(funds, accountant, side),
            n,
            *self.settings.weights.get(side),
            self.settings.increment_fraction,
            side == Side::Sell,
            pair.precision(side),
        )
    }

    /// Whether the side holds a partial below the dust threshold of its
    /// geometric ideal.
    fn has_dust_partials(
        &self,
        store: &OrderStore,
        funds: &FundsBook,
        accountant: &Accountant,
        side: Side,
        pair: &PairSpec,
        boundary: &BoundaryState,
    ) -> bool {
        let indices = self.side_indices(store, boundary, side);
        let Ok(ideal) = self.ideal_sizes(funds, accountant, pair, side, indices.len()) else {
            return false;
        };
        indices.iter().zip(&ideal).any(|(&idx, &ideal_size)| {
            store
                .slot_at(idx)
                .map(|s| {
                    s.state.kind() == StateKind::Partial
                        && ideal_size > 0.0
                        && s.size < ideal_size * PARTIAL_DUST_THRESHOLD_PERCENTAGE / 100.0
                })
                .unwrap_or(false)
        })
    }

    /// Size, consolidate, and plan one side.
    #[allow(clippy::too_many_arguments)]
    fn plan_side(
        &self,
        store: &mut OrderStore,
        funds: &mut FundsBook,
        accountant: &Accountant,
        pair: &PairSpec,
        boundary: &BoundaryState,
        side: Side,
        reaction_cap: usize,
        excluded: &HashSet<String>,
        plan: &mut RebalancePlan,
    ) -> EngineResult<()> {
        let precision = pair.precision(side);
        let len = store.len();
        let (band_start, band_end) = boundary.band(len);
        let indices = self.side_indices(store, boundary, side);

        let budget = self.effective_budget(funds, accountant, side);
        let n = indices.len();

        if n > 0 {
            let current: Vec<f64> = indices
                .iter()
                .map(|&i| store.slot_at(i).map(|s| s.size).unwrap_or(0.0))
                .collect();
            let ideal = self.ideal_sizes(funds, accountant, pair, side, n)?;
            let available_pool = funds.available.get(side) + funds.cache_funds.get(side);
            let capped = cap_growth(&current, &ideal, available_pool, precision);

            // residual capital released by over-sized partials is carried
            // toward the innermost one
            let mut carry = 0.0;
            let mut innermost_partial: Option<usize> = None;
            for (pos, &idx) in indices.iter().enumerate() {
                let Some(slot) = store.slot_at(idx) else { continue };
                if slot.state.kind() != StateKind::Partial {
                    continue;
                }
                if slot.size > capped[pos] {
                    carry += slot.size - capped[pos];
                }
                innermost_partial = Some(match (innermost_partial, side) {
                    (None, _) => pos,
                    (Some(best), Side::Sell) => best.min(pos),
                    (Some(best), Side::Buy) => best.max(pos),
                });
            }
            carry = to_int(carry, precision).map(|v| to_float(v, precision)).unwrap_or(0.0);

            // apply the new sizes in memory
            for (pos, &idx) in indices.iter().enumerate() {
                let Some(slot) = store.slot_at(idx) else { continue };
                if excluded.contains(&slot.id) || sizes_equal(slot.size, capped[pos], precision) {
                    continue;
                }
                let mut updated = slot.clone();
                updated.size = capped[pos];
                if updated.is_on_chain() {
                    plan.updates += 1;
                }
                store.update_order(updated);
            }

            // consolidation: merge the carry into the innermost partial or
            // split it off at the adjacent spread price
            if carry > 0.0 {
                if let Some(pos) = innermost_partial {
                    let idx = indices[pos];
                    if let Some(slot) = store.slot_at(idx).cloned() {
                        let target = capped[pos];
                        let merged_total = target + carry;
                        if merged_total <= target * DOUBLE_ORDER_MERGE_FACTOR {
                            let mut updated = slot;
                            updated.size = merged_total;
                            updated.merge = Some(MergeTracker::new(carry));
                            if updated.is_on_chain() {
                                plan.updates += 1;
                            }
                            store.update_order(updated);
                        } else {
                            let adjacent = match side {
                                Side::Sell => band_end.checked_sub(1),
                                Side::Buy => (band_start < len).then_some(band_start),
                            };
                            if let Some(spread_slot) = adjacent
                                .and_then(|i| store.slot_at(i))
                                .filter(|s| {
                                    s.role == SlotRole::Spread
                                        && !s.is_on_chain()
                                        && !excluded.contains(&s.id)
                                })
                                .cloned()
                            {
                                let mut residual = spread_slot;
                                residual.role = SlotRole::from_side(side);
                                residual.size = carry;
                                let residual_id = residual.id.clone();
                                store.update_order(residual);
                                plan.actions.push(PlanAction::Place {
                                    slot_id: residual_id,
                                    size: carry,
                                });
                            }
                        }
                    }
                }
            }
        }

        // shortages: window slots not on chain, closest to market first
        let window = self.window_positions(side, n);
        let mut shortage_ids: Vec<String> = window
            .clone()
            .filter_map(|pos| indices.get(pos))
            .filter_map(|&idx| store.slot_at(idx))
            .filter(|s| !s.is_on_chain() && !excluded.contains(&s.id) && s.size > 0.0)
            .map(|s| s.id.clone())
            .collect();
        if side == Side::Buy {
            shortage_ids.reverse();
        }

        // surpluses: every on-chain order of this role outside the target
        // window. The crawl pushes the furthest in-window order out of the
        // window, so it shows up here one cycle after a fill shifts the
        // band. Furthest from market first.
        let window_indices: HashSet<usize> = window
            .clone()
            .filter_map(|pos| indices.get(pos).copied())
            .collect();
        let mut surplus_ids: Vec<String> = store
            .ladder_ids()
            .iter()
            .enumerate()
            .filter(|(i, _)| !window_indices.contains(i))
            .filter_map(|(_, id)| store.get(id))
            .filter(|s| {
                s.role == SlotRole::from_side(side)
                    && s.is_on_chain()
                    && !excluded.contains(&s.id)
            })
            .map(|s| s.id.clone())
            .collect();
        surplus_ids.sort_by_key(|id| store.index_of(id).unwrap_or(0));
        if side == Side::Sell {
            surplus_ids.reverse();
        }

        // pair surpluses with shortages into rotations, then place and
        // cancel the remainders; the reaction cap bounds new chain orders
        let rotations = surplus_ids
            .len()
            .min(shortage_ids.len())
            .min(reaction_cap);
        let mut placed = 0usize;
        for i in 0..rotations {
            let cancel_id = surplus_ids[i].clone();
            let place_id = shortage_ids[i].clone();
            let chain_id = store
                .get(&cancel_id)
                .and_then(|s| s.chain_id())
                .map(str::to_string);
            let size = store.get(&place_id).map(|s| s.size).unwrap_or(0.0);
            let Some(chain_id) = chain_id else { continue };
            if to_int(size, precision).map(|v| v > 0).unwrap_or(false) {
                plan.actions.push(PlanAction::Rotate {
                    cancel_slot_id: cancel_id,
                    cancel_chain_id: chain_id,
                    place_slot_id: place_id,
                    size,
                });
                plan.rotations += 1;
                placed += 1;
            } else {
                plan.actions.push(PlanAction::Cancel { slot_id: cancel_id, chain_id });
            }
        }

        for shortage in shortage_ids.iter().skip(rotations) {
            if placed >= reaction_cap {
                break;
            }
            let size = store.get(shortage).map(|s| s.size).unwrap_or(0.0);
            if to_int(size, precision).map(|v| v > 0).unwrap_or(false) {
                plan.actions.push(PlanAction::Place { slot_id: shortage.clone(), size });
                placed += 1;
            }
        }

        for surplus in surplus_ids.iter().skip(rotations) {
            if let Some(chain_id) = store.get(surplus).and_then(|s| s.chain_id()) {
                plan.actions.push(PlanAction::Cancel {
                    slot_id: surplus.clone(),
                    chain_id: chain_id.to_string(),
                });
            }
        }

        // whatever the allocation left unassigned goes back to cache
        let assigned: f64 = indices
            .iter()
            .filter_map(|&i| store.slot_at(i))
            .map(|s| s.size)
            .sum();
        funds.cache_funds.set(side, (budget - assigned).max(0.0));

        Ok(())
    }
}
