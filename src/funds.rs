//! Fund accounting
//!
//! The accountant recomputes every fund aggregate from order state, checks
//! the accounting invariants, and owns the optimistic free-balance
//! projection. All capital-locking transitions route through
//! [`Accountant::try_deduct`]; a check-then-deduct split across two calls
//! is how phantom spending happens.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::order::{OrderStore, Side, SidePair, Slot, SlotRole, StateKind};

/// Fund aggregates for one ladder, all denominated as float asset amounts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundsBook {
    /// Optimistic projection of the chain's free balance, updated
    /// synchronously with state transitions and reconciled against
    /// authoritative balances periodically
    pub chain_free: SidePair<f64>,
    /// Sizes of on-chain slots that carry a chain order id
    pub committed_chain: SidePair<f64>,
    /// Sizes of all Active/Partial slots
    pub committed_grid: SidePair<f64>,
    /// Sizes of Virtual non-spread slots
    pub virtual_committed: SidePair<f64>,
    pub total_chain: SidePair<f64>,
    pub total_grid: SidePair<f64>,
    /// Free balance net of virtual commitments and fee reservations
    pub available: SidePair<f64>,
    /// Surplus from fills and rotations awaiting reallocation
    pub cache_funds: SidePair<f64>,
    /// Accumulated operation-fee debt in the chain's fee asset
    pub fee_debt: f64,
    /// Count of invariant violations observed, for alerting
    #[serde(default)]
    pub invariant_violations: u64,
}

/// Stateless fund accountant for one trading pair.
#[derive(Debug, Clone)]
pub struct Accountant {
    precisions: SidePair<u32>,
    /// Side of the ladder holding the chain's fee asset, if either
    fee_asset_side: Option<Side>,
    /// Fee-asset amount held back for upcoming order operations
    fee_reservation: f64,
}

impl Accountant {
    pub fn new(precisions: SidePair<u32>, fee_asset_side: Option<Side>, fee_reservation: f64) -> Self {
        Self { precisions, fee_asset_side, fee_reservation }
    }

    pub fn precision(&self, side: Side) -> u32 {
        *self.precisions.get(side)
    }

    pub fn fee_asset_side(&self) -> Option<Side> {
        self.fee_asset_side
    }

    /// Comparison tolerance for balance aggregates: a couple of chain
    /// integer units, or 0.1% of the total for large balances.
    pub fn tolerance(&self, side: Side, total: f64) -> f64 {
        let unit = 2.0 * 10f64.powi(-(self.precision(side) as i32));
        unit.max(total.abs() * 0.001)
    }

    /// Zero the recomputed aggregates. `cache_funds` and `fee_debt` are
    /// monetary counters loaded from persistence, so a grid reload must
    /// not clobber them.
    pub fn reset_funds(&self, funds: &mut FundsBook) {
        let cache = funds.cache_funds;
        let debt = funds.fee_debt;
        let violations = funds.invariant_violations;
        *funds = FundsBook::default();
        funds.cache_funds = cache;
        funds.fee_debt = debt;
        funds.invariant_violations = violations;
    }

    /// Recompute every aggregate from order state.
    ///
    /// The chain total is always rebuilt as free + committed; the
    /// gateway-reported total is never trusted directly because vesting
    /// balances and other markets inflate it.
    pub fn recalculate(&self, store: &OrderStore, funds: &mut FundsBook) {
        let mut committed_chain = SidePair::splat(0.0);
        let mut committed_grid = SidePair::splat(0.0);
        let mut virtual_committed = SidePair::splat(0.0);

        for kind in [StateKind::Active, StateKind::Partial] {
            for id in store.ids_in_state(kind) {
                let Some(slot) = store.get(id) else { continue };
                let Some(side) = slot.side() else { continue };
                *committed_grid.get_mut(side) += slot.size;
                if slot.chain_id().is_some() {
                    *committed_chain.get_mut(side) += slot.size;
                }
            }
        }

        for id in store.ids_in_state(StateKind::Virtual) {
            let Some(slot) = store.get(id) else { continue };
            if slot.role == SlotRole::Spread {
                continue;
            }
            if let Some(side) = slot.side() {
                *virtual_committed.get_mut(side) += slot.size;
            }
        }

        funds.committed_chain = committed_chain;
        funds.committed_grid = committed_grid;
        funds.virtual_committed = virtual_committed;

        for side in Side::BOTH {
            let free = *funds.chain_free.get(side);
            let total_chain = free + *funds.committed_chain.get(side);
            funds.total_chain.set(side, total_chain);
            funds
                .total_grid
                .set(side, *funds.committed_grid.get(side) + *funds.virtual_committed.get(side));

            let mut headroom = free - *funds.virtual_committed.get(side);
            if self.fee_asset_side == Some(side) {
                headroom -= funds.fee_debt + self.fee_reservation;
            }
            funds.available.set(side, headroom.max(0.0));
        }

        self.verify_invariants(funds);
    }

    /// Fold an authoritative free balance into the projection, logging
    /// when the optimistic view drifted beyond tolerance.
    pub fn reconcile_chain_free(&self, funds: &mut FundsBook, side: Side, authoritative: f64) {
        let projected = *funds.chain_free.get(side);
        let tol = self.tolerance(side, authoritative);
        if (projected - authoritative).abs() > tol {
            warn!(
                "optimistic {} free balance {} drifted from chain {} (tolerance {})",
                side.as_str(),
                projected,
                authoritative,
                tol
            );
            funds.invariant_violations += 1;
        }
        funds.chain_free.set(side, authoritative);
    }

    /// Atomic check-and-deduct on the optimistic free balance.
    ///
    /// Fails with `InsufficientFunds` without mutating anything; the
    /// caller must abort the in-flight state transition.
    pub fn try_deduct(
        &self,
        funds: &mut FundsBook,
        side: Side,
        amount: f64,
        reason: &str,
    ) -> EngineResult<()> {
        if amount <= 0.0 {
            return Ok(());
        }
        let free = funds.chain_free.get_mut(side);
        if *free < amount {
            return Err(EngineError::InsufficientFunds {
                side: side.as_str(),
                needed: amount,
                free: *free,
                reason: reason.to_string(),
            });
        }
        *free = (*free - amount).max(0.0);
        debug!("deduct {} {} for {}", amount, side.as_str(), reason);
        Ok(())
    }

    /// Release capital back to the free balance. Mirrors [`try_deduct`]
    /// without a capacity check.
    pub fn add_to_chain_free(&self, funds: &mut FundsBook, side: Side, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        *funds.chain_free.get_mut(side) += amount;
    }

    /// Apply the optimistic balance effect of a slot state transition.
    ///
    /// Entering the chain locks the slot's size (plus the operation fee
    /// when the slot's side holds the fee asset); leaving the chain
    /// releases the old size; an on-chain resize moves the delta. Fills
    /// are not transitions in this sense: their proceeds move through
    /// the post-fill flow instead.
    pub fn update_optimistic_free_balance(
        &self,
        funds: &mut FundsBook,
        old: Option<&Slot>,
        new: &Slot,
        context: &str,
        fee: f64,
    ) -> EngineResult<()> {
        let old_on_chain = old.filter(|s| s.is_on_chain());

        match (old_on_chain, new.is_on_chain()) {
            (None, true) => {
                let side = new
                    .side()
                    .ok_or_else(|| EngineError::SlotNotFound(new.id.clone()))?;
                self.try_deduct(funds, side, new.size, context)?;
                if fee > 0.0 && self.fee_asset_side == Some(side) {
                    self.try_deduct(funds, side, fee, "operation fee")?;
                }
            }
            (Some(old), false) => {
                if let Some(side) = old.side() {
                    self.add_to_chain_free(funds, side, old.size);
                }
            }
            (Some(old), true) => {
                let side = new
                    .side()
                    .or_else(|| old.side())
                    .ok_or_else(|| EngineError::SlotNotFound(new.id.clone()))?;
                let delta = new.size - old.size;
                if delta > 0.0 {
                    self.try_deduct(funds, side, delta, context)?;
                } else if delta < 0.0 {
                    self.add_to_chain_free(funds, side, -delta);
                }
            }
            (None, false) => {}
        }
        Ok(())
    }

    /// Settle accumulated fee debt against the side holding the fee
    /// asset: cache funds are consumed first, the remainder comes off the
    /// free balance atomically. Returns the amount settled; any remainder
    /// stays owed for the next stable cycle.
    pub fn settle_fee_debt(&self, funds: &mut FundsBook) -> f64 {
        let Some(side) = self.fee_asset_side else {
            // fees are paid from a balance the grid never manages
            funds.fee_debt = 0.0;
            return 0.0;
        };
        if funds.fee_debt <= 0.0 {
            return 0.0;
        }

        let mut settled = 0.0;
        let from_cache = funds.fee_debt.min(*funds.cache_funds.get(side));
        if from_cache > 0.0 {
            *funds.cache_funds.get_mut(side) -= from_cache;
            funds.fee_debt -= from_cache;
            settled += from_cache;
        }

        if funds.fee_debt > 0.0 {
            let remainder = funds.fee_debt;
            match self.try_deduct(funds, side, remainder, "fee debt settlement") {
                Ok(()) => {
                    funds.fee_debt = 0.0;
                    settled += remainder;
                }
                Err(e) => {
                    warn!("fee debt settlement deferred: {}", e);
                }
            }
        }
        settled
    }

    /// Check the accounting invariants. Violations are warnings plus a
    /// metric counter so operations can alert; the cycle proceeds.
    fn verify_invariants(&self, funds: &mut FundsBook) {
        for side in Side::BOTH {
            let total_chain = *funds.total_chain.get(side);
            let tol = self.tolerance(side, total_chain);

            let rebuilt = *funds.chain_free.get(side) + *funds.committed_chain.get(side);
            if (total_chain - rebuilt).abs() > tol {
                warn!(
                    "chain totality violated on {}: total {} != free+committed {}",
                    side.as_str(),
                    total_chain,
                    rebuilt
                );
                funds.invariant_violations += 1;
            }

            if *funds.available.get(side) > *funds.chain_free.get(side) + tol {
                warn!(
                    "available {} exceeds free balance {} on {}",
                    funds.available.get(side),
                    funds.chain_free.get(side),
                    side.as_str()
                );
                funds.invariant_violations += 1;
            }

            if *funds.committed_grid.get(side) > total_chain + tol {
                warn!(
                    "grid commitment {} exceeds chain total {} on {}",
                    funds.committed_grid.get(side),
                    total_chain,
                    side.as_str()
                );
                funds.invariant_violations += 1;
            }
        }
    }
}
