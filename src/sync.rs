//! Chain sync engine
//!
//! Reconciles the grid against on-chain state: a two-pass matcher for full
//! snapshots (known orders first, then orphan adoption) and an incremental
//! path for streamed fills. Full reconciliations are serialized by a
//! single-writer lock; every slot that may transition is held in the
//! store's cooperative lock table for the duration.

use std::cmp::Ordering;
use std::collections::HashSet;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::errors::{EngineError, EngineResult};
use crate::fees::PairSpec;
use crate::funds::{Accountant, FundsBook};
use crate::gateway::{ChainOrder, FillEvent};
use crate::order::{OrderStore, Side, Slot, SlotRole, StateKind};
use crate::precision::{calc_price_tolerance, compare_sizes, sizes_equal, to_float};

/// Where a snapshot came from; both routes reconcile identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    SnapshotRefresh,
    PeriodicFetch,
}

/// State changes fed to the dispatcher.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    CreateOrderAck {
        slot_id: String,
        chain_id: String,
        is_partial_placement: bool,
        fee: f64,
    },
    CancelOrderAck {
        chain_id: String,
    },
    Snapshot {
        orders: Vec<ChainOrder>,
        source: SyncSource,
    },
}

/// A fill attributed to a slot, in the slot's own denomination.
#[derive(Debug, Clone, PartialEq)]
pub struct FillRecord {
    pub slot_id: String,
    pub chain_id: String,
    pub side: Side,
    /// Filled amount in the slot's denomination
    pub amount: f64,
    /// The slot's ladder price
    pub price: f64,
    pub full: bool,
    /// Set when a consolidated double order finished consuming its merged
    /// portion and the slot should rotate on the next cycle
    pub delayed_rotation_trigger: bool,
}

/// Outcome of a reconciliation.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub filled: Vec<FillRecord>,
    pub updated: Vec<String>,
    pub needs_price_correction: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.filled.is_empty() && self.updated.is_empty() && self.needs_price_correction.is_empty()
    }
}

/// A chain order decoded into grid terms.
#[derive(Debug, Clone, PartialEq)]
struct ParsedOrder {
    chain_id: String,
    role: SlotRole,
    /// Remaining size in the role's denomination
    size: f64,
    price: f64,
}

/// Reconciles grid state against the chain.
pub struct SyncEngine {
    pair: PairSpec,
    sync_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(pair: PairSpec) -> Self {
        Self { pair, sync_lock: Mutex::new(()) }
    }

    /// Decode a chain order into (role, size, price) from which of the
    /// pair's assets it sells.
    fn parse_chain_order(&self, order: &ChainOrder) -> EngineResult<ParsedOrder> {
        let sp = &order.sell_price;
        let base = &self.pair.base;
        let quote = &self.pair.quote;

        if sp.base.asset_id == base.id && sp.quote.asset_id == quote.id {
            // selling base for quote
            let sold = to_float(sp.base.amount, base.precision);
            let wanted = to_float(sp.quote.amount, quote.precision);
            if sold <= 0.0 {
                return Err(EngineError::OrderParse {
                    order_id: order.order_id.clone(),
                    reason: "zero base amount in price".into(),
                });
            }
            Ok(ParsedOrder {
                chain_id: order.order_id.clone(),
                role: SlotRole::Sell,
                size: to_float(order.for_sale, base.precision),
                price: wanted / sold,
            })
        } else if sp.base.asset_id == quote.id && sp.quote.asset_id == base.id {
            // selling quote for base
            let sold = to_float(sp.base.amount, quote.precision);
            let wanted = to_float(sp.quote.amount, base.precision);
            if wanted <= 0.0 {
                return Err(EngineError::OrderParse {
                    order_id: order.order_id.clone(),
                    reason: "zero base amount in price".into(),
                });
            }
            Ok(ParsedOrder {
                chain_id: order.order_id.clone(),
                role: SlotRole::Buy,
                size: to_float(order.for_sale, quote.precision),
                price: sold / wanted,
            })
        } else {
            Err(EngineError::OrderParse {
                order_id: order.order_id.clone(),
                reason: "order does not belong to this market".into(),
            })
        }
    }

    fn side_precision(&self, side: Side) -> u32 {
        self.pair.precision(side)
    }

    fn price_tolerance(&self, slot: &Slot) -> f64 {
        calc_price_tolerance(
            slot.price,
            slot.size,
            slot.role,
            self.pair.base.precision,
            self.pair.quote.precision,
        )
    }

    /// Reconcile the grid against a full snapshot of open orders.
    ///
    /// Pass 1 walks slots whose chain id appears in the snapshot and
    /// folds in size changes and price drift. Pass 2 adopts orphan chain
    /// orders into role- and price-compatible slots. Orders the snapshot
    /// no longer contains are treated as filled: the snapshot is
    /// authoritative.
    pub async fn sync_from_open_orders(
        &self,
        store: &mut OrderStore,
        funds: &mut FundsBook,
        accountant: &Accountant,
        chain_orders: &[ChainOrder],
    ) -> SyncReport {
        let _guard = self.sync_lock.lock().await;
        let mut report = SyncReport::default();

        // hold every slot that may transition
        let lock_ids: Vec<String> = store
            .slots()
            .filter(|s| s.is_on_chain())
            .map(|s| s.id.clone())
            .collect();
        store.lock(lock_ids.iter());

        let mut parsed: Vec<ParsedOrder> = Vec::with_capacity(chain_orders.len());
        for order in chain_orders {
            match self.parse_chain_order(order) {
                Ok(p) => parsed.push(p),
                Err(e) => {
                    // a single bad order never aborts the batch
                    warn!("skipping chain order: {}", e);
                }
            }
        }

        let mut matched: HashSet<String> = HashSet::new();
        let mut adopted: Vec<String> = Vec::new();
        let mut dirty = false;

        store.pause_funds_recalc();

        // Pass 1: slots we believe are on chain
        let on_chain_ids: Vec<String> = store
            .slots()
            .filter(|s| s.chain_id().is_some())
            .map(|s| s.id.clone())
            .collect();
        for slot_id in on_chain_ids {
            let Some(slot) = store.get_cloned(&slot_id) else { continue };
            let Some(chain_id) = slot.chain_id().map(str::to_string) else { continue };
            let Some(chain) = parsed.iter().find(|p| p.chain_id == chain_id) else { continue };
            matched.insert(chain_id.clone());

            if (chain.price - slot.price).abs() > self.price_tolerance(&slot) {
                debug!(
                    "slot {} price drifted: chain {} vs grid {}",
                    slot.id, chain.price, slot.price
                );
                report.needs_price_correction.push(slot.id.clone());
            }

            let Some(side) = slot.side() else { continue };
            let precision = self.side_precision(side);
            if sizes_equal(slot.size, chain.size, precision) {
                continue;
            }

            let mut updated = slot.clone();
            if compare_sizes(chain.size, 0.0, precision) == Ordering::Greater {
                updated.size = chain.size;
                if updated.state.kind() == StateKind::Active {
                    updated.mark_partial(chain_id.clone());
                }
                report.updated.push(updated.id.clone());
                store.update_order(updated);
            } else {
                report.filled.push(FillRecord {
                    slot_id: updated.id.clone(),
                    chain_id: chain_id.clone(),
                    side,
                    amount: updated.size,
                    price: updated.price,
                    full: true,
                    delayed_rotation_trigger: false,
                });
                updated.make_spread_placeholder();
                store.update_order(updated);
            }
            dirty = true;
        }

        // keep held locks alive across the passes
        store.refresh_locks();

        // Pass 2: orphan chain orders
        for chain in parsed.iter().filter(|p| !matched.contains(&p.chain_id)) {
            let Some(side) = chain.role.side() else { continue };
            let precision = self.side_precision(side);

            let mut best: Option<(f64, String, bool)> = None;
            for slot in store.slots() {
                if slot.role != chain.role || slot.chain_id().is_some() {
                    continue;
                }
                let tol = calc_price_tolerance(
                    slot.price,
                    chain.size,
                    chain.role,
                    self.pair.base.precision,
                    self.pair.quote.precision,
                );
                let dist = (slot.price - chain.price).abs();
                if dist > tol {
                    continue;
                }
                let size_match = sizes_equal(slot.size, chain.size, precision);
                let candidate = (dist, slot.id.clone(), size_match);
                best = match best {
                    // size-equal candidates win; ties go to the closest price
                    Some((bd, bid, bm)) => {
                        if (size_match && !bm) || (size_match == bm && dist < bd) {
                            Some(candidate)
                        } else {
                            Some((bd, bid, bm))
                        }
                    }
                    None => Some(candidate),
                };
            }

            if let Some((_, slot_id, size_match)) = best {
                info!(
                    "adopting orphan chain order {} into slot {}",
                    chain.chain_id, slot_id
                );
                let Some(mut slot) = store.get_cloned(&slot_id) else { continue };
                store.lock([slot_id.as_str()]);
                adopted.push(slot_id.clone());
                if size_match {
                    slot.mark_active(chain.chain_id.clone());
                } else {
                    slot.size = chain.size;
                    slot.mark_partial(chain.chain_id.clone());
                    report.updated.push(slot_id.clone());
                }
                store.update_order(slot);
                dirty = true;
            } else {
                warn!(
                    "chain order {} ({:?} {} @ {}) matches no grid slot",
                    chain.chain_id, chain.role, chain.size, chain.price
                );
            }
        }

        // Orders gone from the snapshot were consumed on chain.
        let vanished: Vec<String> = store
            .slots()
            .filter(|s| {
                s.chain_id()
                    .map(|cid| !parsed.iter().any(|p| p.chain_id == cid))
                    .unwrap_or(false)
            })
            .map(|s| s.id.clone())
            .collect();
        for slot_id in vanished {
            let Some(mut slot) = store.get_cloned(&slot_id) else { continue };
            let (Some(side), Some(chain_id)) = (slot.side(), slot.chain_id().map(str::to_string))
            else {
                continue;
            };
            info!("order {} of slot {} left the book, treating as filled", chain_id, slot_id);
            report.filled.push(FillRecord {
                slot_id: slot_id.clone(),
                chain_id,
                side,
                amount: slot.size,
                price: slot.price,
                full: true,
                delayed_rotation_trigger: false,
            });
            slot.make_spread_placeholder();
            store.update_order(slot);
            dirty = true;
        }

        if store.resume_funds_recalc() || dirty {
            accountant.recalculate(store, funds);
        }
        store.unlock(lock_ids.iter());
        store.unlock(adopted.iter());

        report
    }

    /// Fold one streamed fill into the owning slot.
    ///
    /// The filled amount is the fill's pays-leg converted into the slot's
    /// denomination; sizes hit zero only at integer precision, so a one-
    /// unit remainder stays a partial instead of becoming phantom dust.
    pub fn sync_from_fill_history(
        &self,
        store: &mut OrderStore,
        funds: &mut FundsBook,
        accountant: &Accountant,
        fill: &FillEvent,
    ) -> Option<FillRecord> {
        let Some(slot) = store.find_by_chain_id(&fill.order_id).cloned() else {
            warn!("fill for unknown chain order {}", fill.order_id);
            return None;
        };
        let side = slot.side()?;
        let precision = self.side_precision(side);

        let expected_asset = &self.pair.asset(side).id;
        if &fill.pays.asset_id != expected_asset {
            warn!(
                "fill {} pays {} but slot {} commits {}",
                fill.order_id, fill.pays.asset_id, slot.id, expected_asset
            );
            return None;
        }

        let filled = to_float(fill.pays.amount, precision);
        let new_size = (slot.size - filled).max(0.0);
        let mut updated = slot.clone();
        let mut record = FillRecord {
            slot_id: slot.id.clone(),
            chain_id: fill.order_id.clone(),
            side,
            amount: filled,
            price: slot.price,
            full: false,
            delayed_rotation_trigger: false,
        };

        store.lock([slot.id.as_str()]);

        if compare_sizes(new_size, 0.0, precision) == Ordering::Equal {
            record.full = true;
            record.amount = slot.size;
            updated.make_spread_placeholder();
        } else if let Some(mut merge) = updated.merge {
            // double-order bookkeeping: the merged portion fills first
            merge.filled_since_refill += filled;
            if compare_sizes(merge.filled_since_refill, merge.merged_size, precision)
                != Ordering::Less
            {
                record.delayed_rotation_trigger = true;
                let consumed_exactly =
                    sizes_equal(merge.filled_since_refill, merge.merged_size, precision);
                updated.merge = None;
                updated.size = new_size;
                if consumed_exactly {
                    // only the merged portion was eaten; the slot is back
                    // at its intended size
                    updated.mark_active(fill.order_id.clone());
                } else {
                    updated.mark_partial(fill.order_id.clone());
                }
            } else {
                updated.merge = Some(merge);
                updated.size = new_size;
                updated.mark_partial(fill.order_id.clone());
            }
        } else {
            updated.size = new_size;
            updated.mark_partial(fill.order_id.clone());
        }

        if store.update_order(updated) {
            accountant.recalculate(store, funds);
        }
        store.unlock([slot.id.as_str()]);
        Some(record)
    }

    /// Route a sync event to the right handler.
    pub async fn synchronize(
        &self,
        store: &mut OrderStore,
        funds: &mut FundsBook,
        accountant: &Accountant,
        event: SyncEvent,
    ) -> EngineResult<SyncReport> {
        match event {
            SyncEvent::CreateOrderAck { slot_id, chain_id, is_partial_placement, fee } => {
                let old = store
                    .get_cloned(&slot_id)
                    .ok_or_else(|| EngineError::SlotNotFound(slot_id.clone()))?;
                store.lock([slot_id.as_str()]);

                let mut updated = old.clone();
                if is_partial_placement {
                    updated.mark_partial(chain_id);
                } else {
                    updated.mark_active(chain_id);
                }

                let result = accountant.update_optimistic_free_balance(
                    funds,
                    Some(&old),
                    &updated,
                    "create order ack",
                    fee,
                );
                match result {
                    Ok(()) => {
                        if store.update_order(updated) {
                            accountant.recalculate(store, funds);
                        }
                    }
                    Err(e) => {
                        // leave the slot virtual; the next snapshot adopts
                        // the chain order once balances agree
                        warn!("create ack for {} not applied: {}", slot_id, e);
                    }
                }
                store.unlock([slot_id.as_str()]);
                Ok(SyncReport::default())
            }
            SyncEvent::CancelOrderAck { chain_id } => {
                let Some(old) = store.find_by_chain_id(&chain_id).cloned() else {
                    debug!("cancel ack for unowned chain order {}", chain_id);
                    return Ok(SyncReport::default());
                };
                store.lock([old.id.as_str()]);
                let mut updated = old.clone();
                updated.mark_virtual();
                accountant.update_optimistic_free_balance(
                    funds,
                    Some(&old),
                    &updated,
                    "cancel order ack",
                    0.0,
                )?;
                if store.update_order(updated) {
                    accountant.recalculate(store, funds);
                }
                store.unlock([old.id.as_str()]);
                Ok(SyncReport::default())
            }
            SyncEvent::Snapshot { orders, source } => {
                debug!("snapshot reconcile ({:?}): {} chain orders", source, orders.len());
                Ok(self
                    .sync_from_open_orders(store, funds, accountant, &orders)
                    .await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::AssetInfo;
    use crate::gateway::{AssetAmount, OrderPrice};
    use crate::order::SidePair;
    use crate::precision::to_int;

    fn asset(symbol: &str, id: &str, precision: u32) -> AssetInfo {
        AssetInfo {
            id: id.into(),
            symbol: symbol.into(),
            precision,
            market_fee_percent: 0.0,
            taker_fee_percent: None,
            max_market_fee: f64::MAX,
        }
    }

    fn pair() -> PairSpec {
        PairSpec { base: asset("GOLD", "1.3.106", 5), quote: asset("USD", "1.3.121", 5) }
    }

    fn engine() -> SyncEngine {
        SyncEngine::new(pair())
    }

    fn accountant() -> Accountant {
        Accountant::new(SidePair::splat(5), None, 0.0)
    }

    fn sell_order(id: &str, size: f64, price: f64) -> ChainOrder {
        let base_amount = to_int(size, 5).unwrap();
        let quote_amount = to_int(size * price, 5).unwrap();
        ChainOrder {
            order_id: id.into(),
            for_sale: base_amount,
            sell_price: OrderPrice {
                base: AssetAmount::new("1.3.106", base_amount),
                quote: AssetAmount::new("1.3.121", quote_amount),
            },
        }
    }

    fn buy_order(id: &str, size: f64, price: f64) -> ChainOrder {
        let quote_amount = to_int(size, 5).unwrap();
        let base_amount = to_int(size / price, 5).unwrap();
        ChainOrder {
            order_id: id.into(),
            for_sale: quote_amount,
            sell_price: OrderPrice {
                base: AssetAmount::new("1.3.121", quote_amount),
                quote: AssetAmount::new("1.3.106", base_amount),
            },
        }
    }

    fn grid() -> OrderStore {
        let mut sell0 = Slot::new_virtual("sell-0", 1.05, SlotRole::Sell, 10.0);
        sell0.mark_active("1.7.1");
        let mut sell1 = Slot::new_virtual("sell-1", 1.10, SlotRole::Sell, 10.0);
        sell1.mark_active("1.7.2");
        let buy0 = Slot::new_virtual("buy-0", 0.95, SlotRole::Buy, 10.0);
        let buy1 = Slot::new_virtual("buy-1", 0.90, SlotRole::Buy, 10.0);
        let spread = Slot::new_virtual("spread-0", 1.0, SlotRole::Spread, 0.0);
        OrderStore::new(vec![sell0, sell1, buy0, buy1, spread])
    }

    #[test]
    fn test_parse_roles_and_prices() {
        let eng = engine();
        let parsed = eng.parse_chain_order(&sell_order("1.7.9", 10.0, 1.05)).unwrap();
        assert_eq!(parsed.role, SlotRole::Sell);
        assert!((parsed.size - 10.0).abs() < 1e-9);
        assert!((parsed.price - 1.05).abs() < 1e-6);

        let parsed = eng.parse_chain_order(&buy_order("1.7.10", 9.5, 0.95)).unwrap();
        assert_eq!(parsed.role, SlotRole::Buy);
        assert!((parsed.size - 9.5).abs() < 1e-9);
        assert!((parsed.price - 0.95).abs() < 1e-5);
    }

    #[test]
    fn test_parse_foreign_market_is_skipped() {
        let eng = engine();
        let mut order = sell_order("1.7.9", 10.0, 1.05);
        order.sell_price.base.asset_id = "1.3.999".into();
        assert!(matches!(
            eng.parse_chain_order(&order),
            Err(EngineError::OrderParse { .. })
        ));
    }

    #[tokio::test]
    async fn test_pass1_demotes_shrunk_active_to_partial() {
        let eng = engine();
        let acct = accountant();
        let mut store = grid();
        let mut funds = FundsBook::default();

        let snapshot = vec![sell_order("1.7.1", 6.0, 1.05), sell_order("1.7.2", 10.0, 1.10)];
        let report = eng
            .sync_from_open_orders(&mut store, &mut funds, &acct, &snapshot)
            .await;

        assert_eq!(report.updated, vec!["sell-0"]);
        let slot = store.get("sell-0").unwrap();
        assert_eq!(slot.state.kind(), StateKind::Partial);
        assert!((slot.size - 6.0).abs() < 1e-9);
        // untouched order stays active
        assert_eq!(store.get("sell-1").unwrap().state.kind(), StateKind::Active);
        assert!(report.filled.is_empty());
    }

    #[tokio::test]
    async fn test_pass1_zero_size_becomes_spread_fill() {
        let eng = engine();
        let acct = accountant();
        let mut store = grid();
        let mut funds = FundsBook::default();

        let snapshot = vec![sell_order("1.7.1", 0.0, 1.05), sell_order("1.7.2", 10.0, 1.10)];
        let report = eng
            .sync_from_open_orders(&mut store, &mut funds, &acct, &snapshot)
            .await;

        assert_eq!(report.filled.len(), 1);
        let fill = &report.filled[0];
        assert_eq!(fill.slot_id, "sell-0");
        assert!(fill.full);
        assert!((fill.amount - 10.0).abs() < 1e-9);

        let slot = store.get("sell-0").unwrap();
        assert_eq!(slot.role, SlotRole::Spread);
        assert_eq!(slot.state, crate::order::SlotState::Virtual);
        assert_eq!(slot.size, 0.0);
    }

    #[tokio::test]
    async fn test_vanished_order_treated_as_filled() {
        let eng = engine();
        let acct = accountant();
        let mut store = grid();
        let mut funds = FundsBook::default();

        // snapshot only contains sell-1's order
        let snapshot = vec![sell_order("1.7.2", 10.0, 1.10)];
        let report = eng
            .sync_from_open_orders(&mut store, &mut funds, &acct, &snapshot)
            .await;

        assert_eq!(report.filled.len(), 1);
        assert_eq!(report.filled[0].slot_id, "sell-0");
        assert_eq!(store.get("sell-0").unwrap().role, SlotRole::Spread);
    }

    #[tokio::test]
    async fn test_price_drift_flags_correction() {
        let eng = engine();
        let acct = accountant();
        let mut store = grid();
        let mut funds = FundsBook::default();

        let snapshot = vec![sell_order("1.7.1", 10.0, 1.20), sell_order("1.7.2", 10.0, 1.10)];
        let report = eng
            .sync_from_open_orders(&mut store, &mut funds, &acct, &snapshot)
            .await;

        assert_eq!(report.needs_price_correction, vec!["sell-0"]);
    }

    #[tokio::test]
    async fn test_pass2_orphan_adoption() {
        let eng = engine();
        let acct = accountant();
        let mut store = grid();
        let mut funds = FundsBook::default();

        let snapshot = vec![
            sell_order("1.7.1", 10.0, 1.05),
            sell_order("1.7.2", 10.0, 1.10),
            // orphan buy matching buy-0's price and size exactly
            buy_order("1.7.77", 10.0, 0.95),
        ];
        let report = eng
            .sync_from_open_orders(&mut store, &mut funds, &acct, &snapshot)
            .await;

        let slot = store.get("buy-0").unwrap();
        assert_eq!(slot.chain_id(), Some("1.7.77"));
        assert_eq!(slot.state.kind(), StateKind::Active);
        // size agreed at integer precision: no correction
        assert!(!report.updated.contains(&"buy-0".to_string()));
        assert!(report.needs_price_correction.is_empty());
    }

    #[tokio::test]
    async fn test_pass2_orphan_with_different_size_adopts_as_partial() {
        let eng = engine();
        let acct = accountant();
        let mut store = grid();
        let mut funds = FundsBook::default();

        let snapshot = vec![
            sell_order("1.7.1", 10.0, 1.05),
            sell_order("1.7.2", 10.0, 1.10),
            buy_order("1.7.88", 4.0, 0.95),
        ];
        let report = eng
            .sync_from_open_orders(&mut store, &mut funds, &acct, &snapshot)
            .await;

        let slot = store.get("buy-0").unwrap();
        assert_eq!(slot.chain_id(), Some("1.7.88"));
        assert_eq!(slot.state.kind(), StateKind::Partial);
        assert!((slot.size - 4.0).abs() < 1e-9);
        assert!(report.updated.contains(&"buy-0".to_string()));
    }

    #[test]
    fn test_fill_history_partial_keeps_integer_remainder() {
        let eng = engine();
        let acct = accountant();
        let mut funds = FundsBook::default();

        // quantized buy of 8.62251 quote at precision 5
        let mut slot = Slot::new_virtual("buy-0", 0.95, SlotRole::Buy, 8.62251);
        slot.mark_active("1.7.50");
        let mut store = OrderStore::new(vec![slot]);

        // fill pays 862250 of 862251 integer units
        let fill = FillEvent {
            order_id: "1.7.50".into(),
            pays: AssetAmount::new("1.3.121", 862_250),
            receives: AssetAmount::new("1.3.106", 907_632),
        };
        let record = eng
            .sync_from_fill_history(&mut store, &mut funds, &acct, &fill)
            .unwrap();

        assert!(!record.full, "one integer unit remains");
        let slot = store.get("buy-0").unwrap();
        assert_eq!(slot.state.kind(), StateKind::Partial);
        assert_eq!(to_int(slot.size, 5).unwrap(), 1);
    }

    #[test]
    fn test_fill_history_exact_fill_converts_to_spread() {
        let eng = engine();
        let acct = accountant();
        let mut funds = FundsBook::default();

        let mut slot = Slot::new_virtual("sell-0", 1.05, SlotRole::Sell, 10.0);
        slot.mark_active("1.7.60");
        let mut store = OrderStore::new(vec![slot]);

        let fill = FillEvent {
            order_id: "1.7.60".into(),
            pays: AssetAmount::new("1.3.106", 1_000_000),
            receives: AssetAmount::new("1.3.121", 1_050_000),
        };
        let record = eng
            .sync_from_fill_history(&mut store, &mut funds, &acct, &fill)
            .unwrap();

        assert!(record.full);
        assert!((record.amount - 10.0).abs() < 1e-9);
        assert_eq!(store.get("sell-0").unwrap().role, SlotRole::Spread);
    }

    #[test]
    fn test_fill_history_unknown_order_is_ignored() {
        let eng = engine();
        let acct = accountant();
        let mut funds = FundsBook::default();
        let mut store = grid();

        let fill = FillEvent {
            order_id: "1.7.404".into(),
            pays: AssetAmount::new("1.3.106", 100),
            receives: AssetAmount::new("1.3.121", 100),
        };
        assert!(eng
            .sync_from_fill_history(&mut store, &mut funds, &acct, &fill)
            .is_none());
    }

    #[test]
    fn test_double_order_crossing_triggers_delayed_rotation() {
        let eng = engine();
        let acct = accountant();
        let mut funds = FundsBook::default();

        // consolidated sell: ideal 10 plus 2 merged, so size 12
        let mut slot = Slot::new_virtual("sell-0", 1.05, SlotRole::Sell, 12.0);
        slot.mark_active("1.7.70");
        slot.merge = Some(crate::order::MergeTracker::new(2.0));
        let mut store = OrderStore::new(vec![slot]);

        // first fill eats half the merged portion
        let fill = FillEvent {
            order_id: "1.7.70".into(),
            pays: AssetAmount::new("1.3.106", 100_000),
            receives: AssetAmount::new("1.3.121", 105_000),
        };
        let record = eng
            .sync_from_fill_history(&mut store, &mut funds, &acct, &fill)
            .unwrap();
        assert!(!record.delayed_rotation_trigger);
        assert!(store.get("sell-0").unwrap().merge.is_some());

        // second fill crosses it exactly
        let fill = FillEvent {
            order_id: "1.7.70".into(),
            pays: AssetAmount::new("1.3.106", 100_000),
            receives: AssetAmount::new("1.3.121", 105_000),
        };
        let record = eng
            .sync_from_fill_history(&mut store, &mut funds, &acct, &fill)
            .unwrap();
        assert!(record.delayed_rotation_trigger);

        let slot = store.get("sell-0").unwrap();
        assert!(slot.merge.is_none());
        // merged portion consumed exactly: back to the intended size
        assert_eq!(slot.state.kind(), StateKind::Active);
        assert!((slot.size - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_create_ack_marks_active_and_deducts() {
        let eng = engine();
        let acct = accountant();
        let mut store = grid();
        let mut funds = FundsBook::default();
        funds.chain_free.buy = 50.0;

        eng.synchronize(
            &mut store,
            &mut funds,
            &acct,
            SyncEvent::CreateOrderAck {
                slot_id: "buy-0".into(),
                chain_id: "1.7.90".into(),
                is_partial_placement: false,
                fee: 0.0,
            },
        )
        .await
        .unwrap();

        let slot = store.get("buy-0").unwrap();
        assert_eq!(slot.chain_id(), Some("1.7.90"));
        assert_eq!(slot.state.kind(), StateKind::Active);
        assert_eq!(funds.chain_free.buy, 40.0);
    }

    #[tokio::test]
    async fn test_create_ack_without_funds_leaves_slot_virtual() {
        let eng = engine();
        let acct = accountant();
        let mut store = grid();
        let mut funds = FundsBook::default();
        funds.chain_free.buy = 1.0;

        eng.synchronize(
            &mut store,
            &mut funds,
            &acct,
            SyncEvent::CreateOrderAck {
                slot_id: "buy-0".into(),
                chain_id: "1.7.90".into(),
                is_partial_placement: false,
                fee: 0.0,
            },
        )
        .await
        .unwrap();

        // transition aborted; orphan adoption will pick the order up later
        let slot = store.get("buy-0").unwrap();
        assert_eq!(slot.chain_id(), None);
        assert_eq!(funds.chain_free.buy, 1.0);
    }

    #[tokio::test]
    async fn test_cancel_ack_releases_funds() {
        let eng = engine();
        let acct = accountant();
        let mut store = grid();
        let mut funds = FundsBook::default();

        eng.synchronize(
            &mut store,
            &mut funds,
            &acct,
            SyncEvent::CancelOrderAck { chain_id: "1.7.1".into() },
        )
        .await
        .unwrap();

        let slot = store.get("sell-0").unwrap();
        assert_eq!(slot.chain_id(), None);
        assert_eq!(slot.state.kind(), StateKind::Virtual);
        assert_eq!(funds.chain_free.sell, 10.0);
    }
}
