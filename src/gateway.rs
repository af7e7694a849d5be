//! Chain gateway abstraction
//!
//! The engine talks to the blockchain only through [`ChainGateway`]. The
//! concrete RPC transport, wallet handling, and signing live behind this
//! trait; the crate ships a [`mock`] double for tests and a
//! [`PaperGateway`] that simulates a chain for dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::{EngineError, EngineResult};
use crate::fees::{AssetInfo, FeeSchedule};

/// An integer amount of a specific asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmount {
    pub asset_id: String,
    pub amount: i64,
}

impl AssetAmount {
    pub fn new(asset_id: impl Into<String>, amount: i64) -> Self {
        Self { asset_id: asset_id.into(), amount }
    }
}

/// Rational order price: the order sells `base` and wants `quote`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPrice {
    pub base: AssetAmount,
    pub quote: AssetAmount,
}

/// An open limit order as reported by the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOrder {
    pub order_id: String,
    /// Remaining amount of `sell_price.base` still for sale
    pub for_sale: i64,
    pub sell_price: OrderPrice,
}

/// A trade execution against one of the account's orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    /// What the order gave up
    pub pays: AssetAmount,
    /// What the order received
    pub receives: AssetAmount,
}

/// Authoritative balance aggregates for one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total: i64,
    pub free: i64,
}

/// Request to place a limit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub amount_to_sell: AssetAmount,
    pub min_to_receive: AssetAmount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

/// Request to resize an existing order in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOrderRequest {
    pub amount_to_sell: i64,
    pub min_to_receive: i64,
}

/// Chain operations the engine consumes.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Full snapshot of the account's open orders.
    async fn get_open_orders(&self, account: &str) -> EngineResult<Vec<ChainOrder>>;

    /// Balance aggregates per asset id.
    async fn get_balances(
        &self,
        account: &str,
        asset_ids: &[String],
    ) -> EngineResult<HashMap<String, AccountBalance>>;

    async fn get_asset_info(&self, symbol: &str) -> EngineResult<AssetInfo>;

    async fn get_fee_schedule(&self) -> EngineResult<FeeSchedule>;

    /// Stream of fills against the account's orders.
    async fn subscribe_fills(&self, account: &str) -> EngineResult<mpsc::Receiver<FillEvent>>;

    /// Place a limit order; returns the chain order id.
    async fn create_order(&self, account: &str, req: &CreateOrderRequest)
        -> EngineResult<String>;

    async fn cancel_order(&self, account: &str, chain_order_id: &str) -> EngineResult<()>;

    /// Resize an order in place. `Ok(None)` means the chain saw no change.
    async fn update_order(
        &self,
        account: &str,
        chain_order_id: &str,
        req: &UpdateOrderRequest,
    ) -> EngineResult<Option<()>>;
}

// ============================================================================
// Paper gateway - simulated chain for dry runs and end-to-end tests
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct PaperBook {
    orders: HashMap<String, ChainOrder>,
    balances: HashMap<String, AccountBalance>,
    fill_senders: Vec<mpsc::Sender<FillEvent>>,
}

/// A simulated chain: holds balances and open orders in memory, moves
/// funds between free and committed on place/cancel, and emits fills only
/// when they are injected. It never self-matches, so tests and dry runs
/// stay deterministic.
pub struct PaperGateway {
    assets: HashMap<String, AssetInfo>,
    schedule: FeeSchedule,
    book: Arc<Mutex<PaperBook>>,
    next_id: AtomicU64,
}

impl PaperGateway {
    pub fn new(assets: Vec<AssetInfo>, schedule: FeeSchedule) -> Self {
        Self {
            assets: assets.into_iter().map(|a| (a.symbol.clone(), a)).collect(),
            schedule,
            book: Arc::new(Mutex::new(PaperBook::default())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Seed the simulated free balance for an asset.
    pub async fn fund(&self, asset_id: &str, amount: i64) {
        let mut book = self.book.lock().await;
        let bal = book
            .balances
            .entry(asset_id.to_string())
            .or_insert(AccountBalance { total: 0, free: 0 });
        bal.total += amount;
        bal.free += amount;
    }

    pub async fn open_order_count(&self) -> usize {
        self.book.lock().await.orders.len()
    }

    pub async fn open_orders(&self) -> Vec<ChainOrder> {
        self.book.lock().await.orders.values().cloned().collect()
    }

    /// Execute `amount` (of the sold asset) against an open order and
    /// notify fill subscribers. The counter-amount is derived from the
    /// order's rational price.
    pub async fn inject_fill(&self, order_id: &str, amount: i64) -> EngineResult<()> {
        let mut book = self.book.lock().await;
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?;

        let amount = amount.min(order.for_sale);
        let received = ((amount as i128 * order.sell_price.quote.amount as i128)
            / order.sell_price.base.amount.max(1) as i128) as i64;
        order.for_sale -= amount;

        let pays = AssetAmount::new(order.sell_price.base.asset_id.clone(), amount);
        let receives = AssetAmount::new(order.sell_price.quote.asset_id.clone(), received);

        let sold_asset = pays.asset_id.clone();
        let recv_asset = receives.asset_id.clone();
        if let Some(bal) = book.balances.get_mut(&sold_asset) {
            bal.total -= amount;
        }
        let bal = book
            .balances
            .entry(recv_asset)
            .or_insert(AccountBalance { total: 0, free: 0 });
        bal.total += received;
        bal.free += received;

        let done = book.orders.get(order_id).map(|o| o.for_sale == 0).unwrap_or(false);
        if done {
            book.orders.remove(order_id);
        }

        let event = FillEvent { order_id: order_id.to_string(), pays, receives };
        book.fill_senders.retain(|tx| tx.try_send(event.clone()).is_ok());
        Ok(())
    }
}

#[async_trait]
impl ChainGateway for PaperGateway {
    async fn get_open_orders(&self, _account: &str) -> EngineResult<Vec<ChainOrder>> {
        Ok(self.book.lock().await.orders.values().cloned().collect())
    }

    async fn get_balances(
        &self,
        _account: &str,
        asset_ids: &[String],
    ) -> EngineResult<HashMap<String, AccountBalance>> {
        let book = self.book.lock().await;
        Ok(asset_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    book.balances
                        .get(id)
                        .copied()
                        .unwrap_or(AccountBalance { total: 0, free: 0 }),
                )
            })
            .collect())
    }

    async fn get_asset_info(&self, symbol: &str) -> EngineResult<AssetInfo> {
        self.assets
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::AssetLookupMissing(symbol.to_string()))
    }

    async fn get_fee_schedule(&self) -> EngineResult<FeeSchedule> {
        Ok(self.schedule)
    }

    async fn subscribe_fills(&self, _account: &str) -> EngineResult<mpsc::Receiver<FillEvent>> {
        let (tx, rx) = mpsc::channel(256);
        self.book.lock().await.fill_senders.push(tx);
        Ok(rx)
    }

    async fn create_order(
        &self,
        _account: &str,
        req: &CreateOrderRequest,
    ) -> EngineResult<String> {
        let mut book = self.book.lock().await;
        let sell = &req.amount_to_sell;
        let bal = book
            .balances
            .get_mut(&sell.asset_id)
            .filter(|b| b.free >= sell.amount)
            .ok_or_else(|| {
                EngineError::ChainRpc(format!("insufficient free balance of {}", sell.asset_id))
            })?;
        bal.free -= sell.amount;

        let order_id = format!("sim.{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        book.orders.insert(
            order_id.clone(),
            ChainOrder {
                order_id: order_id.clone(),
                for_sale: sell.amount,
                sell_price: OrderPrice {
                    base: sell.clone(),
                    quote: req.min_to_receive.clone(),
                },
            },
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, _account: &str, chain_order_id: &str) -> EngineResult<()> {
        let mut book = self.book.lock().await;
        let order = book
            .orders
            .remove(chain_order_id)
            .ok_or_else(|| EngineError::OrderNotFound(chain_order_id.to_string()))?;
        if let Some(bal) = book.balances.get_mut(&order.sell_price.base.asset_id) {
            bal.free += order.for_sale;
        }
        Ok(())
    }

    async fn update_order(
        &self,
        _account: &str,
        chain_order_id: &str,
        req: &UpdateOrderRequest,
    ) -> EngineResult<Option<()>> {
        let mut book = self.book.lock().await;
        let order = book
            .orders
            .get_mut(chain_order_id)
            .ok_or_else(|| EngineError::OrderNotFound(chain_order_id.to_string()))?;

        let delta = req.amount_to_sell - order.for_sale;
        if delta == 0 && req.min_to_receive == order.sell_price.quote.amount {
            return Ok(None);
        }
        order.for_sale = req.amount_to_sell;
        order.sell_price.quote.amount = req.min_to_receive;
        let sell_asset = order.sell_price.base.asset_id.clone();
        if let Some(bal) = book.balances.get_mut(&sell_asset) {
            bal.free -= delta;
        }
        Ok(Some(()))
    }
}

// ============================================================================
// Mock gateway for unit tests
// ============================================================================

/// Scriptable gateway double for unit tests.
pub mod mock {
    use super::*;

    #[derive(Debug, Default)]
    pub struct MockState {
        pub open_orders: Vec<ChainOrder>,
        pub balances: HashMap<String, AccountBalance>,
        pub created: Vec<CreateOrderRequest>,
        pub cancelled: Vec<String>,
        pub updated: Vec<(String, UpdateOrderRequest)>,
        pub fail_creates: bool,
        pub fail_cancels: bool,
        pub missing_on_update: bool,
    }

    pub struct MockGateway {
        pub assets: HashMap<String, AssetInfo>,
        pub schedule: FeeSchedule,
        pub state: Arc<Mutex<MockState>>,
        next_id: AtomicU64,
    }

    impl MockGateway {
        pub fn new(assets: Vec<AssetInfo>, schedule: FeeSchedule) -> Self {
            Self {
                assets: assets.into_iter().map(|a| (a.symbol.clone(), a)).collect(),
                schedule,
                state: Arc::new(Mutex::new(MockState::default())),
                next_id: AtomicU64::new(1),
            }
        }

        pub async fn set_open_orders(&self, orders: Vec<ChainOrder>) {
            self.state.lock().await.open_orders = orders;
        }

        pub async fn set_balance(&self, asset_id: &str, total: i64, free: i64) {
            self.state
                .lock()
                .await
                .balances
                .insert(asset_id.to_string(), AccountBalance { total, free });
        }
    }

    #[async_trait]
    impl ChainGateway for MockGateway {
        async fn get_open_orders(&self, _account: &str) -> EngineResult<Vec<ChainOrder>> {
            Ok(self.state.lock().await.open_orders.clone())
        }

        async fn get_balances(
            &self,
            _account: &str,
            asset_ids: &[String],
        ) -> EngineResult<HashMap<String, AccountBalance>> {
            let state = self.state.lock().await;
            Ok(asset_ids
                .iter()
                .filter_map(|id| state.balances.get(id).map(|b| (id.clone(), *b)))
                .collect())
        }

        async fn get_asset_info(&self, symbol: &str) -> EngineResult<AssetInfo> {
            self.assets
                .get(symbol)
                .cloned()
                .ok_or_else(|| EngineError::AssetLookupMissing(symbol.to_string()))
        }

        async fn get_fee_schedule(&self) -> EngineResult<FeeSchedule> {
            Ok(self.schedule)
        }

        async fn subscribe_fills(
            &self,
            _account: &str,
        ) -> EngineResult<mpsc::Receiver<FillEvent>> {
            let (_tx, rx) = mpsc::channel(16);
            Ok(rx)
        }

        async fn create_order(
            &self,
            _account: &str,
            req: &CreateOrderRequest,
        ) -> EngineResult<String> {
            let mut state = self.state.lock().await;
            if state.fail_creates {
                return Err(EngineError::ChainRpc("create rejected".into()));
            }
            state.created.push(req.clone());
            Ok(format!("1.7.{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        async fn cancel_order(&self, _account: &str, chain_order_id: &str) -> EngineResult<()> {
            let mut state = self.state.lock().await;
            if state.fail_cancels {
                return Err(EngineError::ChainRpc("cancel rejected".into()));
            }
            state.cancelled.push(chain_order_id.to_string());
            Ok(())
        }

        async fn update_order(
            &self,
            _account: &str,
            chain_order_id: &str,
            req: &UpdateOrderRequest,
        ) -> EngineResult<Option<()>> {
            let mut state = self.state.lock().await;
            if state.missing_on_update {
                return Err(EngineError::OrderNotFound(chain_order_id.to_string()));
            }
            state.updated.push((chain_order_id.to_string(), *req));
            Ok(Some(()))
        }
    }
}
