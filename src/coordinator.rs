//! Engine coordinator
//!
//! Producer tasks feed price ticks, chain snapshots, and fill events into
//! one channel; the consumer owns all mutable state and drives the cycle:
//! reconcile, plan, dispatch, acknowledge, correct, persist. Runtime
//! errors log and continue; only configuration and asset-lookup failures
//! at startup are fatal.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::config::BotConfig;
use crate::consts::{
    ACCOUNT_TOTALS_TIMEOUT, DISPATCH_CONCURRENCY, MAX_RPC_RETRIES, RPC_RETRY_BASE_DELAY,
    SYNC_DELAY,
};
use crate::errors::{EngineError, EngineResult};
use crate::fees::{FeeCache, PairSpec};
use crate::funds::{Accountant, FundsBook};
use crate::gateway::{
    AccountBalance, AssetAmount, ChainGateway, ChainOrder, CreateOrderRequest, FillEvent,
    UpdateOrderRequest,
};
use crate::ladder::gap_slot_count;
use crate::oracle::PriceOracle;
use crate::order::{OrderStore, Side, SidePair, Slot, SlotRole};
use crate::persist::{GridFingerprint, GridSnapshot, GridStore};
use crate::precision::{to_float, to_int, validate_order_amounts};
use crate::strategy::{
    measure_divergence, plan_size_corrections, BoundaryState, PlanAction, RebalancePlan,
    RebalancePlanner, SizeCorrection,
};
use crate::sync::{FillRecord, SyncEngine, SyncEvent, SyncSource};

/// Events the consumer loop reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    Price(f64),
    Snapshot {
        orders: Vec<ChainOrder>,
        balances: std::collections::HashMap<String, AccountBalance>,
    },
    Fill(FillEvent),
    Shutdown,
}

/// All mutable engine state, owned by the consumer.
pub struct EngineState {
    pub store: OrderStore,
    pub funds: FundsBook,
    pub boundary: BoundaryState,
    /// Ladder as last acknowledged by a persisted snapshot; the baseline
    /// for divergence measurement
    pub persisted_slots: Vec<Slot>,
    pub last_price: f64,
}

/// Drives one grid on one trading pair.
pub struct Coordinator {
    config: BotConfig,
    gateway: Arc<dyn ChainGateway>,
    fees: FeeCache,
    pair: PairSpec,
    accountant: Accountant,
    sync_engine: SyncEngine,
    planner: RebalancePlanner,
    grid_store: GridStore,
    fingerprint: GridFingerprint,
    bot_id: Uuid,
    excluded: HashSet<String>,
    /// Serializes divergence-correction dispatch; the early-return check
    /// runs inside it to close the detection/dispatch race
    corrections_lock: Arc<tokio::sync::Mutex<()>>,
    pub state: EngineState,
}

impl Coordinator {
    /// Assemble the engine: query asset metadata and fees, resolve the
    /// start price and budgets, then restore the persisted grid or build
    /// a fresh ladder.
    pub async fn bootstrap(
        config: BotConfig,
        gateway: Arc<dyn ChainGateway>,
        oracle: &dyn PriceOracle,
    ) -> EngineResult<Self> {
        config.validate()?;

        let fees = FeeCache::load(
            gateway.as_ref(),
            &config.fee_asset,
            &[&config.asset_a, &config.asset_b],
        )
        .await?;
        let pair = fees.pair(&config.asset_a, &config.asset_b)?;
        let precisions = SidePair::new(pair.precision(Side::Buy), pair.precision(Side::Sell));

        let start_price = config.resolve_start_price(oracle).await?;
        info!("reference price: {}", start_price);

        let balances = Self::fetch_balances(gateway.as_ref(), &config.account, &pair).await?;
        let free = SidePair::new(
            to_float(balances.get(Side::Buy).free, pair.precision(Side::Buy)),
            to_float(balances.get(Side::Sell).free, pair.precision(Side::Sell)),
        );
        let allocation = SidePair::new(
            config.bot_funds.buy.resolve(free.buy)?,
            config.bot_funds.sell.resolve(free.sell)?,
        );
        info!(
            "budgets: buy {} {}, sell {} {}",
            allocation.buy, pair.quote.symbol, allocation.sell, pair.base.symbol
        );

        let target_orders = config.active_orders.buy + config.active_orders.sell;
        let fee_reservation = fees.creation_fee_budget(&pair, target_orders, None);
        let accountant = Accountant::new(
            precisions,
            pair.side_of(fees.fee_asset_symbol()),
            fee_reservation,
        );

        let ladder_spec = config.ladder_spec(start_price, allocation, precisions)?;
        let fingerprint = GridFingerprint {
            base_symbol: pair.base.symbol.clone(),
            quote_symbol: pair.quote.symbol.clone(),
            min_price: ladder_spec.min_price,
            max_price: ladder_spec.max_price,
            increment_percent: config.increment_percent,
            slot_count: 0,
        };

        let grid_store = GridStore::new(config.state_file.clone());
        let mut funds = FundsBook::default();
        let mut bot_id = Uuid::new_v4();

        let slots = match grid_store.load()? {
            Some(snapshot) => {
                let mut expected = fingerprint.clone();
                expected.slot_count = snapshot.slots.len();
                match snapshot.validate_against(&expected) {
                    Ok(()) => {
                        info!("resuming grid {}", snapshot.bot_id);
                        bot_id = snapshot.bot_id;
                        funds.cache_funds = snapshot.cache_funds;
                        funds.fee_debt = snapshot.fee_debt;
                        snapshot.slots
                    }
                    Err(e) => {
                        warn!("persisted grid rejected ({}), rebuilding", e);
                        ladder_spec.build()?
                    }
                }
            }
            None => ladder_spec.build()?,
        };

        let fingerprint = GridFingerprint { slot_count: slots.len(), ..fingerprint };
        let persisted_slots = slots.clone();
        let store = OrderStore::new(slots);
        let gap = gap_slot_count(config.increment_percent, config.target_spread_percent);
        let boundary = BoundaryState::straddling(&store, start_price, gap);

        funds.chain_free = free;
        accountant.recalculate(&store, &mut funds);

        let planner = RebalancePlanner::new(config.strategy_settings(allocation, fee_reservation))?;

        Ok(Self {
            config,
            gateway,
            fees,
            sync_engine: SyncEngine::new(pair.clone()),
            pair,
            accountant,
            planner,
            grid_store,
            fingerprint,
            bot_id,
            excluded: HashSet::new(),
            corrections_lock: Arc::new(tokio::sync::Mutex::new(())),
            state: EngineState {
                store,
                funds,
                boundary,
                persisted_slots,
                last_price: start_price,
            },
        })
    }

    async fn fetch_balances(
        gateway: &dyn ChainGateway,
        account: &str,
        pair: &PairSpec,
    ) -> EngineResult<SidePair<AccountBalance>> {
        let asset_ids = vec![pair.quote.id.clone(), pair.base.id.clone()];
        let balances = timeout(
            ACCOUNT_TOTALS_TIMEOUT,
            gateway.get_balances(account, &asset_ids),
        )
        .await
        .map_err(|_| EngineError::ChainRpc("balance query timed out".into()))??;
        let get = |id: &str| {
            balances
                .get(id)
                .copied()
                .unwrap_or(AccountBalance { total: 0, free: 0 })
        };
        Ok(SidePair::new(get(&pair.quote.id), get(&pair.base.id)))
    }

    /// Run until shutdown: spawn the producers and consume their events.
    pub async fn run(&mut self, oracle: Arc<dyn PriceOracle>) -> EngineResult<()> {
        if !self.config.active {
            info!("bot is disabled in configuration");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<EngineEvent>(256);
        self.spawn_producers(tx.clone()).await?;
        self.spawn_price_ticker(tx.clone(), oracle);

        // first cycle puts the initial window on chain
        self.initial_placement().await?;
        self.persist().await;

        // held locks are refreshed at half their timeout so a long cycle
        // never loses them mid-flight
        let mut lock_refresh = interval(crate::consts::LOCK_TIMEOUT / 2);
        lock_refresh.tick().await;

        loop {
            let event = tokio::select! {
                Some(event) = rx.recv() => event,
                _ = lock_refresh.tick() => {
                    self.state.store.refresh_locks();
                    continue;
                }
                _ = tokio::signal::ctrl_c() => EngineEvent::Shutdown,
                else => break,
            };

            match event {
                EngineEvent::Shutdown => {
                    info!("shutting down: persisting and releasing locks");
                    self.persist().await;
                    self.state.store.release_all_locks();
                    break;
                }
                event => {
                    // batch any fills already queued behind this event
                    let mut fills = Vec::new();
                    let mut snapshot = None;
                    self.collect(event, &mut fills, &mut snapshot);
                    while let Ok(more) = rx.try_recv() {
                        self.collect(more, &mut fills, &mut snapshot);
                    }
                    if let Err(e) = self.run_cycle(snapshot, fills).await {
                        error!("cycle failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    fn collect(
        &mut self,
        event: EngineEvent,
        fills: &mut Vec<FillEvent>,
        snapshot: &mut Option<EngineEvent>,
    ) {
        match event {
            EngineEvent::Price(price) => {
                debug!("price tick: {}", price);
                self.state.last_price = price;
            }
            EngineEvent::Fill(fill) => fills.push(fill),
            EngineEvent::Snapshot { .. } => *snapshot = Some(event),
            EngineEvent::Shutdown => {}
        }
    }

    async fn spawn_producers(&self, tx: mpsc::Sender<EngineEvent>) -> EngineResult<()> {
        // fill stream
        let mut fill_rx = self.gateway.subscribe_fills(&self.config.account).await?;
        let fill_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(fill) = fill_rx.recv().await {
                if fill_tx.send(EngineEvent::Fill(fill)).await.is_err() {
                    break;
                }
            }
        });

        // periodic chain snapshot
        let gateway = Arc::clone(&self.gateway);
        let account = self.config.account.clone();
        let asset_ids = vec![self.pair.quote.id.clone(), self.pair.base.id.clone()];
        let snap_tx = tx.clone();
        let snapshot_interval = self.config.snapshot_interval_secs;
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(snapshot_interval.max(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let orders = match gateway.get_open_orders(&account).await {
                    Ok(orders) => orders,
                    Err(e) => {
                        warn!("snapshot fetch failed: {}", e);
                        continue;
                    }
                };
                let balances = match timeout(
                    ACCOUNT_TOTALS_TIMEOUT,
                    gateway.get_balances(&account, &asset_ids),
                )
                .await
                {
                    Ok(Ok(balances)) => balances,
                    Ok(Err(e)) => {
                        warn!("balance fetch failed: {}", e);
                        continue;
                    }
                    Err(_) => {
                        warn!("balance fetch timed out");
                        continue;
                    }
                };
                if snap_tx
                    .send(EngineEvent::Snapshot { orders, balances })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(())
    }

    fn spawn_price_ticker(&self, tx: mpsc::Sender<EngineEvent>, oracle: Arc<dyn PriceOracle>) {
        let base = self.config.asset_a.clone();
        let quote = self.config.asset_b.clone();
        let secs = self.config.price_interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match oracle
                    .derive_price(&base, &quote, crate::oracle::PriceMode::Auto)
                    .await
                {
                    Ok(Some(price)) => {
                        if tx.send(EngineEvent::Price(price)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => debug!("oracle returned no price"),
                    Err(e) => warn!("price derivation failed: {}", e),
                }
            }
        });
    }

    /// Put the initial order window on chain. Runs once at startup when
    /// nothing is on chain yet.
    pub async fn initial_placement(&mut self) -> EngineResult<()> {
        let anything_on_chain = self.state.store.slots().any(|s| s.is_on_chain());
        if anything_on_chain {
            return Ok(());
        }
        let plan =
            self.planner
                .bootstrap_plan(&self.state.store, &self.state.boundary, &self.excluded);
        info!("initial placement: {} orders", plan.actions.len());
        self.dispatch_plan(plan).await;
        Ok(())
    }

    /// One full engine cycle.
    pub async fn run_cycle(
        &mut self,
        snapshot: Option<EngineEvent>,
        fill_events: Vec<FillEvent>,
    ) -> EngineResult<()> {
        // stable phase: retry a failed persist from an earlier cycle
        self.grid_store.retry_pending().await;

        let mut fills: Vec<FillRecord> = Vec::new();

        // snapshot reconcile first so fill deltas apply to fresh state
        if let Some(EngineEvent::Snapshot { orders, balances }) = snapshot {
            for side in Side::BOTH {
                let asset = self.pair.asset(side);
                if let Some(balance) = balances.get(&asset.id) {
                    self.accountant.reconcile_chain_free(
                        &mut self.state.funds,
                        side,
                        to_float(balance.free, asset.precision),
                    );
                }
            }
            let report = self
                .sync_engine
                .synchronize(
                    &mut self.state.store,
                    &mut self.state.funds,
                    &self.accountant,
                    SyncEvent::Snapshot { orders, source: SyncSource::PeriodicFetch },
                )
                .await?;
            fills.extend(report.filled);
        }

        for event in &fill_events {
            if let Some(record) = self.sync_engine.sync_from_fill_history(
                &mut self.state.store,
                &mut self.state.funds,
                &self.accountant,
                event,
            ) {
                fills.push(record);
            }
        }

        let plan = self.planner.process_filled_orders(
            &mut self.state.store,
            &mut self.state.funds,
            &self.accountant,
            &self.fees,
            &self.pair,
            &mut self.state.boundary,
            &fills,
            &self.excluded,
        )?;

        self.dispatch_plan(plan).await;
        self.apply_corrections().await;

        let settled = self.accountant.settle_fee_debt(&mut self.state.funds);
        if settled > 0.0 {
            debug!("settled {} of fee debt", settled);
        }

        self.accountant
            .recalculate(&self.state.store, &mut self.state.funds);
        self.persist().await;
        Ok(())
    }

    /// Submit a plan to the gateway with bounded concurrency and feed the
    /// acknowledgements back through the sync engine.
    async fn dispatch_plan(&mut self, plan: RebalancePlan) {
        if plan.actions.is_empty() {
            return;
        }
        if self.config.dry_run {
            info!("dry run: skipping {} chain actions", plan.actions.len());
            for action in &plan.actions {
                debug!("dry run action: {:?}", action);
            }
            return;
        }

        let gateway = Arc::clone(&self.gateway);
        let account = self.config.account.clone();
        let requests: Vec<DispatchOutcome> = {
            let store = &self.state.store;
            let pair = &self.pair;
            stream::iter(plan.actions.into_iter().filter_map(|action| {
                prepared_dispatch(store, pair, action)
            }))
            .map(|prepared| {
                let gateway = Arc::clone(&gateway);
                let account = account.clone();
                async move { prepared.execute(gateway.as_ref(), &account).await }
            })
            .buffer_unordered(DISPATCH_CONCURRENCY)
            .collect()
            .await
        };

        for outcome in requests {
            self.apply_outcome(outcome).await;
        }
    }

    async fn apply_outcome(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Placed { slot_id, chain_id } => {
                self.ack_created(slot_id, chain_id).await;
            }
            DispatchOutcome::Cancelled { chain_id, rotation_place } => {
                if let Err(e) = self.planner.complete_order_rotation(
                    &mut self.state.store,
                    &mut self.state.funds,
                    &self.accountant,
                    &chain_id,
                ) {
                    warn!("cancel ack failed: {}", e);
                }
                // the rotation's place half runs only after its cancel
                // freed the capital
                if let Some((slot_id, size)) = rotation_place {
                    self.dispatch_rotation_place(slot_id, size).await;
                }
            }
            DispatchOutcome::Failed { context } => {
                warn!("chain action dropped: {}", context);
            }
        }
    }

    async fn ack_created(&mut self, slot_id: String, chain_id: String) {
        let fee = if self.accountant.fee_asset_side().is_some() {
            self.fees.create_fee()
        } else {
            0.0
        };
        if let Err(e) = self
            .sync_engine
            .synchronize(
                &mut self.state.store,
                &mut self.state.funds,
                &self.accountant,
                SyncEvent::CreateOrderAck {
                    slot_id,
                    chain_id,
                    is_partial_placement: false,
                    fee,
                },
            )
            .await
        {
            warn!("create ack failed: {}", e);
        }
    }

    async fn dispatch_rotation_place(&mut self, slot_id: String, size: f64) {
        let Some(mut sized) = self.state.store.get_cloned(&slot_id) else { return };
        sized.size = size;
        let Some(request) = order_request(&sized, &self.pair) else {
            warn!("rotation place for {} skipped: bad amounts", slot_id);
            return;
        };
        let gateway = Arc::clone(&self.gateway);
        let account = self.config.account.clone();
        match with_retry(|| async { gateway.create_order(&account, &request).await }).await {
            Ok(chain_id) => self.ack_created(slot_id, chain_id).await,
            Err(e) => warn!("rotation place for {} failed: {}", slot_id, e),
        }
    }

    /// Divergence check and amount-only corrections, serialized and paced.
    async fn apply_corrections(&mut self) {
        let lock = Arc::clone(&self.corrections_lock);
        let _guard = lock.lock().await;

        // the early-return check runs inside the lock
        let report = measure_divergence(&self.state.store, &self.state.persisted_slots);
        if !report.flagged.buy && !report.flagged.sell {
            return;
        }
        info!(
            "divergence flagged: buy {:.2}% sell {:.2}%",
            report.rms_percent.buy, report.rms_percent.sell
        );

        let corrections = plan_size_corrections(
            &self.state.store,
            &self.state.persisted_slots,
            report.flagged,
            &self.pair,
        );
        if corrections.is_empty() {
            return;
        }

        let ids: Vec<String> = corrections.iter().map(|c| c.slot_id.clone()).collect();
        self.state.store.lock(ids.iter());

        for correction in corrections {
            // pacing between submissions keeps the node happy
            tokio::time::sleep(SYNC_DELAY).await;
            self.state.store.refresh_locks();
            if self.config.dry_run {
                debug!("dry run correction: {:?}", correction);
                continue;
            }
            if let Err(e) = self.submit_correction(&correction).await {
                if matches!(e, EngineError::OrderNotFound(_)) {
                    // the order filled between detection and update
                    debug!("correction for {} dropped: order gone", correction.slot_id);
                } else {
                    // failed corrections are not retried; the list clears
                    // to prevent buildup
                    warn!("correction batch abandoned: {}", e);
                    break;
                }
            }
        }

        self.state.store.unlock(ids.iter());
    }

    async fn submit_correction(&mut self, correction: &SizeCorrection) -> EngineResult<()> {
        let Some(slot) = self.state.store.get_cloned(&correction.slot_id) else {
            return Ok(());
        };
        let Some(side) = slot.side() else { return Ok(()) };
        let mut sized = slot.clone();
        sized.size = correction.new_size;
        let Some(request) = order_request(&sized, &self.pair) else {
            return Ok(());
        };
        let update = UpdateOrderRequest {
            amount_to_sell: request.amount_to_sell.amount,
            min_to_receive: request.min_to_receive.amount,
        };

        let result = self
            .gateway
            .update_order(&self.config.account, &correction.chain_id, &update)
            .await?;
        if result.is_none() {
            debug!("correction for {} was a no-op on chain", correction.slot_id);
            return Ok(());
        }

        // the chain moved from the acknowledged size to the intended one
        let delta = correction.new_size - correction.old_size;
        if delta > 0.0 {
            if let Err(e) = self.accountant.try_deduct(
                &mut self.state.funds,
                side,
                delta,
                "size correction",
            ) {
                warn!("correction applied on chain but not in funds: {}", e);
            }
        } else if delta < 0.0 {
            self.accountant
                .add_to_chain_free(&mut self.state.funds, side, -delta);
        }
        Ok(())
    }

    /// Persist the ladder and monetary counters; on success the persisted
    /// baseline for divergence moves forward.
    pub async fn persist(&mut self) {
        let slots: Vec<Slot> = self.state.store.slots().cloned().collect();
        let snapshot = GridSnapshot::new(
            self.bot_id,
            self.fingerprint.clone(),
            slots.clone(),
            self.state.funds.cache_funds,
            self.state.funds.fee_debt,
        );
        match self.grid_store.save(&snapshot).await {
            Ok(()) => self.state.persisted_slots = slots,
            Err(e) => warn!("persist failed, will retry: {}", e),
        }
    }
}

/// A chain action with its request prebuilt from store state.
enum PreparedDispatch {
    Place { slot_id: String, request: CreateOrderRequest },
    Cancel { chain_id: String, rotation_place: Option<(String, f64)> },
}

enum DispatchOutcome {
    Placed { slot_id: String, chain_id: String },
    Cancelled { chain_id: String, rotation_place: Option<(String, f64)> },
    Failed { context: String },
}

impl PreparedDispatch {
    async fn execute(self, gateway: &dyn ChainGateway, account: &str) -> DispatchOutcome {
        match self {
            PreparedDispatch::Place { slot_id, request } => {
                match with_retry(|| async { gateway.create_order(account, &request).await }).await
                {
                    Ok(chain_id) => DispatchOutcome::Placed { slot_id, chain_id },
                    Err(e) => DispatchOutcome::Failed {
                        context: format!("place {}: {}", slot_id, e),
                    },
                }
            }
            PreparedDispatch::Cancel { chain_id, rotation_place } => {
                match with_retry(|| async { gateway.cancel_order(account, &chain_id).await }).await
                {
                    Ok(()) => DispatchOutcome::Cancelled { chain_id, rotation_place },
                    Err(e) => DispatchOutcome::Failed {
                        context: format!("cancel {}: {}", chain_id, e),
                    },
                }
            }
        }
    }
}

fn prepared_dispatch(
    store: &OrderStore,
    pair: &PairSpec,
    action: PlanAction,
) -> Option<PreparedDispatch> {
    match action {
        PlanAction::Place { slot_id, size } => {
            let mut slot = store.get_cloned(&slot_id)?;
            slot.size = size;
            let request = order_request(&slot, pair)?;
            Some(PreparedDispatch::Place { slot_id, request })
        }
        PlanAction::Cancel { chain_id, .. } => {
            Some(PreparedDispatch::Cancel { chain_id, rotation_place: None })
        }
        PlanAction::Rotate { cancel_chain_id, place_slot_id, size, .. } => {
            Some(PreparedDispatch::Cancel {
                chain_id: cancel_chain_id,
                rotation_place: Some((place_slot_id, size)),
            })
        }
    }
}

/// Build the chain order request for a slot at its current size. Amounts
/// that overflow the chain's integer range make the order get skipped
/// with a warning rather than aborting the batch.
fn order_request(slot: &Slot, pair: &PairSpec) -> Option<CreateOrderRequest> {
    let (sell_asset, sell_amount, recv_asset, recv_amount) = match slot.role {
        SlotRole::Sell => (
            &pair.base,
            slot.size,
            &pair.quote,
            slot.size * slot.price,
        ),
        SlotRole::Buy => (
            &pair.quote,
            slot.size,
            &pair.base,
            slot.size / slot.price,
        ),
        SlotRole::Spread => return None,
    };
    if !validate_order_amounts(
        sell_amount,
        recv_amount,
        sell_asset.precision,
        recv_asset.precision,
    ) {
        warn!("order for {} has unrepresentable amounts, skipping", slot.id);
        return None;
    }
    Some(CreateOrderRequest {
        amount_to_sell: AssetAmount::new(
            sell_asset.id.clone(),
            to_int(sell_amount, sell_asset.precision).ok()?,
        ),
        min_to_receive: AssetAmount::new(
            recv_asset.id.clone(),
            to_int(recv_amount, recv_asset.precision).ok()?,
        ),
        expiration: None,
    })
}

/// Retry transient gateway errors with exponential backoff.
async fn with_retry<T, F, Fut>(operation: F) -> EngineResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < MAX_RPC_RETRIES => {
                attempt += 1;
                let delay = RPC_RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    "transient chain error (attempt {}/{}), retrying in {:?}: {}",
                    attempt, MAX_RPC_RETRIES, delay, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
