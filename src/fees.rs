//! Per-asset fee cache
//!
//! Market fees and blockchain operation fees are queried once at startup
//! and never invalidated while the engine runs.

use std::collections::HashMap;

use log::info;
use serde::{Deserialize, Serialize};

use crate::consts::CREATION_FEE_MULTIPLIER;
use crate::errors::{EngineError, EngineResult};
use crate::gateway::ChainGateway;
use crate::order::Side;
use crate::precision::to_float;

/// Asset metadata as reported by the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub id: String,
    pub symbol: String,
    pub precision: u32,
    /// Maker market fee taken from proceeds, percent
    pub market_fee_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_fee_percent: Option<f64>,
    /// Absolute cap on the market fee, in this asset
    pub max_market_fee: f64,
}

/// Integer operation fees in the chain's native fee asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub create_limit_order: i64,
    pub cancel_limit_order: i64,
    pub update_limit_order: i64,
}

/// The trading pair under management.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSpec {
    pub base: AssetInfo,
    pub quote: AssetInfo,
}

impl PairSpec {
    /// The asset a side commits: buys commit quote, sells commit base.
    pub fn asset(&self, side: Side) -> &AssetInfo {
        match side {
            Side::Buy => &self.quote,
            Side::Sell => &self.base,
        }
    }

    pub fn precision(&self, side: Side) -> u32 {
        self.asset(side).precision
    }

    /// Which side holds the given symbol, if either.
    pub fn side_of(&self, symbol: &str) -> Option<Side> {
        if self.quote.symbol == symbol {
            Some(Side::Buy)
        } else if self.base.symbol == symbol {
            Some(Side::Sell)
        } else {
            None
        }
    }

    pub fn side_of_asset_id(&self, asset_id: &str) -> Option<Side> {
        if self.quote.id == asset_id {
            Some(Side::Buy)
        } else if self.base.id == asset_id {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// Net proceeds of a fill after market fees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proceeds {
    /// Proceeds with the market fee already deducted
    Net(f64),
    /// Proceeds in the chain's fee asset: the maker-net amount plus the
    /// operation fees the caller may need to reserve
    FeeAsset {
        net_maker: f64,
        create_fee: f64,
        update_fee: f64,
    },
}

impl Proceeds {
    /// The spendable amount regardless of variant.
    pub fn amount(&self) -> f64 {
        match self {
            Proceeds::Net(v) => *v,
            Proceeds::FeeAsset { net_maker, .. } => *net_maker,
        }
    }
}

/// Cache of asset metadata and operation fees.
#[derive(Debug, Clone)]
pub struct FeeCache {
    assets: HashMap<String, AssetInfo>,
    fee_asset_symbol: String,
    fee_asset_precision: u32,
    schedule: FeeSchedule,
}

impl FeeCache {
    pub fn new(fee_asset: &AssetInfo, schedule: FeeSchedule) -> Self {
        let mut assets = HashMap::new();
        assets.insert(fee_asset.symbol.clone(), fee_asset.clone());
        Self {
            fee_asset_symbol: fee_asset.symbol.clone(),
            fee_asset_precision: fee_asset.precision,
            assets,
            schedule,
        }
    }

    /// Query asset metadata and the fee schedule from the chain. Missing
    /// asset metadata is fatal: the engine refuses to run without it.
    pub async fn load<G: ChainGateway + ?Sized>(
        gateway: &G,
        fee_asset_symbol: &str,
        symbols: &[&str],
    ) -> EngineResult<Self> {
        let fee_asset = gateway.get_asset_info(fee_asset_symbol).await?;
        let schedule = gateway.get_fee_schedule().await?;
        let mut cache = Self::new(&fee_asset, schedule);
        for symbol in symbols {
            let info = gateway.get_asset_info(symbol).await?;
            info!(
                "asset {}: id={} precision={} market_fee={}%",
                info.symbol, info.id, info.precision, info.market_fee_percent
            );
            cache.insert(info);
        }
        Ok(cache)
    }

    /// Register asset metadata in the cache.
    pub fn insert(&mut self, info: AssetInfo) {
        self.assets.insert(info.symbol.clone(), info);
    }

    pub fn get(&self, symbol: &str) -> EngineResult<&AssetInfo> {
        self.assets
            .get(symbol)
            .ok_or_else(|| EngineError::AssetLookupMissing(symbol.to_string()))
    }

    pub fn pair(&self, base_symbol: &str, quote_symbol: &str) -> EngineResult<PairSpec> {
        Ok(PairSpec {
            base: self.get(base_symbol)?.clone(),
            quote: self.get(quote_symbol)?.clone(),
        })
    }

    pub fn fee_asset_symbol(&self) -> &str {
        &self.fee_asset_symbol
    }

    /// Operation fee for creating a limit order, as a float amount.
    pub fn create_fee(&self) -> f64 {
        to_float(self.schedule.create_limit_order, self.fee_asset_precision)
    }

    pub fn cancel_fee(&self) -> f64 {
        to_float(self.schedule.cancel_limit_order, self.fee_asset_precision)
    }

    pub fn update_fee(&self) -> f64 {
        to_float(self.schedule.update_limit_order, self.fee_asset_precision)
    }

    /// Proceeds of a fill in `symbol` after market fees.
    ///
    /// For the chain's fee asset the caller gets the operation fees along
    /// with the maker-net amount instead of a bare deduction, so it can
    /// reserve for upcoming create/update operations.
    pub fn net_proceeds(&self, symbol: &str, raw_amount: f64) -> EngineResult<Proceeds> {
        let info = self.get(symbol)?;
        let fee = (raw_amount * info.market_fee_percent / 100.0).min(info.max_market_fee);
        let net = raw_amount - fee;
        if symbol == self.fee_asset_symbol {
            Ok(Proceeds::FeeAsset {
                net_maker: net,
                create_fee: self.create_fee(),
                update_fee: self.update_fee(),
            })
        } else {
            Ok(Proceeds::Net(net))
        }
    }

    /// Fee-asset budget to reserve for placing `target_order_count` orders,
    /// with headroom for rotations and in-place updates.
    ///
    /// Zero when the pair does not include the fee asset: fees are then
    /// paid from a balance the grid never touches.
    pub fn creation_fee_budget(
        &self,
        pair: &PairSpec,
        target_order_count: u32,
        multiplier: Option<f64>,
    ) -> f64 {
        if pair.side_of(&self.fee_asset_symbol).is_none() {
            return 0.0;
        }
        let multiplier = multiplier.unwrap_or(CREATION_FEE_MULTIPLIER);
        self.create_fee() * target_order_count as f64 * multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_asset(symbol: &str, id: &str, precision: u32, fee_pct: f64) -> AssetInfo {
        AssetInfo {
            id: id.to_string(),
            symbol: symbol.to_string(),
            precision,
            market_fee_percent: fee_pct,
            taker_fee_percent: None,
            max_market_fee: f64::MAX,
        }
    }

    fn test_cache() -> FeeCache {
        let core = test_asset("CORE", "1.3.0", 5, 0.0);
        let mut cache = FeeCache::new(
            &core,
            FeeSchedule {
                create_limit_order: 48,
                cancel_limit_order: 1,
                update_limit_order: 24,
            },
        );
        cache.insert(test_asset("USD", "1.3.121", 4, 0.2));
        cache.insert(test_asset("GOLD", "1.3.106", 6, 0.1));
        cache
    }

    #[test]
    fn test_net_proceeds_deducts_market_fee() {
        let cache = test_cache();
        match cache.net_proceeds("USD", 1000.0).unwrap() {
            Proceeds::Net(v) => assert!((v - 998.0).abs() < 1e-9),
            other => panic!("expected Net, got {:?}", other),
        }
    }

    #[test]
    fn test_net_proceeds_fee_asset_is_structured() {
        let cache = test_cache();
        match cache.net_proceeds("CORE", 100.0).unwrap() {
            Proceeds::FeeAsset { net_maker, create_fee, update_fee } => {
                assert!((net_maker - 100.0).abs() < 1e-9);
                assert!((create_fee - 0.00048).abs() < 1e-12);
                assert!((update_fee - 0.00024).abs() < 1e-12);
            }
            other => panic!("expected FeeAsset, got {:?}", other),
        }
    }

    #[test]
    fn test_market_fee_cap() {
        let mut cache = test_cache();
        let mut capped = test_asset("CAP", "1.3.200", 4, 10.0);
        capped.max_market_fee = 5.0;
        cache.insert(capped);

        match cache.net_proceeds("CAP", 1000.0).unwrap() {
            // 10% would be 100, capped at 5
            Proceeds::Net(v) => assert!((v - 995.0).abs() < 1e-9),
            other => panic!("expected Net, got {:?}", other),
        }
    }

    #[test]
    fn test_creation_fee_budget() {
        let cache = test_cache();
        let with_fee_asset = cache.pair("CORE", "USD").unwrap();
        let without = cache.pair("GOLD", "USD").unwrap();

        let budget = cache.creation_fee_budget(&with_fee_asset, 10, None);
        assert!((budget - 0.00048 * 10.0 * 2.0).abs() < 1e-12);

        assert_eq!(cache.creation_fee_budget(&without, 10, None), 0.0);

        let tripled = cache.creation_fee_budget(&with_fee_asset, 10, Some(3.0));
        assert!((tripled - 0.00048 * 30.0).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_asset_is_fatal() {
        let cache = test_cache();
        assert!(matches!(
            cache.net_proceeds("NOPE", 1.0),
            Err(EngineError::AssetLookupMissing(_))
        ));
    }

    #[test]
    fn test_pair_side_mapping() {
        let cache = test_cache();
        let pair = cache.pair("GOLD", "USD").unwrap();
        assert_eq!(pair.precision(Side::Sell), 6);
        assert_eq!(pair.precision(Side::Buy), 4);
        assert_eq!(pair.side_of("USD"), Some(Side::Buy));
        assert_eq!(pair.side_of("GOLD"), Some(Side::Sell));
        assert_eq!(pair.side_of("CORE"), None);
        assert_eq!(pair.side_of_asset_id("1.3.106"), Some(Side::Sell));
    }
}
