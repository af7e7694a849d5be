//! Bot configuration
//!
//! Deserializable settings for one grid on one trading pair, loadable
//! from a JSON/TOML file with environment-variable overrides layered on
//! top. Configuration errors are the only fatal errors in the engine, so
//! validation here is strict.

use std::path::PathBuf;

use config::{Config, File};
use serde::Deserialize;

use crate::errors::{EngineError, EngineResult};
use crate::ladder::{gap_slot_count, LadderSpec};
use crate::oracle::{PriceMode, PriceOracle};
use crate::order::SidePair;
use crate::strategy::{StrategySettings, MAX_WEIGHT, MIN_WEIGHT};

/// Reference price: a number, or "pool" to derive it from the oracle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum StartPrice {
    Value(f64),
    Source(String),
}

impl Default for StartPrice {
    fn default() -> Self {
        StartPrice::Source("pool".into())
    }
}

/// Price bound: absolute, or a multiplier like "5x" relative to the
/// start price.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PriceBound {
    Absolute(f64),
    Relative(String),
}

/// Side budget: absolute amount, or a percentage of the available
/// balance like "80%".
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FundsSetting {
    Absolute(f64),
    Percent(String),
}

impl FundsSetting {
    /// Resolve against the balance actually available on the side.
    pub fn resolve(&self, available: f64) -> EngineResult<f64> {
        match self {
            FundsSetting::Absolute(v) => Ok(*v),
            FundsSetting::Percent(s) => {
                let pct: f64 = s
                    .trim()
                    .strip_suffix('%')
                    .ok_or_else(|| {
                        EngineError::InvalidConfig(format!("funds setting '{}' not N%", s))
                    })?
                    .parse()
                    .map_err(|_| {
                        EngineError::InvalidConfig(format!("funds setting '{}' not N%", s))
                    })?;
                Ok(available * pct / 100.0)
            }
        }
    }
}

fn default_active() -> bool {
    true
}

fn default_fee_asset() -> String {
    "CORE".into()
}

fn default_price_interval() -> u64 {
    30
}

fn default_snapshot_interval() -> u64 {
    60
}

/// Configuration for one grid bot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    /// Chain account the orders belong to
    pub account: String,
    /// Base asset symbol (sell side)
    pub asset_a: String,
    /// Quote asset symbol (buy side)
    pub asset_b: String,
    /// The chain's native fee asset symbol
    #[serde(default = "default_fee_asset")]
    pub fee_asset: String,

    #[serde(default)]
    pub start_price: StartPrice,
    pub min_price: PriceBound,
    pub max_price: PriceBound,

    /// Geometric step between adjacent slots, percent, in (0, 100)
    pub increment_percent: f64,
    /// Desired spread width, floored by the increment-based minimum
    pub target_spread_percent: f64,
    /// Weight coefficient per side, in [-1, 2]
    #[serde(default)]
    pub weight_distribution: SidePair<f64>,
    /// Budget per side
    pub bot_funds: SidePair<FundsSetting>,
    /// Target on-chain order count per side
    pub active_orders: SidePair<u32>,

    /// Plan only; no chain writes
    #[serde(default)]
    pub dry_run: bool,
    /// Master enable
    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_price_interval")]
    pub price_interval_secs: u64,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

impl BotConfig {
    /// Load from a file with `DEXGRID_`-prefixed environment overrides.
    pub fn load(path: &str) -> EngineResult<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(config::Environment::with_prefix("DEXGRID").separator("__"))
            .build()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        let cfg: Self = settings
            .try_deserialize()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.asset_a.is_empty() || self.asset_b.is_empty() {
            return Err(EngineError::InvalidConfig("asset symbols required".into()));
        }
        if self.asset_a == self.asset_b {
            return Err(EngineError::InvalidConfig(
                "assetA and assetB must differ".into(),
            ));
        }
        if !(self.increment_percent > 0.0 && self.increment_percent < 100.0) {
            return Err(EngineError::InvalidConfig(format!(
                "incrementPercent {} outside (0, 100)",
                self.increment_percent
            )));
        }
        if self.target_spread_percent < 0.0 {
            return Err(EngineError::InvalidConfig(
                "targetSpreadPercent must not be negative".into(),
            ));
        }
        for side in [self.weight_distribution.buy, self.weight_distribution.sell] {
            if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&side) {
                return Err(EngineError::InvalidConfig(format!(
                    "weightDistribution {} outside [{}, {}]",
                    side, MIN_WEIGHT, MAX_WEIGHT
                )));
            }
        }
        if self.active_orders.buy == 0 || self.active_orders.sell == 0 {
            return Err(EngineError::InvalidConfig(
                "activeOrders must be at least 1 per side".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the reference price, consulting the oracle when configured
    /// as "pool".
    pub async fn resolve_start_price<O: PriceOracle + ?Sized>(
        &self,
        oracle: &O,
    ) -> EngineResult<f64> {
        match &self.start_price {
            StartPrice::Value(v) if *v > 0.0 => Ok(*v),
            StartPrice::Value(v) => Err(EngineError::InvalidConfig(format!(
                "startPrice {} must be positive",
                v
            ))),
            StartPrice::Source(s) if s == "pool" => oracle
                .derive_price(&self.asset_a, &self.asset_b, PriceMode::Auto)
                .await?
                .ok_or_else(|| EngineError::NoPrice {
                    base: self.asset_a.clone(),
                    quote: self.asset_b.clone(),
                }),
            StartPrice::Source(s) => Err(EngineError::InvalidConfig(format!(
                "unknown startPrice source '{}'",
                s
            ))),
        }
    }

    /// Resolve a bound: "5x" means five times the start price for the
    /// upper bound and a fifth of it for the lower.
    pub fn resolve_bound(
        bound: &PriceBound,
        start_price: f64,
        is_upper: bool,
    ) -> EngineResult<f64> {
        match bound {
            PriceBound::Absolute(v) if *v > 0.0 => Ok(*v),
            PriceBound::Absolute(v) => Err(EngineError::InvalidConfig(format!(
                "price bound {} must be positive",
                v
            ))),
            PriceBound::Relative(s) => {
                let factor: f64 = s
                    .trim()
                    .strip_suffix(['x', 'X'])
                    .ok_or_else(|| {
                        EngineError::InvalidConfig(format!("price bound '{}' not Nx", s))
                    })?
                    .parse()
                    .map_err(|_| {
                        EngineError::InvalidConfig(format!("price bound '{}' not Nx", s))
                    })?;
                if factor <= 0.0 {
                    return Err(EngineError::InvalidConfig(format!(
                        "price bound factor {} must be positive",
                        factor
                    )));
                }
                Ok(if is_upper {
                    start_price * factor
                } else {
                    start_price / factor
                })
            }
        }
    }

    /// Ladder parameters for a resolved start price and side budgets.
    pub fn ladder_spec(
        &self,
        start_price: f64,
        allocation: SidePair<f64>,
        precisions: SidePair<u32>,
    ) -> EngineResult<LadderSpec> {
        Ok(LadderSpec {
            reference_price: start_price,
            min_price: Self::resolve_bound(&self.min_price, start_price, false)?,
            max_price: Self::resolve_bound(&self.max_price, start_price, true)?,
            increment_percent: self.increment_percent,
            target_spread_percent: self.target_spread_percent,
            weights: self.weight_distribution,
            allocation,
            precisions,
        })
    }

    /// Strategy parameters for a resolved allocation and fee reservation.
    pub fn strategy_settings(
        &self,
        allocation: SidePair<f64>,
        fee_reservation: f64,
    ) -> StrategySettings {
        StrategySettings {
            weights: self.weight_distribution,
            increment_fraction: self.increment_percent / 100.0,
            active_orders: self.active_orders,
            allocation,
            gap_slots: gap_slot_count(self.increment_percent, self.target_spread_percent),
            fee_reservation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_json() -> &'static str {
        r#"{
            "account": "grid-maker",
            "assetA": "GOLD",
            "assetB": "USD",
            "startPrice": 1.0,
            "minPrice": "4x",
            "maxPrice": "4x",
            "incrementPercent": 5.0,
            "targetSpreadPercent": 10.0,
            "weightDistribution": { "buy": 0.5, "sell": 0.5 },
            "botFunds": { "buy": 1000.0, "sell": "50%" },
            "activeOrders": { "buy": 3, "sell": 3 }
        }"#
    }

    fn parsed() -> BotConfig {
        serde_json::from_str(config_json()).unwrap()
    }

    #[test]
    fn test_parses_spec_keys() {
        let cfg = parsed();
        assert_eq!(cfg.asset_a, "GOLD");
        assert_eq!(cfg.start_price, StartPrice::Value(1.0));
        assert_eq!(cfg.min_price, PriceBound::Relative("4x".into()));
        assert_eq!(cfg.bot_funds.sell, FundsSetting::Percent("50%".into()));
        assert_eq!(cfg.bot_funds.buy, FundsSetting::Absolute(1000.0));
        assert!(cfg.active, "active defaults on");
        assert!(!cfg.dry_run);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_relative_bounds() {
        let upper = BotConfig::resolve_bound(&PriceBound::Relative("4x".into()), 2.0, true).unwrap();
        assert_eq!(upper, 8.0);
        let lower =
            BotConfig::resolve_bound(&PriceBound::Relative("4x".into()), 2.0, false).unwrap();
        assert_eq!(lower, 0.5);
        let abs = BotConfig::resolve_bound(&PriceBound::Absolute(3.0), 2.0, true).unwrap();
        assert_eq!(abs, 3.0);

        assert!(BotConfig::resolve_bound(&PriceBound::Relative("abc".into()), 2.0, true).is_err());
        assert!(BotConfig::resolve_bound(&PriceBound::Absolute(-1.0), 2.0, true).is_err());
    }

    #[test]
    fn test_funds_percentage() {
        assert_eq!(FundsSetting::Percent("50%".into()).resolve(200.0).unwrap(), 100.0);
        assert_eq!(FundsSetting::Absolute(75.0).resolve(200.0).unwrap(), 75.0);
        assert!(FundsSetting::Percent("half".into()).resolve(200.0).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_increment() {
        let mut cfg = parsed();
        cfg.increment_percent = 0.0;
        assert!(cfg.validate().is_err());
        cfg.increment_percent = 100.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_out_of_range_weights() {
        let mut cfg = parsed();
        cfg.weight_distribution.buy = 2.5;
        assert!(cfg.validate().is_err());
        cfg.weight_distribution.buy = -1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_same_assets() {
        let mut cfg = parsed();
        cfg.asset_b = "GOLD".into();
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn test_start_price_from_pool() {
        let mut cfg = parsed();
        cfg.start_price = StartPrice::Source("pool".into());
        let oracle = crate::oracle::StaticOracle::new(1.25);
        let price = cfg.resolve_start_price(&oracle).await.unwrap();
        assert_eq!(price, 1.25);
    }

    #[tokio::test]
    async fn test_unknown_price_source_is_fatal() {
        let mut cfg = parsed();
        cfg.start_price = StartPrice::Source("tarot".into());
        let oracle = crate::oracle::StaticOracle::new(1.25);
        assert!(cfg.resolve_start_price(&oracle).await.is_err());
    }
}
