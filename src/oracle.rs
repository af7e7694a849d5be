//! Reference price derivation
//!
//! The engine consumes prices through [`PriceOracle`]; concrete sources
//! (pool quotes, order books, trade history) live behind the trait. The
//! fallback cascade is a provided method, so an implementation only
//! overrides the sources it actually has.

use async_trait::async_trait;
use log::debug;

use crate::errors::EngineResult;

/// Where the reference price should come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriceMode {
    /// Liquidity-pool quote only
    Pool,
    /// Order-book midpoint, falling back to the latest trade
    Market,
    /// Pool, then market, then depth-weighted open orders
    #[default]
    Auto,
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Instantaneous pool exchange rate, if a pool exists for the pair.
    async fn pool_price(&self, _base: &str, _quote: &str) -> EngineResult<Option<f64>> {
        Ok(None)
    }

    /// Best bid and ask from the order book.
    async fn best_bid_ask(&self, _base: &str, _quote: &str) -> EngineResult<Option<(f64, f64)>> {
        Ok(None)
    }

    /// Most recent trade price.
    async fn last_trade_price(&self, _base: &str, _quote: &str) -> EngineResult<Option<f64>> {
        Ok(None)
    }

    /// Open limit orders as (price, size) points for weighted aggregation.
    async fn open_order_depth(&self, _base: &str, _quote: &str) -> EngineResult<Vec<(f64, f64)>> {
        Ok(Vec::new())
    }

    /// Derive a reference price for the pair.
    ///
    /// `Auto` cascades: pool quote, then book midpoint, then the latest
    /// trade, then a size-weighted average over open limit orders. Returns
    /// `None` when every source comes up empty.
    async fn derive_price(
        &self,
        base: &str,
        quote: &str,
        mode: PriceMode,
    ) -> EngineResult<Option<f64>> {
        if matches!(mode, PriceMode::Pool | PriceMode::Auto) {
            if let Some(price) = self.pool_price(base, quote).await? {
                debug!("pool price for {}/{}: {}", base, quote, price);
                return Ok(Some(price));
            }
            if mode == PriceMode::Pool {
                return Ok(None);
            }
        }

        if let Some((bid, ask)) = self.best_bid_ask(base, quote).await? {
            if bid > 0.0 && ask > 0.0 {
                return Ok(Some((bid + ask) / 2.0));
            }
        }
        if let Some(price) = self.last_trade_price(base, quote).await? {
            return Ok(Some(price));
        }
        if mode == PriceMode::Market {
            return Ok(None);
        }

        let depth = self.open_order_depth(base, quote).await?;
        let total_size: f64 = depth.iter().map(|(_, s)| s).sum();
        if total_size > 0.0 {
            let weighted =
                depth.iter().map(|(p, s)| p * s).sum::<f64>() / total_size;
            debug!("depth-weighted price for {}/{}: {}", base, quote, weighted);
            return Ok(Some(weighted));
        }
        Ok(None)
    }
}

/// Fixed-price oracle for dry runs and tests.
pub struct StaticOracle {
    price: f64,
}

impl StaticOracle {
    pub fn new(price: f64) -> Self {
        Self { price }
    }
}

#[async_trait]
impl PriceOracle for StaticOracle {
    async fn pool_price(&self, _base: &str, _quote: &str) -> EngineResult<Option<f64>> {
        Ok(Some(self.price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct ScriptedOracle {
        pool: Option<f64>,
        bid_ask: Option<(f64, f64)>,
        last: Option<f64>,
        depth: Vec<(f64, f64)>,
    }

    #[async_trait]
    impl PriceOracle for ScriptedOracle {
        async fn pool_price(&self, _b: &str, _q: &str) -> EngineResult<Option<f64>> {
            Ok(self.pool)
        }
        async fn best_bid_ask(&self, _b: &str, _q: &str) -> EngineResult<Option<(f64, f64)>> {
            Ok(self.bid_ask)
        }
        async fn last_trade_price(&self, _b: &str, _q: &str) -> EngineResult<Option<f64>> {
            Ok(self.last)
        }
        async fn open_order_depth(&self, _b: &str, _q: &str) -> EngineResult<Vec<(f64, f64)>> {
            Ok(self.depth.clone())
        }
    }

    #[tokio::test]
    async fn test_pool_wins_in_auto() {
        let oracle = ScriptedOracle {
            pool: Some(1.5),
            bid_ask: Some((1.0, 2.0)),
            ..Default::default()
        };
        let price = oracle.derive_price("GOLD", "USD", PriceMode::Auto).await.unwrap();
        assert_eq!(price, Some(1.5));
    }

    #[tokio::test]
    async fn test_market_midpoint() {
        let oracle = ScriptedOracle {
            bid_ask: Some((1.0, 2.0)),
            last: Some(9.0),
            ..Default::default()
        };
        let price = oracle.derive_price("GOLD", "USD", PriceMode::Market).await.unwrap();
        assert_eq!(price, Some(1.5));
    }

    #[tokio::test]
    async fn test_market_falls_back_to_last_trade() {
        let oracle = ScriptedOracle { last: Some(1.23), ..Default::default() };
        let price = oracle.derive_price("GOLD", "USD", PriceMode::Market).await.unwrap();
        assert_eq!(price, Some(1.23));
    }

    #[tokio::test]
    async fn test_pool_mode_does_not_cascade() {
        let oracle = ScriptedOracle { last: Some(1.23), ..Default::default() };
        let price = oracle.derive_price("GOLD", "USD", PriceMode::Pool).await.unwrap();
        assert_eq!(price, None);
    }

    #[tokio::test]
    async fn test_auto_falls_through_to_weighted_depth() {
        let oracle = ScriptedOracle {
            depth: vec![(1.0, 10.0), (2.0, 30.0)],
            ..Default::default()
        };
        let price = oracle.derive_price("GOLD", "USD", PriceMode::Auto).await.unwrap();
        // (1*10 + 2*30) / 40
        assert_eq!(price, Some(1.75));
    }

    #[tokio::test]
    async fn test_every_source_empty_is_none() {
        let oracle = ScriptedOracle::default();
        let price = oracle.derive_price("GOLD", "USD", PriceMode::Auto).await.unwrap();
        assert_eq!(price, None);
    }
}
