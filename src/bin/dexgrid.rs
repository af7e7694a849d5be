//! Grid engine binary
//!
//! Runs one grid bot from a configuration file. Without a live gateway
//! implementation wired in, the engine runs against the built-in paper
//! gateway, which simulates balances and order placement in memory.
//!
//! ```bash
//! cargo run --bin dexgrid -- --config config.json
//! ```
//!
//! Environment overrides use the `DEXGRID_` prefix, e.g.
//! `DEXGRID_DRYRUN=true`. A `.env` file in the working directory is
//! loaded automatically.

use std::env;
use std::sync::Arc;

use log::{error, info};

use dexgrid::fees::{AssetInfo, FeeSchedule};
use dexgrid::{BotConfig, Coordinator, PaperGateway, StaticOracle};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match dotenvy::dotenv() {
        Ok(path) => info!("loaded environment from {}", path.display()),
        Err(_) => info!("no .env file, using system environment"),
    }

    let args: Vec<String> = env::args().collect();
    let config = if args.len() > 2 && args[1] == "--config" {
        match BotConfig::load(&args[2]) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config: {}", e);
                return;
            }
        }
    } else {
        info!("no config file provided, using the example configuration");
        example_config()
    };

    info!(
        "starting grid for {}/{} ({} buys / {} sells targeted)",
        config.asset_a, config.asset_b, config.active_orders.buy, config.active_orders.sell
    );

    // Paper setup: a simulated chain seeded with balances. A live
    // deployment substitutes its own ChainGateway implementation here.
    let gateway = Arc::new(PaperGateway::new(example_assets(&config), example_fees()));
    gateway.fund("1.3.106", 100_000_000).await;
    gateway.fund("1.3.121", 100_000_000).await;

    let oracle: Arc<dyn dexgrid::PriceOracle> = Arc::new(StaticOracle::new(1.0));
    let mut coordinator =
        match Coordinator::bootstrap(config, gateway, oracle.as_ref()).await {
            Ok(coordinator) => coordinator,
            Err(e) => {
                error!("startup failed: {}", e);
                return;
            }
        };

    match coordinator.run(oracle).await {
        Ok(()) => info!("grid engine stopped"),
        Err(e) => error!("grid engine error: {}", e),
    }
}

fn example_config() -> BotConfig {
    serde_json::from_str(
        r#"{
            "account": "grid-maker",
            "assetA": "GOLD",
            "assetB": "USD",
            "startPrice": 1.0,
            "minPrice": "2x",
            "maxPrice": "2x",
            "incrementPercent": 5.0,
            "targetSpreadPercent": 10.0,
            "botFunds": { "buy": 500.0, "sell": 500.0 },
            "activeOrders": { "buy": 3, "sell": 3 },
            "dryRun": false
        }"#,
    )
    .expect("example config is valid")
}

fn example_assets(config: &BotConfig) -> Vec<AssetInfo> {
    let asset = |symbol: &str, id: &str| AssetInfo {
        id: id.into(),
        symbol: symbol.into(),
        precision: 5,
        market_fee_percent: 0.1,
        taker_fee_percent: None,
        max_market_fee: f64::MAX,
    };
    vec![
        asset(&config.fee_asset, "1.3.0"),
        asset(&config.asset_a, "1.3.106"),
        asset(&config.asset_b, "1.3.121"),
    ]
}

fn example_fees() -> FeeSchedule {
    FeeSchedule {
        create_limit_order: 48,
        cancel_limit_order: 1,
        update_limit_order: 24,
    }
}
