#![deny(unreachable_pub)]
//! Market-making grid engine for on-chain limit-order exchanges.
//!
//! The engine maintains a geometrically-spaced ladder of buy and sell
//! orders around a reference price, rotating and resizing them as fills
//! arrive, with integer-precision fund accounting reconciled against the
//! authoritative chain state through an abstract [`gateway::ChainGateway`].

pub mod config;
pub mod consts;
pub mod coordinator;
pub mod errors;
pub mod fees;
pub mod funds;
pub mod gateway;
pub mod ladder;
pub mod oracle;
pub mod order;
pub mod persist;
pub mod precision;
pub mod strategy;
pub mod sync;

pub use config::BotConfig;
pub use coordinator::{Coordinator, EngineEvent};
pub use errors::{EngineError, EngineResult};
pub use gateway::{ChainGateway, PaperGateway};
pub use oracle::{PriceMode, PriceOracle, StaticOracle};
