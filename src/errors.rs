//! Engine-wide error types

use thiserror::Error;

/// Errors surfaced by the grid engine
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Amount overflows chain integer range: {value} at precision {precision}")]
    Overflow { value: f64, precision: u32 },

    #[error("Insufficient funds on {side} side: need {needed}, free {free} ({reason})")]
    InsufficientFunds {
        side: &'static str,
        needed: f64,
        free: f64,
        reason: String,
    },

    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    #[error("Chain order not found: {0}")]
    OrderNotFound(String),

    #[error("Asset lookup failed: {0}")]
    AssetLookupMissing(String),

    #[error("Chain RPC error: {0}")]
    ChainRpc(String),

    #[error("Unparseable chain order {order_id}: {reason}")]
    OrderParse { order_id: String, reason: String },

    #[error("Slot {0} is locked by another operation")]
    LockHeld(String),

    #[error("State persistence error: {0}")]
    Persistence(String),

    #[error("Price oracle returned no price for {base}/{quote}")]
    NoPrice { base: String, quote: String },

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl EngineError {
    /// Transient errors are retried with backoff; everything else is
    /// handled at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::ChainRpc(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Json(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;
