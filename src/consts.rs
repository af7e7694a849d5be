//! Engine tunables

use std::time::Duration;

/// Cooperative per-slot locks expire after this long without a refresh.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Pacing delay between size-correction submissions.
pub const SYNC_DELAY: Duration = Duration::from_millis(500);

/// Per-call timeout for balance queries against the gateway.
pub const ACCOUNT_TOTALS_TIMEOUT: Duration = Duration::from_millis(10_000);

/// The spread band is never narrower than this many grid increments.
pub const MIN_SPREAD_FACTOR: f64 = 2.0;

/// A partial below this percentage of its geometric ideal counts as dust.
pub const PARTIAL_DUST_THRESHOLD_PERCENTAGE: f64 = 30.0;

/// Cache-ratio trigger for per-side size corrections, as an RMS percentage.
pub const GRID_REGENERATION_PERCENTAGE: f64 = 3.0;

/// Hard RMS divergence trigger for per-side size corrections.
pub const RMS_PERCENTAGE: f64 = 14.3;

/// Headroom multiplier applied to the creation-fee budget so rotations and
/// in-place updates stay funded.
pub const CREATION_FEE_MULTIPLIER: f64 = 2.0;

/// Fallback price tolerance when order sizes are missing, as a percentage.
pub const PRICE_TOLERANCE_FALLBACK_PERCENT: f64 = 0.1;

/// A consolidated partial may exceed its ideal size by at most this factor
/// before the residual is split into its own order.
pub const DOUBLE_ORDER_MERGE_FACTOR: f64 = 1.05;

/// Attempts for transient gateway failures before an operation is dropped.
pub const MAX_RPC_RETRIES: u32 = 3;

/// Base delay for exponential backoff on gateway retries.
pub const RPC_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Maximum in-flight chain operations while dispatching a plan.
pub const DISPATCH_CONCURRENCY: usize = 4;
