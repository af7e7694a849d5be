//! Boundary-crawl strategy: allocation, rebalance planning, divergence

mod allocation;
mod divergence;
mod rebalance;

pub use allocation::{allocate_by_weights, cap_growth, MAX_WEIGHT, MIN_WEIGHT};
pub use divergence::{measure_divergence, plan_size_corrections, DivergenceReport, SizeCorrection};
pub use rebalance::{
    BoundaryState, PlanAction, RebalancePlan, RebalancePlanner, StrategySettings,
};
