//! crossfactor - cross-sectional factor backtesting for multi-strategy portfolios.
//!
//! # Overview
//!
//! A run takes a fully materialized panel of daily observations (one row per
//! entity and trading date) and a set of factor strategies, then:
//!
//! - **Ranks** entities each rebalance date by a trailing-window factor and
//!   splits them into long and short percentile buckets
//! - **Gates** strategies on a bull/bear regime read from a reference
//!   entity's moving averages
//! - **Weights** each bucket equally or by inverse volatility
//! - **Simulates** each strategy independently (in parallel) with no
//!   lookahead, tracking equity, drawdown and exposures
//! - **Reallocates** the capital of inactive flexible strategies to active
//!   ones at every rebalance barrier
//! - **Optimizes** capital weights across strategies with a constrained
//!   mean-variance solve
//!
//! # Quick Start
//!
//! ```no_run
//! use crossfactor::{
//!     data::{load_panel, DataConfig},
//!     engine::BacktestConfig,
//!     portfolio::MultiStrategyEngine,
//!     regime::RegimeConfig,
//!     strategy::StrategyVariant,
//! };
//!
//! let panel = load_panel("data/universe.csv", &DataConfig::default()).unwrap();
//!
//! let mut momentum = StrategyVariant::Momentum.defaults();
//! momentum.capital_weight = 0.6;
//! let mut carry = StrategyVariant::FundingCarry.defaults();
//! carry.capital_weight = 0.4;
//!
//! let engine = MultiStrategyEngine::new(
//!     BacktestConfig::default(),
//!     RegimeConfig::default(),
//!     vec![momentum, carry],
//! );
//! let result = engine.run(&panel).unwrap();
//!
//! println!("Return: {:.2}%", result.metrics.total_return_pct);
//! println!("Sharpe: {:.2}", result.metrics.sharpe_ratio);
//! ```
//!
//! # Modules
//!
//! - [`types`]: Core data types (Observation, Signal, PortfolioState, records)
//! - [`data`]: Panel storage, causal views and CSV loading
//! - [`factors`]: Factor library, ranking and eligibility
//! - [`regime`]: Regime detection and statistics
//! - [`weighting`]: Bucket weighting and portfolio construction
//! - [`schedule`]: Rebalance calendars
//! - [`strategy`]: Strategy variants and configuration
//! - [`engine`]: Single-strategy backtest simulation
//! - [`allocation`]: Capital reallocation across strategies
//! - [`portfolio`]: Multi-strategy runs and combined equity
//! - [`optimizer`]: Mean-variance allocation across strategies
//! - [`analytics`]: Performance metrics and reporting
//! - [`export`]: Atomic artifact publication
//! - [`metadata`]: Reproducibility hashing
//! - [`config`]: TOML configuration file support
//! - [`sweep`]: Parallel parameter sweeps

pub mod allocation;
pub mod analytics;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod export;
pub mod factors;
pub mod metadata;
pub mod optimizer;
pub mod portfolio;
pub mod regime;
pub mod schedule;
pub mod strategy;
pub mod sweep;
pub mod types;
pub mod weighting;

// Re-exports for convenience
pub use allocation::{reallocate, AllocationPlan, CapitalSlot};
pub use analytics::{max_drawdown, PerformanceMetrics, ResultFormatter};
pub use config::RunFileConfig;
pub use data::{load_panel, DataConfig, Panel, PanelView};
pub use engine::{BacktestConfig, EquityMode, RunContext, StrategyBacktester, StrategyRun};
pub use error::{FactorError, Result, Warning};
pub use export::ArtifactWriter;
pub use factors::FactorKind;
pub use optimizer::{MeanVarianceOptimizer, OptimizationResult, OptimizerConfig, StrategyReturnMatrix};
pub use portfolio::{CombinedResult, MultiStrategyEngine};
pub use regime::{Regime, RegimeConfig, RegimeDetector, RegimeFilter, RegimeState};
pub use schedule::{is_rebalance_date, RebalanceSchedule};
pub use strategy::{StrategyConfig, StrategyVariant};
pub use sweep::{ParameterSweep, SweepGrid, SweepReport};
pub use types::{
    Bucket, FactorValue, Observation, PerformanceRecord, PortfolioState, Signal, SimulationState,
};
pub use weighting::{construct_portfolio, weight, WeightingMethod};
