//! Core data types for the factor backtester.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One row of the input dataset: an entity observed on a trading date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub symbol: String,
    pub date: NaiveDate,
    pub close: f64,
    pub volume: f64,
    pub market_cap: f64,
    /// Strategy-specific auxiliary columns (funding rate, open interest, ...).
    #[serde(default)]
    pub aux: BTreeMap<String, f64>,
}

impl Observation {
    /// Create a new observation without auxiliary columns.
    pub fn new(
        symbol: impl Into<String>,
        date: NaiveDate,
        close: f64,
        volume: f64,
        market_cap: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            date,
            close,
            volume,
            market_cap,
            aux: BTreeMap::new(),
        }
    }

    /// Attach an auxiliary column value.
    pub fn with_aux(mut self, column: impl Into<String>, value: f64) -> Self {
        self.aux.insert(column.into(), value);
        self
    }

    /// Look up an auxiliary column.
    pub fn aux_value(&self, column: &str) -> Option<f64> {
        self.aux.get(column).copied()
    }

    /// A price usable for return computation.
    pub fn has_valid_price(&self) -> bool {
        self.close.is_finite() && self.close > 0.0
    }
}

/// A factor statistic for one entity on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorValue {
    pub symbol: String,
    pub date: NaiveDate,
    pub factor_name: String,
    /// `None` when the trailing window is incomplete.
    pub value: Option<f64>,
}

impl FactorValue {
    /// Defined (finite) value, if any.
    pub fn defined(&self) -> Option<f64> {
        self.value.filter(|v| v.is_finite())
    }
}

/// Cross-sectional bucket membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Long,
    Short,
    Neutral,
}

impl Bucket {
    /// Sign applied to a position magnitude in this bucket.
    pub fn sign(&self) -> f64 {
        match self {
            Bucket::Long => 1.0,
            Bucket::Short => -1.0,
            Bucket::Neutral => 0.0,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::Long => write!(f, "long"),
            Bucket::Short => write!(f, "short"),
            Bucket::Neutral => write!(f, "neutral"),
        }
    }
}

/// Ranked bucket assignment of an entity for one strategy and date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub date: NaiveDate,
    pub strategy_id: String,
    pub bucket: Bucket,
    /// Ordinal percentile rank in (0, 1].
    pub percentile_rank: f64,
    pub factor_value: f64,
}

/// Simulation state of a strategy on one date.
///
/// A strategy waits until its first date with full factor history, then
/// alternates between rebalancing on scheduled dates and holding in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationState {
    #[default]
    AwaitingStart,
    Holding,
    Rebalancing,
}

/// Positions held by a strategy on a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub strategy_id: String,
    pub date: NaiveDate,
    /// Signed weights, ordered by symbol.
    pub positions: BTreeMap<String, f64>,
    pub is_rebalance_date: bool,
    #[serde(default)]
    pub state: SimulationState,
}

impl PortfolioState {
    /// A flat (all-cash) state.
    pub fn flat(strategy_id: impl Into<String>, date: NaiveDate, is_rebalance_date: bool) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            date,
            positions: BTreeMap::new(),
            is_rebalance_date,
            state: if is_rebalance_date {
                SimulationState::Rebalancing
            } else {
                SimulationState::Holding
            },
        }
    }

    /// Sum of positive weights.
    pub fn long_exposure(&self) -> f64 {
        self.positions.values().filter(|w| **w > 0.0).sum()
    }

    /// Sum of absolute negative weights.
    pub fn short_exposure(&self) -> f64 {
        self.positions.values().filter(|w| **w < 0.0).map(|w| -w).sum()
    }

    pub fn gross_exposure(&self) -> f64 {
        self.long_exposure() + self.short_exposure()
    }

    pub fn net_exposure(&self) -> f64 {
        self.long_exposure() - self.short_exposure()
    }

    pub fn long_count(&self) -> usize {
        self.positions.values().filter(|w| **w > 0.0).count()
    }

    pub fn short_count(&self) -> usize {
        self.positions.values().filter(|w| **w < 0.0).count()
    }

    /// Whether the strategy holds any position.
    pub fn is_invested(&self) -> bool {
        self.positions.values().any(|w| w.abs() > 0.0)
    }
}

/// One point of a strategy's equity curve.
///
/// `daily_return` is the return realized from `date` to the next trading
/// date on the weights held at `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub strategy_id: String,
    pub date: NaiveDate,
    pub daily_return: f64,
    pub equity_value: f64,
    pub running_peak: f64,
    /// Fractional decline from the running peak, in [0, 1].
    pub drawdown: f64,
    pub long_exposure: f64,
    pub short_exposure: f64,
    pub long_count: usize,
    pub short_count: usize,
}

impl PerformanceRecord {
    pub fn gross_exposure(&self) -> f64 {
        self.long_exposure + self.short_exposure
    }

    pub fn net_exposure(&self) -> f64 {
        self.long_exposure - self.short_exposure
    }
}

/// A single position committed at a rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub symbol: String,
    pub bucket: Bucket,
    pub factor_value: f64,
    pub percentile_rank: f64,
    pub weight: f64,
}

/// Outcome of one scheduled rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecord {
    pub strategy_id: String,
    pub date: NaiveDate,
    /// Regime label at the rebalance date (`bull`, `bear`, `undetermined`).
    pub regime: String,
    /// False when the regime filter gated the strategy or no entity was eligible.
    pub active: bool,
    /// Number of entities with a defined factor value that passed eligibility.
    pub eligible: usize,
    /// One-way turnover relative to the previous positions.
    pub turnover: f64,
    pub positions: Vec<PositionRecord>,
}
