//! Per-strategy backtest simulation.
//!
//! Each strategy walks the trading-date index in order and moves through
//! the simulation states below:
//!
//! - `AwaitingStart` until its first active date (enough history for the
//!   factor window),
//! - `Rebalancing` on scheduled dates, where new weights are computed from
//!   data visible at that date,
//! - `Holding` otherwise, where the previous weights are carried forward
//!   unchanged.
//!
//! The return recorded at date `t` is realized from `t` to `t + 1` on the
//! weights held at `t`, so the last date of the range produces no record.

use crate::analytics::PerformanceMetrics;
use crate::data::{forward_return, Panel, PanelView};
use crate::error::{FactorError, Result, Warning};
use crate::factors::{compute_at, eligible_values, rank};
use crate::regime::{Regime, RegimeSeries};
use crate::schedule::RebalanceSchedule;
use crate::strategy::StrategyConfig;
use crate::types::{PerformanceRecord, PortfolioState, RebalanceRecord, Signal, SimulationState};
use crate::weighting::{construct_portfolio, turnover};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// How daily returns accumulate into equity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EquityMode {
    /// `equity *= 1 + r`
    #[default]
    Compound,
    /// `equity += initial_capital * r`
    Additive,
}

impl EquityMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "compound" | "multiplicative" => Some(EquityMode::Compound),
            "additive" | "simple" => Some(EquityMode::Additive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EquityMode::Compound => "compound",
            EquityMode::Additive => "additive",
        }
    }

    /// Equity after one period's return.
    pub fn apply(&self, equity: f64, initial_capital: f64, daily_return: f64) -> f64 {
        match self {
            EquityMode::Compound => equity * (1.0 + daily_return),
            EquityMode::Additive => equity + initial_capital * daily_return,
        }
    }
}

/// Configuration shared by every strategy of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    /// First trading date simulated (inclusive).
    pub start_date: Option<NaiveDate>,
    /// Last trading date of the range (inclusive).
    pub end_date: Option<NaiveDate>,
    pub equity_mode: EquityMode,
    /// Annualization factor for metrics.
    pub periods_per_year: f64,
    /// Annual risk-free rate used by Sharpe and Sortino.
    pub risk_free_rate: f64,
    /// Show a progress bar for multi-strategy runs and sweeps.
    pub show_progress: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            start_date: None,
            end_date: None,
            equity_mode: EquityMode::Compound,
            periods_per_year: 365.0,
            risk_free_rate: 0.0,
            show_progress: false,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(FactorError::config(
                "backtest.initial_capital",
                "must be a positive number",
            ));
        }
        if !(self.periods_per_year.is_finite() && self.periods_per_year > 0.0) {
            return Err(FactorError::config(
                "backtest.periods_per_year",
                "must be a positive number",
            ));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(FactorError::config(
                    "backtest.start_date",
                    format!("{} is after end_date {}", start, end),
                ));
            }
        }
        Ok(())
    }
}

/// Everything a strategy run reads: the materialized panel, the regime
/// series aligned with it and the date range to simulate.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub panel: &'a Panel,
    pub regimes: &'a RegimeSeries,
    pub config: &'a BacktestConfig,
    /// First simulated date index.
    pub start_idx: usize,
    /// Last date index of the range; no return is recorded on it.
    pub end_idx: usize,
}

impl<'a> RunContext<'a> {
    /// Resolve the configured date range against the panel.
    pub fn new(panel: &'a Panel, regimes: &'a RegimeSeries, config: &'a BacktestConfig) -> Result<Self> {
        config.validate()?;
        if panel.is_empty() {
            return Err(FactorError::NoData);
        }
        let start_idx = match config.start_date {
            Some(d) => panel.first_index_on_or_after(d),
            None => Some(0),
        };
        let end_idx = match config.end_date {
            Some(d) => panel.last_index_on_or_before(d),
            None => Some(panel.len() - 1),
        };
        let (start_idx, end_idx) = match (start_idx, end_idx) {
            (Some(s), Some(e)) if s < e => (s, e),
            _ => {
                return Err(FactorError::Data(
                    "date range must cover at least two trading dates".to_string(),
                ))
            }
        };
        if regimes.len() != panel.len() {
            return Err(FactorError::Data(format!(
                "regime series has {} dates, panel has {}",
                regimes.len(),
                panel.len()
            )));
        }
        Ok(Self {
            panel,
            regimes,
            config,
            start_idx,
            end_idx,
        })
    }

    /// Date indices with a recorded return.
    pub fn simulated_indices(&self) -> std::ops::Range<usize> {
        self.start_idx..self.end_idx
    }

    pub fn date(&self, idx: usize) -> NaiveDate {
        self.panel.dates()[idx]
    }
}

/// Complete output of one strategy's simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRun {
    pub strategy_id: String,
    pub config: StrategyConfig,
    /// One record per simulated date.
    pub records: Vec<PerformanceRecord>,
    /// Positions held on each simulated date, aligned with `records`.
    pub states: Vec<PortfolioState>,
    pub rebalances: Vec<RebalanceRecord>,
    /// Ranked signals of every rebalance, in date then rank order.
    pub signals: Vec<Signal>,
    pub warnings: Vec<Warning>,
    pub metrics: PerformanceMetrics,
}

impl StrategyRun {
    pub fn returns(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.daily_return).collect()
    }

    pub fn equity_curve(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.equity_value).collect()
    }

    pub fn final_equity(&self) -> Option<f64> {
        self.records.last().map(|r| r.equity_value)
    }

    /// Whether the strategy holds a position at the i-th simulated date.
    pub fn is_active_at(&self, i: usize) -> bool {
        self.states.get(i).is_some_and(|s| s.is_invested())
    }

    pub fn is_rebalance_at(&self, i: usize) -> bool {
        self.states.get(i).is_some_and(|s| s.is_rebalance_date)
    }
}

/// Outcome of a single rebalance.
#[derive(Debug, Clone)]
pub struct RebalanceOutcome {
    pub positions: BTreeMap<String, f64>,
    pub record: RebalanceRecord,
    pub signals: Vec<Signal>,
    pub warnings: Vec<Warning>,
}

/// Runs one strategy over a [`RunContext`].
#[derive(Debug, Clone)]
pub struct StrategyBacktester {
    config: StrategyConfig,
}

impl StrategyBacktester {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Rebalance schedule for the context's date range.
    pub fn schedule(&self, ctx: &RunContext<'_>) -> RebalanceSchedule {
        RebalanceSchedule::new(
            self.config.rebalance_period_days,
            self.config.first_active_index(ctx.start_idx),
        )
    }

    /// Ranked signals at date index `t`, excluding `excluded` symbols.
    ///
    /// Reads only observations dated at or before `t`.
    pub fn signals_at(&self, panel: &Panel, t: usize, excluded: &BTreeSet<String>) -> Vec<Signal> {
        self.rank_view(&panel.as_of(t), excluded).1
    }

    /// Factor values defined in the view, and the ranked eligible signals.
    fn rank_view(&self, view: &PanelView<'_>, excluded: &BTreeSet<String>) -> (usize, Vec<Signal>) {
        let values = compute_at(view, self.config.window, &self.config.factor);
        let defined = values.iter().filter(|v| v.defined().is_some()).count();
        let eligible = eligible_values(view, values, &self.config.eligibility(), excluded);
        let signals = rank(
            &self.config.id,
            &eligible,
            self.config.long_percentile,
            self.config.short_percentile,
        );
        (defined, signals)
    }

    /// Compute new positions at date index `t`.
    pub fn rebalance(
        &self,
        ctx: &RunContext<'_>,
        t: usize,
        excluded: &BTreeSet<String>,
        previous: &BTreeMap<String, f64>,
    ) -> RebalanceOutcome {
        let date = ctx.date(t);
        let regime = ctx.regimes.regime_at(t);
        let mut warnings = Vec::new();
        let mut signals = Vec::new();
        let mut positions = BTreeMap::new();
        let mut records = Vec::new();

        if !self.config.regime_filter.allows(regime) {
            if regime == Regime::Undetermined {
                if let Some(w) = ctx.regimes.undetermined_warning(t) {
                    warn!("{}: {}", self.config.id, w);
                    warnings.push(w);
                }
            }
            debug!(
                "{} gated by {} filter on {} ({})",
                self.config.id,
                self.config.regime_filter.as_str(),
                date,
                regime
            );
        } else {
            let view = ctx.panel.as_of(t);
            let (defined, ranked) = self.rank_view(&view, excluded);

            if ranked.is_empty() {
                if defined == 0 {
                    let w = Warning::InsufficientHistory {
                        strategy_id: self.config.id.clone(),
                        date,
                        window: self.config.window,
                    };
                    warn!("{}", w);
                    warnings.push(w);
                } else {
                    debug!("{}: no eligible entities on {}, holding flat", self.config.id, date);
                }
            } else {
                signals = ranked;
                let built = construct_portfolio(&view, &signals, &self.config.weighting_params());
                positions = built.positions;
                records = built.records;
            }
        }

        let eligible = signals.len();
        let record = RebalanceRecord {
            strategy_id: self.config.id.clone(),
            date,
            regime: regime.to_string(),
            active: !positions.is_empty(),
            eligible,
            turnover: turnover(previous, &positions),
            positions: records,
        };

        RebalanceOutcome {
            positions,
            record,
            signals,
            warnings,
        }
    }

    /// Simulate the strategy over the context's date range.
    pub fn run(&self, ctx: &RunContext<'_>) -> Result<StrategyRun> {
        self.config.validate()?;
        let schedule = self.schedule(ctx);
        let bt = ctx.config;

        info!(
            "Running {} ({}, window {}, every {} dates) from {} to {}",
            self.config.id,
            self.config.factor,
            self.config.window,
            self.config.rebalance_period_days,
            ctx.date(ctx.start_idx),
            ctx.date(ctx.end_idx)
        );

        let capacity = ctx.end_idx - ctx.start_idx;
        let mut records = Vec::with_capacity(capacity);
        let mut states = Vec::with_capacity(capacity);
        let mut rebalances = Vec::new();
        let mut signals = Vec::new();
        let mut warnings = Vec::new();

        let mut state = SimulationState::AwaitingStart;
        let mut positions: BTreeMap<String, f64> = BTreeMap::new();
        let mut excluded: BTreeSet<String> = BTreeSet::new();
        let mut equity = bt.initial_capital;
        let mut peak = bt.initial_capital;

        for t in ctx.simulated_indices() {
            let date = ctx.date(t);
            let is_rebalance = schedule.is_rebalance_date(t);

            state = if is_rebalance {
                SimulationState::Rebalancing
            } else if state == SimulationState::AwaitingStart {
                SimulationState::AwaitingStart
            } else {
                SimulationState::Holding
            };

            if is_rebalance {
                let outcome = self.rebalance(ctx, t, &excluded, &positions);
                positions = outcome.positions;
                rebalances.push(outcome.record);
                signals.extend(outcome.signals);
                warnings.extend(outcome.warnings);
            }

            let mut daily_return = 0.0;
            for (symbol, weight) in &positions {
                match forward_return(ctx.panel, symbol, t) {
                    Some(r) => daily_return += weight * r,
                    None => {
                        if excluded.insert(symbol.clone()) {
                            let w = Warning::MissingForwardReturn {
                                strategy_id: self.config.id.clone(),
                                symbol: symbol.clone(),
                                date,
                            };
                            warn!("{}", w);
                            warnings.push(w);
                        } else {
                            debug!("{}: {} still missing on {}", self.config.id, symbol, date);
                        }
                    }
                }
            }

            equity = bt.equity_mode.apply(equity, bt.initial_capital, daily_return);
            peak = peak.max(equity);
            let drawdown = if peak > 0.0 {
                ((peak - equity) / peak).clamp(0.0, 1.0)
            } else {
                0.0
            };

            let held = PortfolioState {
                strategy_id: self.config.id.clone(),
                date,
                positions: positions.clone(),
                is_rebalance_date: is_rebalance,
                state,
            };
            records.push(PerformanceRecord {
                strategy_id: self.config.id.clone(),
                date,
                daily_return,
                equity_value: equity,
                running_peak: peak,
                drawdown,
                long_exposure: held.long_exposure(),
                short_exposure: held.short_exposure(),
                long_count: held.long_count(),
                short_count: held.short_count(),
            });
            states.push(held);
        }

        let metrics = PerformanceMetrics::from_records(&records, bt);
        info!(
            "{} complete: {:.2}% return, {:.2}% max DD, {:.2} Sharpe, {} rebalances",
            self.config.id,
            metrics.total_return_pct,
            metrics.max_drawdown_pct,
            metrics.sharpe_ratio,
            rebalances.len()
        );

        Ok(StrategyRun {
            strategy_id: self.config.id.clone(),
            config: self.config.clone(),
            records,
            states,
            rebalances,
            signals,
            warnings,
            metrics,
        })
    }
}
