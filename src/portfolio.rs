//! Multi-strategy portfolio simulation.
//!
//! Strategies are simulated independently and in parallel over the same
//! [`RunContext`]. Their results are then joined date by date. On every date
//! where at least one strategy rebalances (and on the first date) the
//! capital reallocation engine runs on the strategies' activity flags; in
//! between, the last allocation plan is carried forward. The combined return
//! is the capital-weighted sum of the strategy returns.

use crate::allocation::{reallocate, AllocationPlan};
use crate::analytics::PerformanceMetrics;
use crate::data::Panel;
use crate::engine::{BacktestConfig, RunContext, StrategyBacktester, StrategyRun};
use crate::error::{FactorError, Result, Warning};
use crate::regime::{RegimeConfig, RegimeDetector, RegimeSeries, RegimeStats};
use crate::strategy::StrategyConfig;
use crate::types::PerformanceRecord;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Identifier of the combined portfolio in records and artifacts.
pub const PORTFOLIO_ID: &str = "portfolio";

/// Result of a multi-strategy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedResult {
    /// Strategy runs ordered by id.
    pub runs: Vec<StrategyRun>,
    /// Allocation plan in effect on each simulated date.
    pub plans: Vec<AllocationPlan>,
    /// Combined equity curve.
    pub records: Vec<PerformanceRecord>,
    pub regimes: RegimeSeries,
    pub regime_stats: RegimeStats,
    pub metrics: PerformanceMetrics,
    /// Strategy warnings in id order, then allocation warnings in date order.
    pub warnings: Vec<Warning>,
}

impl CombinedResult {
    pub fn run(&self, strategy_id: &str) -> Option<&StrategyRun> {
        self.runs.iter().find(|r| r.strategy_id == strategy_id)
    }

    pub fn returns(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.daily_return).collect()
    }

    pub fn final_equity(&self) -> Option<f64> {
        self.records.last().map(|r| r.equity_value)
    }

    /// Mean utilization across simulated dates.
    pub fn average_utilization(&self) -> f64 {
        if self.plans.is_empty() {
            return 0.0;
        }
        self.plans.iter().map(|p| p.utilization).sum::<f64>() / self.plans.len() as f64
    }
}

/// Runs a set of strategies as one capital-weighted portfolio.
#[derive(Debug, Clone, Serialize)]
pub struct MultiStrategyEngine {
    config: BacktestConfig,
    regime: RegimeConfig,
    strategies: Vec<StrategyConfig>,
}

impl MultiStrategyEngine {
    pub fn new(config: BacktestConfig, regime: RegimeConfig, strategies: Vec<StrategyConfig>) -> Self {
        Self {
            config,
            regime,
            strategies,
        }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn regime(&self) -> &RegimeConfig {
        &self.regime
    }

    pub fn strategies(&self) -> &[StrategyConfig] {
        &self.strategies
    }

    /// Validate the strategy set before any simulation.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.strategies.is_empty() {
            return Err(FactorError::config("strategies", "at least one strategy is required"));
        }
        if self.regime.short_window == 0 || self.regime.short_window >= self.regime.long_window {
            return Err(FactorError::config(
                "regime.short_window",
                format!(
                    "must be positive and below long_window ({} >= {})",
                    self.regime.short_window, self.regime.long_window
                ),
            ));
        }
        let mut ids = BTreeSet::new();
        for strategy in &self.strategies {
            strategy.validate()?;
            if !ids.insert(strategy.id.as_str()) {
                return Err(FactorError::config(
                    format!("strategies[{}].id", strategy.id),
                    "duplicate strategy id",
                ));
            }
        }
        let total: f64 = self.strategies.iter().map(|s| s.capital_weight).sum();
        if (total - 1.0).abs() > 1e-9 {
            return Err(FactorError::config(
                "strategies.capital_weight",
                format!("capital weights must sum to 1.0 (got {:.6})", total),
            ));
        }
        Ok(())
    }

    /// Simulate every strategy and combine them.
    pub fn run(&self, panel: &Panel) -> Result<CombinedResult> {
        self.validate()?;
        let regimes = RegimeDetector::new(self.regime.clone()).detect_series(panel);
        let ctx = RunContext::new(panel, &regimes, &self.config)?;

        info!(
            "Running {} strategies over {} dates ({} symbols)",
            self.strategies.len(),
            ctx.end_idx - ctx.start_idx,
            panel.symbols().len()
        );

        let progress = if self.config.show_progress {
            let pb = ProgressBar::new(self.strategies.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} strategies")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            Some(pb)
        } else {
            None
        };

        let mut runs: Vec<StrategyRun> = self
            .strategies
            .par_iter()
            .map(|strategy| {
                let run = StrategyBacktester::new(strategy.clone()).run(&ctx);
                if let Some(pb) = &progress {
                    pb.inc(1);
                }
                run
            })
            .collect::<Result<Vec<_>>>()?;
        runs.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));

        if let Some(pb) = progress {
            pb.finish_with_message("Strategies complete");
        }

        let (plans, records, allocation_warnings) = self.combine(&ctx, &runs)?;

        let mut warnings: Vec<Warning> = runs.iter().flat_map(|r| r.warnings.clone()).collect();
        warnings.extend(allocation_warnings);

        let metrics = PerformanceMetrics::from_records(&records, &self.config);
        let regime_stats = RegimeStats::from_states(&regimes.states()[ctx.simulated_indices()]);

        info!(
            "Portfolio complete: {:.2}% return, {:.2}% max DD, {:.2} Sharpe, {} warnings",
            metrics.total_return_pct,
            metrics.max_drawdown_pct,
            metrics.sharpe_ratio,
            warnings.len()
        );

        Ok(CombinedResult {
            runs,
            plans,
            records,
            regimes,
            regime_stats,
            metrics,
            warnings,
        })
    }

    /// Join strategy runs through the rebalance barrier.
    fn combine(
        &self,
        ctx: &RunContext<'_>,
        runs: &[StrategyRun],
    ) -> Result<(Vec<AllocationPlan>, Vec<PerformanceRecord>, Vec<Warning>)> {
        let base: BTreeMap<String, f64> = self
            .strategies
            .iter()
            .map(|s| (s.id.clone(), s.capital_weight))
            .collect();
        let flexibility: BTreeMap<String, bool> = self
            .strategies
            .iter()
            .map(|s| (s.id.clone(), s.capital_flexible))
            .collect();

        let n = ctx.end_idx - ctx.start_idx;
        let mut plans: Vec<AllocationPlan> = Vec::with_capacity(n);
        let mut records = Vec::with_capacity(n);
        let mut warnings = Vec::new();

        let initial = self.config.initial_capital;
        let mut equity = initial;
        let mut peak = initial;

        for i in 0..n {
            let date = ctx.date(ctx.start_idx + i);
            let barrier = i == 0 || runs.iter().any(|r| r.is_rebalance_at(i));

            let plan = match plans.last() {
                Some(previous) if !barrier => AllocationPlan {
                    date,
                    warnings: Vec::new(),
                    ..previous.clone()
                },
                _ => {
                    let activity: BTreeMap<String, bool> = runs
                        .iter()
                        .map(|r| (r.strategy_id.clone(), r.is_active_at(i)))
                        .collect();
                    let plan = reallocate(date, &base, &activity, &flexibility)?;
                    debug!("{}: allocation {:?}", date, plan.weights);
                    warnings.extend(plan.warnings.iter().cloned());
                    plan
                }
            };

            let mut daily_return = 0.0;
            let mut long_exposure = 0.0;
            let mut short_exposure = 0.0;
            let mut long_count = 0;
            let mut short_count = 0;
            for run in runs {
                let Some(record) = run.records.get(i) else {
                    continue;
                };
                let w = plan.weight(&run.strategy_id);
                daily_return += w * record.daily_return;
                long_exposure += w * record.long_exposure;
                short_exposure += w * record.short_exposure;
                if w > 0.0 {
                    long_count += record.long_count;
                    short_count += record.short_count;
                }
            }

            equity = self.config.equity_mode.apply(equity, initial, daily_return);
            peak = peak.max(equity);
            let drawdown = if peak > 0.0 {
                ((peak - equity) / peak).clamp(0.0, 1.0)
            } else {
                0.0
            };

            records.push(PerformanceRecord {
                strategy_id: PORTFOLIO_ID.to_string(),
                date,
                daily_return,
                equity_value: equity,
                running_peak: peak,
                drawdown,
                long_exposure,
                short_exposure,
                long_count,
                short_count,
            });
            plans.push(plan);
        }

        Ok((plans, records, warnings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::RegimeFilter;
    use crate::strategy::StrategyVariant;
    use crate::types::Observation;
    use chrono::NaiveDate;

    fn date(i: usize) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64)
    }

    fn panel(n: usize) -> Panel {
        let mut obs = Vec::new();
        for (symbol, g) in [("UP", 0.02), ("FLAT", 0.0), ("DOWN", -0.01)] {
            for i in 0..n {
                let price = 100.0 * (1.0f64 + g).powi(i as i32);
                obs.push(Observation::new(symbol, date(i), price, 1e6, 1e9));
            }
        }
        Panel::from_observations(obs).unwrap()
    }

    fn strategy(id: &str, weight: f64, flexible: bool, filter: RegimeFilter) -> StrategyConfig {
        StrategyConfig {
            id: id.to_string(),
            window: 2,
            rebalance_period_days: 1,
            long_percentile: 0.5,
            short_percentile: 0.5,
            capital_weight: weight,
            capital_flexible: flexible,
            regime_filter: filter,
            ..StrategyVariant::Momentum.defaults()
        }
    }

    #[test]
    fn test_gated_flexible_weight_moves_to_active() {
        let strategies = vec![
            strategy("a", 0.3, true, RegimeFilter::None),
            strategy("b", 0.1, true, RegimeFilter::BullOnly),
            strategy("c", 0.6, false, RegimeFilter::None),
        ];
        let engine = MultiStrategyEngine::new(
            BacktestConfig::default(),
            RegimeConfig::default(),
            strategies,
        );
        let result = engine.run(&panel(10)).unwrap();

        assert_eq!(result.plans.len(), 9);
        for plan in &result.plans[1..] {
            assert!((plan.weight("a") - 0.4).abs() < 1e-12);
            assert_eq!(plan.weight("b"), 0.0);
            assert!((plan.weight("c") - 0.6).abs() < 1e-12);
        }

        let a = result.run("a").unwrap();
        for (i, record) in result.records.iter().enumerate().skip(1) {
            let expected = 0.4 * a.records[i].daily_return + 0.6 * a.records[i].daily_return;
            assert!((record.daily_return - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_plans_sum_to_one_every_date() {
        let strategies = vec![
            strategy("a", 0.5, true, RegimeFilter::BearOnly),
            strategy("b", 0.5, true, RegimeFilter::BullOnly),
        ];
        let engine = MultiStrategyEngine::new(
            BacktestConfig::default(),
            RegimeConfig::default(),
            strategies,
        );
        let result = engine.run(&panel(8)).unwrap();
        for plan in &result.plans {
            assert!((plan.total() - 1.0).abs() < 1e-9);
            assert_eq!(plan.utilization, 0.0);
        }
        assert!(result.records.iter().all(|r| r.daily_return == 0.0));
    }

    #[test]
    fn test_capital_weights_must_sum_to_one() {
        let engine = MultiStrategyEngine::new(
            BacktestConfig::default(),
            RegimeConfig::default(),
            vec![strategy("a", 0.5, true, RegimeFilter::None)],
        );
        let err = engine.validate().unwrap_err().to_string();
        assert!(err.contains("capital_weight"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let engine = MultiStrategyEngine::new(
            BacktestConfig::default(),
            RegimeConfig::default(),
            vec![
                strategy("a", 0.5, true, RegimeFilter::None),
                strategy("a", 0.5, true, RegimeFilter::None),
            ],
        );
        assert!(engine.validate().unwrap_err().to_string().contains("duplicate"));
    }
}
