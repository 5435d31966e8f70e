//! Performance analytics and reporting.

use crate::engine::{BacktestConfig, EquityMode, StrategyRun};
use crate::optimizer::OptimizationResult;
use crate::portfolio::CombinedResult;
use crate::regime::RegimeStats;
use crate::types::PerformanceRecord;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::{builder::Builder, settings::Style};

/// Summary statistics of an equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PerformanceMetrics {
    pub periods: usize,
    pub initial_capital: f64,
    pub final_equity: f64,

    // Returns
    pub total_return_pct: f64,
    pub annual_return_pct: f64,
    pub best_period_pct: f64,
    pub worst_period_pct: f64,

    // Risk
    pub volatility_annual_pct: f64,
    pub max_drawdown_pct: f64,
    /// Longest stretch of periods spent below a previous peak.
    pub max_drawdown_duration: usize,

    // Risk-adjusted
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,

    /// Percentage of periods with a positive return, among periods with a
    /// non-zero return.
    pub win_rate: f64,

    // Exposure
    pub avg_gross_exposure: f64,
    pub avg_net_exposure: f64,
}

impl PerformanceMetrics {
    /// Calculate metrics from performance records.
    pub fn from_records(records: &[PerformanceRecord], config: &BacktestConfig) -> Self {
        let initial = config.initial_capital;
        let returns: Vec<f64> = records.iter().map(|r| r.daily_return).collect();
        let mut equity = Vec::with_capacity(records.len() + 1);
        equity.push(initial);
        equity.extend(records.iter().map(|r| r.equity_value));

        let mut metrics = Self::from_returns(
            &returns,
            &equity,
            config.periods_per_year,
            config.risk_free_rate,
            config.equity_mode,
        );
        if !records.is_empty() {
            let n = records.len() as f64;
            metrics.avg_gross_exposure = records.iter().map(|r| r.gross_exposure()).sum::<f64>() / n;
            metrics.avg_net_exposure = records.iter().map(|r| r.net_exposure()).sum::<f64>() / n;
        }
        metrics
    }

    /// Calculate metrics from per-period returns and the equity curve they
    /// produce (starting with the initial capital).
    pub fn from_returns(
        returns: &[f64],
        equity: &[f64],
        periods_per_year: f64,
        risk_free_rate: f64,
        mode: EquityMode,
    ) -> Self {
        let initial = equity.first().copied().unwrap_or(0.0);
        let final_equity = equity.last().copied().unwrap_or(initial);
        let n = returns.len();

        if n == 0 || initial <= 0.0 {
            return Self {
                periods: n,
                initial_capital: initial,
                final_equity,
                ..Default::default()
            };
        }

        let total_return = final_equity / initial - 1.0;
        let years = n as f64 / periods_per_year;
        let annual_return = match mode {
            EquityMode::Compound if final_equity > 0.0 => (final_equity / initial).powf(1.0 / years) - 1.0,
            EquityMode::Compound => -1.0,
            EquityMode::Additive => total_return / years,
        };

        let mean = returns.iter().sum::<f64>() / n as f64;
        let std = population_std(returns, mean);
        let rf_period = risk_free_rate / periods_per_year;
        let volatility = std * periods_per_year.sqrt();

        let sharpe_ratio = if std > 0.0 {
            (mean - rf_period) / std * periods_per_year.sqrt()
        } else {
            0.0
        };

        let downside = (returns
            .iter()
            .map(|r| (r - rf_period).min(0.0).powi(2))
            .sum::<f64>()
            / n as f64)
            .sqrt();
        let sortino_ratio = if downside > 0.0 {
            (mean - rf_period) / downside * periods_per_year.sqrt()
        } else {
            0.0
        };

        let max_dd = max_drawdown(equity);
        let calmar_ratio = if max_dd > 0.0 { annual_return / max_dd } else { 0.0 };

        let nonzero = returns.iter().filter(|r| **r != 0.0).count();
        let wins = returns.iter().filter(|r| **r > 0.0).count();
        let win_rate = if nonzero > 0 {
            wins as f64 / nonzero as f64 * 100.0
        } else {
            0.0
        };

        Self {
            periods: n,
            initial_capital: initial,
            final_equity,
            total_return_pct: total_return * 100.0,
            annual_return_pct: annual_return * 100.0,
            best_period_pct: returns.iter().copied().fold(f64::NEG_INFINITY, f64::max) * 100.0,
            worst_period_pct: returns.iter().copied().fold(f64::INFINITY, f64::min) * 100.0,
            volatility_annual_pct: volatility * 100.0,
            max_drawdown_pct: max_dd * 100.0,
            max_drawdown_duration: max_drawdown_duration(equity),
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            win_rate,
            avg_gross_exposure: 0.0,
            avg_net_exposure: 0.0,
        }
    }
}

fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Largest peak-to-trough decline of an equity curve, as a fraction of the
/// peak.
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut max_dd: f64 = 0.0;
    for &value in equity {
        peak = peak.max(value);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - value) / peak);
        }
    }
    max_dd
}

/// Longest number of consecutive periods below the running peak.
pub fn max_drawdown_duration(equity: &[f64]) -> usize {
    let mut peak = f64::NEG_INFINITY;
    let mut current = 0;
    let mut longest = 0;
    for &value in equity {
        if value >= peak {
            peak = value;
            current = 0;
        } else {
            current += 1;
            longest = longest.max(current);
        }
    }
    longest
}

/// Format results for terminal display.
pub struct ResultFormatter;

impl ResultFormatter {
    /// Print the combined portfolio report to stdout.
    pub fn print_report(result: &CombinedResult) {
        let metrics = &result.metrics;

        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", " FACTOR PORTFOLIO RESULTS ".bold().blue());
        println!("{}", "═".repeat(60).blue());
        println!();

        println!("{}", "Overview".bold().underline());
        let ids: Vec<&str> = result.runs.iter().map(|r| r.strategy_id.as_str()).collect();
        println!("  Strategies:      {}", ids.join(", "));
        if let (Some(first), Some(last)) = (result.records.first(), result.records.last()) {
            println!("  Period:          {} to {}", first.date, last.date);
        }
        println!("  Periods:         {}", metrics.periods);
        println!("  Utilization:     {:>12.2}%", result.average_utilization() * 100.0);
        println!();

        Self::print_metrics(metrics);

        println!("{}", "Regimes".bold().underline());
        Self::print_regime_stats(&result.regime_stats);
        println!();

        if !result.warnings.is_empty() {
            println!(
                "  {} {} warnings (see warnings.json)",
                "!".yellow().bold(),
                result.warnings.len()
            );
            println!();
        }

        Self::print_table(&result.runs);
        println!("{}", "═".repeat(60).blue());
    }

    fn print_metrics(metrics: &PerformanceMetrics) {
        println!("{}", "Performance".bold().underline());
        println!("  Initial Capital: ${:>12.2}", metrics.initial_capital);
        println!(
            "  Final Equity:    ${:>12.2}  {}",
            metrics.final_equity,
            Self::format_pct_change(metrics.total_return_pct)
        );
        println!("  Total Return:    {:>12.2}%", metrics.total_return_pct);
        println!("  Annual Return:   {:>12.2}%", metrics.annual_return_pct);
        println!();

        println!("{}", "Risk Metrics".bold().underline());
        println!("  Max Drawdown:    {:>12.2}%", -metrics.max_drawdown_pct);
        println!("  Volatility:      {:>12.2}%", metrics.volatility_annual_pct);
        println!("  Sharpe Ratio:    {:>12.2}", metrics.sharpe_ratio);
        println!("  Sortino Ratio:   {:>12.2}", metrics.sortino_ratio);
        println!("  Calmar Ratio:    {:>12.2}", metrics.calmar_ratio);
        println!("  Win Rate:        {:>12.1}%", metrics.win_rate);
        println!();
    }

    fn print_regime_stats(stats: &RegimeStats) {
        for (regime, count) in &stats.regime_counts {
            println!(
                "  {:<16} {:>6} dates ({:.1}%, avg run {:.1})",
                format!("{}:", regime),
                count,
                stats.regime_percentages.get(regime).copied().unwrap_or(0.0),
                stats.avg_durations.get(regime).copied().unwrap_or(0.0)
            );
        }
        println!("  Regime changes:  {:>6}", stats.num_changes);
    }

    /// Format percentage change with color.
    fn format_pct_change(pct: f64) -> String {
        if pct >= 0.0 {
            format!("(+{:.2}%)", pct).green().to_string()
        } else {
            format!("({:.2}%)", pct).red().to_string()
        }
    }

    /// Per-strategy comparison table.
    pub fn strategy_table(runs: &[StrategyRun]) -> String {
        let mut builder = Builder::new();
        builder.push_record([
            "Strategy", "Factor", "Return %", "Annual %", "Max DD %", "Sharpe", "Sortino", "Rebalances",
        ]);
        for run in runs {
            let m = &run.metrics;
            builder.push_record([
                run.strategy_id.clone(),
                run.config.factor.name(),
                format!("{:.2}", m.total_return_pct),
                format!("{:.2}", m.annual_return_pct),
                format!("{:.2}", -m.max_drawdown_pct),
                format!("{:.2}", m.sharpe_ratio),
                format!("{:.2}", m.sortino_ratio),
                run.rebalances.len().to_string(),
            ]);
        }
        builder.build().with(Style::rounded()).to_string()
    }

    /// Print per-strategy results as a table.
    pub fn print_table(runs: &[StrategyRun]) {
        println!("{}", Self::strategy_table(runs));
    }

    /// Print optimizer output.
    pub fn print_optimization(result: &OptimizationResult) {
        println!();
        println!("{}", "Mean-Variance Allocation".bold().underline());
        println!("  Method:          {:?}", result.method);
        println!("  Expected Return: {:>12.2}%", result.expected_return * 100.0);
        println!("  Volatility:      {:>12.2}%", result.volatility * 100.0);
        println!("  Sharpe Ratio:    {:>12.2}", result.sharpe_ratio);
        if let Some(lambda) = result.regularization {
            println!("  Regularization:  {:>12.2e}", lambda);
        }
        println!();

        let mut builder = Builder::new();
        builder.push_record(["Strategy", "Weight %", "Exp. Return %"]);
        for (id, weight) in &result.weights {
            builder.push_record([
                id.clone(),
                format!("{:.2}", weight * 100.0),
                format!(
                    "{:.2}",
                    result.expected_returns.get(id).copied().unwrap_or(0.0) * 100.0
                ),
            ]);
        }
        println!("{}", builder.build().with(Style::rounded()).to_string());

        for warning in &result.warnings {
            println!("  {} {}", "!".yellow().bold(), warning);
        }
    }

    /// Export metrics to JSON.
    pub fn to_json(metrics: &PerformanceMetrics) -> String {
        serde_json::to_string_pretty(metrics).unwrap_or_else(|_| "{}".to_string())
    }
}
