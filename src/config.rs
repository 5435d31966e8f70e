//! Configuration file support for factor backtests.
//!
//! Runs are described by a TOML file with `[backtest]`, `[data]`,
//! `[regime]`, `[[strategies]]` and `[optimizer]` sections. Enumerated
//! values are kept as strings in the file and resolved during conversion so
//! an unknown value is reported against the field that holds it.

use crate::data::{parse_date, DataConfig};
use crate::engine::{BacktestConfig, EquityMode};
use crate::error::{FactorError, Result};
use crate::factors::FactorKind;
use crate::optimizer::OptimizerConfig;
use crate::portfolio::MultiStrategyEngine;
use crate::regime::{RegimeConfig, RegimeFilter, DEFAULT_REFERENCE_ALIASES};
use crate::strategy::{StrategyConfig, StrategyVariant};
use crate::weighting::WeightingMethod;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete run configuration loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFileConfig {
    #[serde(default)]
    pub backtest: BacktestSettings,
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default)]
    pub regime: RegimeSettings,
    #[serde(default)]
    pub strategies: Vec<StrategySettings>,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
}

/// General backtest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSettings {
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
    /// Start date (YYYY-MM-DD format).
    #[serde(default)]
    pub start_date: Option<String>,
    /// End date (YYYY-MM-DD format).
    #[serde(default)]
    pub end_date: Option<String>,
    /// `compound` or `additive`.
    #[serde(default = "default_equity_mode")]
    pub equity_mode: String,
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: f64,
    #[serde(default)]
    pub risk_free_rate: f64,
    #[serde(default)]
    pub show_progress: bool,
}

fn default_capital() -> f64 { 100_000.0 }
fn default_equity_mode() -> String { "compound".to_string() }
fn default_periods_per_year() -> f64 { 365.0 }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: default_capital(),
            start_date: None,
            end_date: None,
            equity_mode: default_equity_mode(),
            periods_per_year: default_periods_per_year(),
            risk_free_rate: 0.0,
            show_progress: false,
        }
    }
}

/// Data settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSettings {
    /// Path to the observation CSV.
    #[serde(default)]
    pub path: Option<String>,
    /// Date format in CSV.
    #[serde(default)]
    pub date_format: Option<String>,
    /// CSV delimiter; detected when absent.
    #[serde(default)]
    pub delimiter: Option<char>,
}

/// Regime detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSettings {
    #[serde(default = "default_short_window")]
    pub short_window: usize,
    #[serde(default = "default_long_window")]
    pub long_window: usize,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_aliases")]
    pub aliases: Vec<String>,
}

fn default_short_window() -> usize { 50 }
fn default_long_window() -> usize { 200 }
fn default_confidence_threshold() -> f64 { 0.05 }
fn default_aliases() -> Vec<String> {
    DEFAULT_REFERENCE_ALIASES.iter().map(|s| s.to_string()).collect()
}

impl Default for RegimeSettings {
    fn default() -> Self {
        Self {
            short_window: default_short_window(),
            long_window: default_long_window(),
            confidence_threshold: default_confidence_threshold(),
            aliases: default_aliases(),
        }
    }
}

/// One `[[strategies]]` entry. Unset fields take the variant's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategySettings {
    /// Unique id; defaults to the variant name.
    #[serde(default)]
    pub id: Option<String>,
    pub variant: String,
    #[serde(default)]
    pub window: Option<usize>,
    #[serde(default)]
    pub rebalance_period_days: Option<usize>,
    /// `equal_weight` or `risk_parity`.
    #[serde(default)]
    pub weighting_method: Option<String>,
    #[serde(default)]
    pub long_percentile: Option<f64>,
    #[serde(default)]
    pub short_percentile: Option<f64>,
    #[serde(default)]
    pub long_allocation: Option<f64>,
    #[serde(default)]
    pub short_allocation: Option<f64>,
    /// `none`, `bull_only` or `bear_only`.
    #[serde(default)]
    pub regime_filter: Option<String>,
    #[serde(default)]
    pub capital_flexible: Option<bool>,
    #[serde(default)]
    pub min_volume: Option<f64>,
    #[serde(default)]
    pub min_market_cap: Option<f64>,
    /// Nominal capital share. Split equally when no strategy sets one.
    #[serde(default)]
    pub capital_weight: Option<f64>,
    #[serde(default)]
    pub volatility_window: Option<usize>,
    /// Auxiliary column read by carry variants.
    #[serde(default)]
    pub factor_column: Option<String>,
}

impl StrategySettings {
    /// Settings selecting a variant with all defaults.
    pub fn for_variant(variant: StrategyVariant) -> Self {
        Self {
            variant: variant.name().to_string(),
            ..Default::default()
        }
    }

    fn resolve(&self, position: usize, capital_weight: f64) -> Result<StrategyConfig> {
        let variant = StrategyVariant::from_name(&self.variant).ok_or_else(|| {
            FactorError::config(
                format!("strategies[{}].variant", position),
                format!(
                    "unknown variant '{}' (expected one of: {})",
                    self.variant,
                    variant_names()
                ),
            )
        })?;

        let mut config = variant.defaults();
        if let Some(id) = &self.id {
            config.id = id.clone();
        }
        let id = config.id.clone();
        let field = |name: &str| format!("strategies[{}].{}", id, name);

        if let Some(window) = self.window {
            config.window = window;
            config.volatility_window = window;
        }
        if let Some(v) = self.volatility_window {
            config.volatility_window = v;
        }
        if let Some(v) = self.rebalance_period_days {
            config.rebalance_period_days = v;
        }
        if let Some(raw) = &self.weighting_method {
            config.weighting_method = WeightingMethod::parse(raw).ok_or_else(|| {
                FactorError::config(
                    field("weighting_method"),
                    format!("unknown weighting method '{}' (expected equal_weight or risk_parity)", raw),
                )
            })?;
        }
        if let Some(raw) = &self.regime_filter {
            config.regime_filter = RegimeFilter::parse(raw).ok_or_else(|| {
                FactorError::config(
                    field("regime_filter"),
                    format!("unknown regime filter '{}' (expected none, bull_only or bear_only)", raw),
                )
            })?;
        }
        if let Some(column) = &self.factor_column {
            match config.factor {
                FactorKind::Carry { .. } => {
                    config.factor = FactorKind::Carry {
                        column: column.clone(),
                    }
                }
                _ => {
                    return Err(FactorError::config(
                        field("factor_column"),
                        format!("variant '{}' does not read an auxiliary column", variant),
                    ))
                }
            }
        }
        if let Some(v) = self.long_percentile {
            config.long_percentile = v;
        }
        if let Some(v) = self.short_percentile {
            config.short_percentile = v;
        }
        if let Some(v) = self.long_allocation {
            config.long_allocation = v;
        }
        if let Some(v) = self.short_allocation {
            config.short_allocation = v;
        }
        if let Some(v) = self.capital_flexible {
            config.capital_flexible = v;
        }
        if let Some(v) = self.min_volume {
            config.min_volume = v;
        }
        if let Some(v) = self.min_market_cap {
            config.min_market_cap = v;
        }
        config.capital_weight = capital_weight;
        Ok(config)
    }
}

fn variant_names() -> String {
    StrategyVariant::ALL
        .iter()
        .map(|v| v.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Mean-variance optimizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Trailing observations used for estimation; all when absent.
    #[serde(default)]
    pub lookback: Option<usize>,
    #[serde(default)]
    pub risk_free_rate: f64,
    #[serde(default)]
    pub default_floor: f64,
    #[serde(default = "default_cap")]
    pub default_cap: f64,
    /// Per-strategy maximum weight.
    #[serde(default)]
    pub caps: BTreeMap<String, f64>,
    /// Per-strategy minimum weight.
    #[serde(default)]
    pub floors: BTreeMap<String, f64>,
}

fn default_cap() -> f64 { 1.0 }

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            lookback: None,
            risk_free_rate: 0.0,
            default_floor: 0.0,
            default_cap: default_cap(),
            caps: BTreeMap::new(),
            floors: BTreeMap::new(),
        }
    }
}

fn parse_config_date(raw: &Option<String>, field: &str) -> Result<Option<NaiveDate>> {
    match raw {
        None => Ok(None),
        Some(s) => parse_date(s, Some("%Y-%m-%d"))
            .map(Some)
            .map_err(|e| FactorError::config(field, format!("'{}' is not a YYYY-MM-DD date ({})", s, e))),
    }
}

impl RunFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: RunFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// A configuration running a single variant with its defaults.
    pub fn for_variant(variant: StrategyVariant) -> Self {
        Self {
            strategies: vec![StrategySettings::for_variant(variant)],
            ..Default::default()
        }
    }

    pub fn to_backtest_config(&self) -> Result<BacktestConfig> {
        let equity_mode = EquityMode::parse(&self.backtest.equity_mode).ok_or_else(|| {
            FactorError::config(
                "backtest.equity_mode",
                format!(
                    "unknown equity mode '{}' (expected compound or additive)",
                    self.backtest.equity_mode
                ),
            )
        })?;

        let config = BacktestConfig {
            initial_capital: self.backtest.initial_capital,
            start_date: parse_config_date(&self.backtest.start_date, "backtest.start_date")?,
            end_date: parse_config_date(&self.backtest.end_date, "backtest.end_date")?,
            equity_mode,
            periods_per_year: self.backtest.periods_per_year,
            risk_free_rate: self.backtest.risk_free_rate,
            show_progress: self.backtest.show_progress,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_data_config(&self) -> Result<DataConfig> {
        let delimiter = match self.data.delimiter {
            None => None,
            Some(c) if c.is_ascii() => Some(c as u8),
            Some(c) => {
                return Err(FactorError::config(
                    "data.delimiter",
                    format!("'{}' is not a single-byte delimiter", c),
                ))
            }
        };
        Ok(DataConfig {
            date_format: self.data.date_format.clone(),
            delimiter,
        })
    }

    pub fn to_regime_config(&self) -> RegimeConfig {
        RegimeConfig {
            short_window: self.regime.short_window,
            long_window: self.regime.long_window,
            confidence_threshold: self.regime.confidence_threshold,
            aliases: self.regime.aliases.clone(),
        }
    }

    /// Resolve every `[[strategies]]` entry against its variant defaults.
    pub fn to_strategies(&self) -> Result<Vec<StrategyConfig>> {
        if self.strategies.is_empty() {
            return Err(FactorError::config("strategies", "at least one strategy is required"));
        }
        let any_weight = self.strategies.iter().any(|s| s.capital_weight.is_some());
        let equal = 1.0 / self.strategies.len() as f64;

        self.strategies
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let weight = match (any_weight, s.capital_weight) {
                    (false, _) => equal,
                    (true, Some(w)) => w,
                    (true, None) => {
                        return Err(FactorError::config(
                            format!("strategies[{}].capital_weight", s.id.as_deref().unwrap_or(&s.variant)),
                            "must be set when any strategy sets a capital weight",
                        ))
                    }
                };
                s.resolve(i, weight)
            })
            .collect()
    }

    pub fn to_optimizer_config(&self, periods_per_year: f64) -> OptimizerConfig {
        OptimizerConfig {
            lookback: self.optimizer.lookback,
            risk_free_rate: self.optimizer.risk_free_rate,
            periods_per_year,
            default_floor: self.optimizer.default_floor,
            default_cap: self.optimizer.default_cap,
            ..Default::default()
        }
    }

    /// Check the optimizer bounds against the resolved strategy ids.
    fn validate_optimizer(&self, strategies: &[StrategyConfig]) -> Result<()> {
        let opt = &self.optimizer;
        if opt.lookback == Some(0) || opt.lookback == Some(1) {
            return Err(FactorError::config("optimizer.lookback", "must be at least 2"));
        }
        let mut floor_sum = 0.0;
        let mut cap_sum = 0.0;
        for s in strategies {
            let floor = opt.floors.get(&s.id).copied().unwrap_or(opt.default_floor);
            let cap = opt.caps.get(&s.id).copied().unwrap_or(opt.default_cap);
            if !(floor >= 0.0 && floor <= cap && cap.is_finite()) {
                return Err(FactorError::config(
                    format!("optimizer.floors[{}]", s.id),
                    format!("floor {} must be within [0, cap {}]", floor, cap),
                ));
            }
            floor_sum += floor;
            cap_sum += cap;
        }
        if floor_sum > 1.0 + 1e-9 || cap_sum < 1.0 - 1e-9 {
            return Err(FactorError::config(
                "optimizer.caps",
                format!(
                    "infeasible bounds: floors sum to {:.4}, caps sum to {:.4}",
                    floor_sum, cap_sum
                ),
            ));
        }
        Ok(())
    }

    /// Build the engine, validating every section first.
    pub fn to_engine(&self) -> Result<MultiStrategyEngine> {
        let backtest = self.to_backtest_config()?;
        self.to_data_config()?;
        let strategies = self.to_strategies()?;
        self.validate_optimizer(&strategies)?;
        let engine = MultiStrategyEngine::new(backtest, self.to_regime_config(), strategies);
        engine.validate()?;
        Ok(engine)
    }

    /// Validate without keeping the engine.
    pub fn validate(&self) -> Result<()> {
        self.to_engine().map(|_| ())
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# crossfactor run configuration

[backtest]
initial_capital = 100000.0
# start_date = "2023-01-01"
# end_date = "2023-12-31"
equity_mode = "compound"     # or "additive"
periods_per_year = 365.0
risk_free_rate = 0.0
show_progress = false

[data]
path = "data/universe.csv"   # date,symbol,close,volume,market_cap[,aux...]
# date_format = "%Y-%m-%d"
# delimiter = ","

[regime]
short_window = 50
long_window = 200
confidence_threshold = 0.05
aliases = ["bitcoin", "BTC", "BTC-USD", "BTCUSDT", "XBT"]

[[strategies]]
id = "momentum"
variant = "momentum"
window = 30
rebalance_period_days = 7
weighting_method = "equal_weight"
long_percentile = 0.8
short_percentile = 0.2
long_allocation = 0.5
short_allocation = 0.5
regime_filter = "bull_only"
capital_flexible = true
min_volume = 1000000.0
capital_weight = 0.4

[[strategies]]
id = "low_vol"
variant = "low_volatility"
weighting_method = "risk_parity"
capital_weight = 0.3

[[strategies]]
id = "carry"
variant = "funding_carry"
factor_column = "funding_rate"
capital_flexible = false
capital_weight = 0.3

[optimizer]
# lookback = 180
risk_free_rate = 0.0
default_floor = 0.0
default_cap = 1.0

[optimizer.caps]
momentum = 0.6
"#
        .to_string()
    }
}
