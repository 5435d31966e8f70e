//! Strategy configuration and the registry of strategy variants.
//!
//! Every strategy is one [`StrategyVariant`] (a factor and a set of default
//! parameters) plus the per-instance overrides of a [`StrategyConfig`].
//! Variants form a closed set resolved at startup; an unknown name is a
//! configuration error rather than a missing lookup at run time.

use crate::error::{FactorError, Result};
use crate::factors::{Eligibility, FactorKind};
use crate::regime::RegimeFilter;
use crate::weighting::{WeightingMethod, WeightingParams};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registered strategy variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyVariant {
    Momentum,
    Reversal,
    LowVolatility,
    Size,
    VolumeTrend,
    FundingCarry,
}

impl StrategyVariant {
    /// Every variant, in registry order.
    pub const ALL: [StrategyVariant; 6] = [
        StrategyVariant::Momentum,
        StrategyVariant::Reversal,
        StrategyVariant::LowVolatility,
        StrategyVariant::Size,
        StrategyVariant::VolumeTrend,
        StrategyVariant::FundingCarry,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StrategyVariant::Momentum => "momentum",
            StrategyVariant::Reversal => "reversal",
            StrategyVariant::LowVolatility => "low_volatility",
            StrategyVariant::Size => "size",
            StrategyVariant::VolumeTrend => "volume_trend",
            StrategyVariant::FundingCarry => "funding_carry",
        }
    }

    /// Resolve a variant by name; `-` and `_` are interchangeable.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|v| v.name() == normalized)
    }

    pub fn description(&self) -> &'static str {
        match self {
            StrategyVariant::Momentum => "Long recent winners, short recent losers",
            StrategyVariant::Reversal => "Long recent losers, short recent winners",
            StrategyVariant::LowVolatility => "Long calm entities, short volatile ones",
            StrategyVariant::Size => "Long small caps, short large caps",
            StrategyVariant::VolumeTrend => "Long rising volume, short fading volume",
            StrategyVariant::FundingCarry => "Long negative funding, short positive funding",
        }
    }

    /// Factor evaluated by the variant.
    pub fn factor(&self) -> FactorKind {
        match self {
            StrategyVariant::Momentum => FactorKind::Momentum,
            StrategyVariant::Reversal => FactorKind::Reversal,
            StrategyVariant::LowVolatility => FactorKind::LowVolatility,
            StrategyVariant::Size => FactorKind::Size,
            StrategyVariant::VolumeTrend => FactorKind::VolumeTrend,
            StrategyVariant::FundingCarry => FactorKind::Carry {
                column: "funding_rate".to_string(),
            },
        }
    }

    /// Default configuration of the variant, identified by its name.
    pub fn defaults(&self) -> StrategyConfig {
        let base = StrategyConfig::new(self.name(), *self);
        let mut config = match self {
            StrategyVariant::Momentum => StrategyConfig {
                window: 30,
                rebalance_period_days: 7,
                ..base
            },
            StrategyVariant::Reversal => StrategyConfig {
                window: 7,
                rebalance_period_days: 3,
                ..base
            },
            StrategyVariant::LowVolatility => StrategyConfig {
                window: 60,
                rebalance_period_days: 30,
                weighting_method: WeightingMethod::RiskParity,
                ..base
            },
            StrategyVariant::Size => StrategyConfig {
                window: 30,
                rebalance_period_days: 30,
                ..base
            },
            StrategyVariant::VolumeTrend => StrategyConfig {
                window: 14,
                rebalance_period_days: 7,
                ..base
            },
            StrategyVariant::FundingCarry => StrategyConfig {
                window: 7,
                rebalance_period_days: 1,
                capital_flexible: false,
                ..base
            },
        };
        config.volatility_window = config.window;
        config
    }
}

impl fmt::Display for StrategyVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Fully resolved configuration of one strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    pub variant: StrategyVariant,
    pub factor: FactorKind,
    /// Trailing factor window in trading dates.
    pub window: usize,
    pub rebalance_period_days: usize,
    pub weighting_method: WeightingMethod,
    pub long_percentile: f64,
    pub short_percentile: f64,
    pub long_allocation: f64,
    pub short_allocation: f64,
    pub regime_filter: RegimeFilter,
    /// Whether the strategy's capital may be redistributed when it is inactive.
    pub capital_flexible: bool,
    pub min_volume: f64,
    pub min_market_cap: f64,
    /// Nominal share of total capital.
    pub capital_weight: f64,
    /// Window for risk-parity volatility; defaults to `window`.
    pub volatility_window: usize,
}

impl StrategyConfig {
    /// A configuration with library-wide defaults for the given variant.
    pub fn new(id: impl Into<String>, variant: StrategyVariant) -> Self {
        Self {
            id: id.into(),
            variant,
            factor: variant.factor(),
            window: 30,
            rebalance_period_days: 7,
            weighting_method: WeightingMethod::EqualWeight,
            long_percentile: 0.8,
            short_percentile: 0.2,
            long_allocation: 0.5,
            short_allocation: 0.5,
            regime_filter: RegimeFilter::None,
            capital_flexible: true,
            min_volume: 0.0,
            min_market_cap: 0.0,
            capital_weight: 1.0,
            volatility_window: 30,
        }
    }

    pub fn eligibility(&self) -> Eligibility {
        Eligibility {
            min_volume: self.min_volume,
            min_market_cap: self.min_market_cap,
        }
    }

    pub fn weighting_params(&self) -> WeightingParams {
        WeightingParams {
            method: self.weighting_method,
            long_allocation: self.long_allocation,
            short_allocation: self.short_allocation,
            volatility_window: self.volatility_window,
        }
    }

    /// Trading dates of history needed before the first rebalance.
    pub fn warmup_periods(&self) -> usize {
        match self.weighting_method {
            WeightingMethod::RiskParity => self.window.max(self.volatility_window),
            WeightingMethod::EqualWeight => self.window,
        }
    }

    /// First date index at which the strategy can rebalance, given the index
    /// the backtest starts at.
    pub fn first_active_index(&self, start_idx: usize) -> usize {
        start_idx.max(self.warmup_periods().saturating_sub(1))
    }

    fn field(&self, name: &str) -> String {
        format!("strategies[{}].{}", self.id, name)
    }

    /// Check every field, reporting the first offending one.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FactorError::config("strategies[].id", "must not be empty"));
        }
        if self.window < 2 || self.window < self.factor.min_window() {
            return Err(FactorError::config(
                self.field("window"),
                format!(
                    "must be at least {} (got {})",
                    self.factor.min_window().max(2),
                    self.window
                ),
            ));
        }
        if self.rebalance_period_days < 1 {
            return Err(FactorError::config(
                self.field("rebalance_period_days"),
                "must be at least 1",
            ));
        }
        for (name, value) in [
            ("long_percentile", self.long_percentile),
            ("short_percentile", self.short_percentile),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FactorError::config(
                    self.field(name),
                    format!("must be within [0, 1] (got {})", value),
                ));
            }
        }
        if self.short_percentile > self.long_percentile {
            return Err(FactorError::config(
                self.field("short_percentile"),
                format!(
                    "overlaps long bucket: short_percentile {} > long_percentile {}",
                    self.short_percentile, self.long_percentile
                ),
            ));
        }
        for (name, value) in [
            ("long_allocation", self.long_allocation),
            ("short_allocation", self.short_allocation),
            ("min_volume", self.min_volume),
            ("min_market_cap", self.min_market_cap),
            ("capital_weight", self.capital_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(FactorError::config(
                    self.field(name),
                    format!("must be a non-negative number (got {})", value),
                ));
            }
        }
        if self.weighting_method == WeightingMethod::RiskParity && self.volatility_window < 2 {
            return Err(FactorError::config(
                self.field("volatility_window"),
                "must be at least 2 for risk_parity",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_registry_round_trips_names() {
        for variant in StrategyVariant::ALL {
            assert_eq!(StrategyVariant::from_name(variant.name()), Some(variant));
        }
        assert_eq!(
            StrategyVariant::from_name("Funding-Carry"),
            Some(StrategyVariant::FundingCarry)
        );
        assert_eq!(StrategyVariant::from_name("pairs"), None);
    }

    #[test]
    fn test_variant_defaults_are_valid() {
        for variant in StrategyVariant::ALL {
            let config = variant.defaults();
            assert!(config.validate().is_ok(), "{} defaults invalid", variant);
            assert_eq!(config.id, variant.name());
        }
    }

    #[test]
    fn test_overlapping_percentiles_rejected() {
        let config = StrategyConfig {
            long_percentile: 0.3,
            short_percentile: 0.6,
            ..StrategyVariant::Momentum.defaults()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("strategies[momentum].short_percentile"));
    }

    #[test]
    fn test_negative_allocation_rejected() {
        let config = StrategyConfig {
            short_allocation: -0.5,
            ..StrategyVariant::Momentum.defaults()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("short_allocation"));
    }

    #[test]
    fn test_window_and_period_bounds() {
        let config = StrategyConfig {
            window: 1,
            ..StrategyVariant::Momentum.defaults()
        };
        assert!(config.validate().is_err());

        let config = StrategyConfig {
            rebalance_period_days: 0,
            ..StrategyVariant::Momentum.defaults()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("rebalance_period_days"));
    }

    #[test]
    fn test_first_active_index() {
        let config = StrategyConfig {
            window: 5,
            ..StrategyVariant::Momentum.defaults()
        };
        assert_eq!(config.first_active_index(0), 4);
        assert_eq!(config.first_active_index(10), 10);

        let rp = StrategyConfig {
            window: 5,
            volatility_window: 20,
            weighting_method: WeightingMethod::RiskParity,
            ..StrategyVariant::Momentum.defaults()
        };
        assert_eq!(rp.first_active_index(0), 19);
    }
}
