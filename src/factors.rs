//! Cross-sectional factor computation and percentile bucketing.
//!
//! A factor is evaluated on the trailing `window` observations of an entity
//! ending at the evaluation date (inclusive). Entities without a complete
//! window have no value on that date and are left out of the ranking.
//!
//! Ranking is ordinal: entities are sorted by (factor value, symbol) and the
//! i-th entity (0-based) of n receives percentile rank `(i + 1) / n`. Equal
//! factor values are therefore ordered by symbol, which makes bucket
//! membership deterministic.
//!
//! # Example
//!
//! ```ignore
//! use crossfactor::factors::{compute_at, rank, FactorKind};
//!
//! let view = panel.as_of(t);
//! let values = compute_at(&view, 30, &FactorKind::Momentum);
//! let signals = rank("momentum_30d", &values, 0.8, 0.2);
//! ```

use crate::data::{Panel, PanelView};
use crate::types::{Bucket, FactorValue, Observation, Signal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Closed set of factor statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FactorKind {
    /// Trailing return over the window.
    Momentum,
    /// Negated trailing return.
    Reversal,
    /// Negated standard deviation of daily returns.
    LowVolatility,
    /// Negated log of mean market capitalization.
    Size,
    /// Log of the latest volume relative to the window mean.
    VolumeTrend,
    /// Negated window mean of an auxiliary column.
    Carry { column: String },
}

impl FactorKind {
    /// Stable name used in artifacts.
    pub fn name(&self) -> String {
        match self {
            FactorKind::Momentum => "momentum".to_string(),
            FactorKind::Reversal => "reversal".to_string(),
            FactorKind::LowVolatility => "low_volatility".to_string(),
            FactorKind::Size => "size".to_string(),
            FactorKind::VolumeTrend => "volume_trend".to_string(),
            FactorKind::Carry { column } => format!("carry_{}", column),
        }
    }

    /// Smallest window the statistic is defined on.
    pub fn min_window(&self) -> usize {
        match self {
            FactorKind::Momentum | FactorKind::Reversal | FactorKind::LowVolatility => 2,
            FactorKind::Size | FactorKind::VolumeTrend | FactorKind::Carry { .. } => 1,
        }
    }

    /// Evaluate the statistic on a complete trailing window (oldest first).
    pub fn evaluate(&self, window: &[&Observation]) -> Option<f64> {
        if window.len() < self.min_window() {
            return None;
        }
        let value = match self {
            FactorKind::Momentum => window_return(window)?,
            FactorKind::Reversal => -window_return(window)?,
            FactorKind::LowVolatility => -return_volatility(window)?,
            FactorKind::Size => {
                if window.iter().any(|o| !(o.market_cap.is_finite() && o.market_cap > 0.0)) {
                    return None;
                }
                let mean = window.iter().map(|o| o.market_cap).sum::<f64>() / window.len() as f64;
                -mean.ln()
            }
            FactorKind::VolumeTrend => {
                if window.iter().any(|o| !(o.volume.is_finite() && o.volume >= 0.0)) {
                    return None;
                }
                let mean = window.iter().map(|o| o.volume).sum::<f64>() / window.len() as f64;
                let last = window.last()?.volume;
                if mean <= 0.0 || last <= 0.0 {
                    return None;
                }
                (last / mean).ln()
            }
            FactorKind::Carry { column } => {
                let values: Option<Vec<f64>> = window.iter().map(|o| o.aux_value(column)).collect();
                let values = values?;
                -(values.iter().sum::<f64>() / values.len() as f64)
            }
        };
        value.is_finite().then_some(value)
    }
}

impl fmt::Display for FactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn window_return(window: &[&Observation]) -> Option<f64> {
    let first = window.first()?;
    let last = window.last()?;
    if !first.has_valid_price() || !last.has_valid_price() {
        return None;
    }
    Some(last.close / first.close - 1.0)
}

fn return_volatility(window: &[&Observation]) -> Option<f64> {
    if window.iter().any(|o| !o.has_valid_price()) {
        return None;
    }
    let returns: Vec<f64> = window
        .windows(2)
        .map(|w| w[1].close / w[0].close - 1.0)
        .collect();
    std_dev(&returns)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

/// Standard deviation of daily returns over the trailing `window` closes.
pub fn trailing_volatility(view: &PanelView<'_>, symbol: &str, window: usize) -> Option<f64> {
    let closes = view.closes(symbol, window)?;
    let returns: Vec<f64> = closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect();
    std_dev(&returns).filter(|v| v.is_finite())
}

/// Evaluate a factor for every symbol on the view date.
pub fn compute_at(view: &PanelView<'_>, window: usize, factor: &FactorKind) -> Vec<FactorValue> {
    let date = view.date();
    let name = factor.name();
    view.symbols()
        .iter()
        .map(|symbol| FactorValue {
            symbol: symbol.clone(),
            date,
            factor_name: name.clone(),
            value: view
                .window(symbol, window)
                .and_then(|obs| factor.evaluate(&obs)),
        })
        .collect()
}

/// Evaluate a factor on every date of the panel, ordered by (date, symbol).
pub fn compute(panel: &Panel, window: usize, factor: &FactorKind) -> Vec<FactorValue> {
    (0..panel.len())
        .flat_map(|t| compute_at(&panel.as_of(t), window, factor))
        .collect()
}

/// Liquidity and size filters applied before ranking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Eligibility {
    pub min_volume: f64,
    pub min_market_cap: f64,
}

impl Eligibility {
    /// Whether the observation on the ranking date passes the filters.
    ///
    /// A non-positive minimum disables that filter.
    pub fn passes(&self, obs: &Observation) -> bool {
        if !obs.has_valid_price() {
            return false;
        }
        let volume_ok = self.min_volume <= 0.0 || obs.volume >= self.min_volume;
        let cap_ok = self.min_market_cap <= 0.0 || obs.market_cap >= self.min_market_cap;
        volume_ok && cap_ok
    }
}

/// Keep factor values that are defined, pass eligibility on the view date and
/// are not in `excluded`.
pub fn eligible_values(
    view: &PanelView<'_>,
    values: Vec<FactorValue>,
    eligibility: &Eligibility,
    excluded: &BTreeSet<String>,
) -> Vec<FactorValue> {
    values
        .into_iter()
        .filter(|fv| fv.defined().is_some())
        .filter(|fv| !excluded.contains(&fv.symbol))
        .filter(|fv| {
            view.current(&fv.symbol)
                .is_some_and(|obs| eligibility.passes(obs))
        })
        .collect()
}

/// Rank defined factor values and assign buckets.
///
/// Short bucket: rank <= `short_percentile`. Long bucket: rank strictly
/// above `long_percentile`; an entity ranked exactly at `long_percentile` is
/// neutral, not long. With `short_percentile <= long_percentile` the buckets
/// are disjoint, including when the two thresholds coincide. Signals are
/// returned in ascending rank order.
pub fn rank(
    strategy_id: &str,
    values: &[FactorValue],
    long_percentile: f64,
    short_percentile: f64,
) -> Vec<Signal> {
    let mut ranked: Vec<(&FactorValue, f64)> = values
        .iter()
        .filter_map(|fv| fv.defined().map(|v| (fv, v)))
        .collect();
    ranked.sort_by(|(a, va), (b, vb)| va.total_cmp(vb).then_with(|| a.symbol.cmp(&b.symbol)));

    let n = ranked.len() as f64;
    ranked
        .into_iter()
        .enumerate()
        .map(|(i, (fv, value))| {
            let percentile_rank = (i + 1) as f64 / n;
            let bucket = if percentile_rank <= short_percentile {
                Bucket::Short
            } else if percentile_rank > long_percentile {
                Bucket::Long
            } else {
                Bucket::Neutral
            };
            Signal {
                symbol: fv.symbol.clone(),
                date: fv.date,
                strategy_id: strategy_id.to_string(),
                bucket,
                percentile_rank,
                factor_value: value,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn value(symbol: &str, v: Option<f64>) -> FactorValue {
        FactorValue {
            symbol: symbol.to_string(),
            date: date(1),
            factor_name: "test".to_string(),
            value: v,
        }
    }

    fn trending_panel() -> Panel {
        let mut obs = Vec::new();
        for d in 1..=10u32 {
            let t = d as f64;
            obs.push(Observation::new("UP", date(d), 100.0 * 1.02f64.powf(t), 1e6, 2e9));
            obs.push(Observation::new("FLAT", date(d), 100.0, 1e6, 1e9));
            obs.push(Observation::new("DOWN", date(d), 100.0 * 0.98f64.powf(t), 1e3, 5e8));
        }
        Panel::from_observations(obs).unwrap()
    }

    #[test]
    fn test_momentum_window_is_inclusive() {
        let panel = trending_panel();
        let values = compute_at(&panel.as_of(4), 5, &FactorKind::Momentum);
        let up = values.iter().find(|v| v.symbol == "UP").unwrap();
        let expected = 1.02f64.powi(4) - 1.0;
        assert!((up.value.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_history_is_undefined() {
        let panel = trending_panel();
        let values = compute_at(&panel.as_of(2), 5, &FactorKind::Momentum);
        assert_eq!(values.len(), 3);
        assert!(values.iter().all(|v| v.value.is_none()));
    }

    #[test]
    fn test_compute_covers_all_dates() {
        let panel = trending_panel();
        let values = compute(&panel, 3, &FactorKind::Momentum);
        assert_eq!(values.len(), 30);
        assert_eq!(values.iter().filter(|v| v.value.is_some()).count(), 24);
    }

    #[test]
    fn test_low_volatility_prefers_flat_series() {
        let panel = trending_panel();
        let values = compute_at(&panel.as_of(9), 5, &FactorKind::LowVolatility);
        let flat = values.iter().find(|v| v.symbol == "FLAT").unwrap();
        assert_eq!(flat.value, Some(-0.0));
    }

    #[test]
    fn test_carry_requires_aux_column() {
        let d = date(1);
        let a = Observation::new("A", d, 1.0, 1.0, 1.0).with_aux("funding_rate", 0.001);
        let b = Observation::new("B", d, 1.0, 1.0, 1.0);
        let factor = FactorKind::Carry {
            column: "funding_rate".to_string(),
        };
        assert_eq!(factor.evaluate(&[&a]), Some(-0.001));
        assert_eq!(factor.evaluate(&[&b]), None);
        assert_eq!(factor.name(), "carry_funding_rate");
    }

    #[test]
    fn test_rank_buckets_top_and_bottom() {
        let values: Vec<FactorValue> = ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"]
            .iter()
            .enumerate()
            .map(|(i, s)| value(s, Some(i as f64)))
            .collect();
        let signals = rank("s", &values, 0.8, 0.2);

        let longs: Vec<&str> = signals
            .iter()
            .filter(|s| s.bucket == Bucket::Long)
            .map(|s| s.symbol.as_str())
            .collect();
        let shorts: Vec<&str> = signals
            .iter()
            .filter(|s| s.bucket == Bucket::Short)
            .map(|s| s.symbol.as_str())
            .collect();
        assert_eq!(longs, vec!["I", "J"]);
        assert_eq!(shorts, vec!["A", "B"]);
    }

    #[test]
    fn test_rank_at_long_threshold_is_neutral() {
        let values: Vec<FactorValue> = ["A", "B", "C", "D"]
            .iter()
            .enumerate()
            .map(|(i, s)| value(s, Some(i as f64)))
            .collect();
        let buckets: Vec<Bucket> = rank("s", &values, 0.75, 0.25).iter().map(|s| s.bucket).collect();
        assert_eq!(
            buckets,
            vec![Bucket::Short, Bucket::Neutral, Bucket::Neutral, Bucket::Long]
        );
    }

    #[test]
    fn test_rank_half_split_is_disjoint() {
        let values = vec![value("A", Some(1.0)), value("B", Some(2.0)), value("C", Some(3.0))];
        let signals = rank("s", &values, 0.5, 0.5);
        let buckets: Vec<Bucket> = signals.iter().map(|s| s.bucket).collect();
        assert_eq!(buckets, vec![Bucket::Short, Bucket::Long, Bucket::Long]);
    }

    #[test]
    fn test_rank_ties_broken_by_symbol() {
        let values = vec![
            value("ZED", Some(1.0)),
            value("ALPHA", Some(1.0)),
            value("MID", Some(1.0)),
            value("NONE", None),
        ];
        let signals = rank("s", &values, 0.5, 0.5);
        let order: Vec<&str> = signals.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(order, vec!["ALPHA", "MID", "ZED"]);
        assert_eq!(signals[0].bucket, Bucket::Short);
        assert!((signals[2].percentile_rank - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_eligibility_filters() {
        let panel = trending_panel();
        let view = panel.as_of(9);
        let values = compute_at(&view, 5, &FactorKind::Momentum);
        let eligibility = Eligibility {
            min_volume: 1e4,
            min_market_cap: 0.0,
        };
        let mut excluded = BTreeSet::new();
        excluded.insert("FLAT".to_string());
        let kept = eligible_values(&view, values, &eligibility, &excluded);
        let symbols: Vec<&str> = kept.iter().map(|v| v.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["UP"]);
    }

    #[test]
    fn test_trailing_volatility() {
        let panel = trending_panel();
        let view = panel.as_of(9);
        let vol = trailing_volatility(&view, "UP", 5).unwrap();
        assert!(vol.abs() < 1e-9);
        assert_eq!(trailing_volatility(&view, "UP", 1), None);
    }
}
