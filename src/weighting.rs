//! Portfolio weight construction for the long and short buckets.
//!
//! Bucket weights are computed as non-negative magnitudes that sum to the
//! bucket allocation. Signs are applied afterwards: long positions are
//! positive and short positions negative.

use crate::data::PanelView;
use crate::factors::trailing_volatility;
use crate::types::{Bucket, PositionRecord, Signal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How capital is spread across a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMethod {
    /// `allocation / |bucket|` per member.
    #[default]
    EqualWeight,
    /// Inverse trailing volatility, renormalized to the allocation.
    RiskParity,
}

impl WeightingMethod {
    /// Parse a configuration value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "equal_weight" | "equal" => Some(WeightingMethod::EqualWeight),
            "risk_parity" | "inverse_volatility" => Some(WeightingMethod::RiskParity),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightingMethod::EqualWeight => "equal_weight",
            WeightingMethod::RiskParity => "risk_parity",
        }
    }
}

impl fmt::Display for WeightingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A bucket member with its trailing volatility, if known.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketMember {
    pub symbol: String,
    pub volatility: Option<f64>,
}

impl BucketMember {
    pub fn new(symbol: impl Into<String>, volatility: Option<f64>) -> Self {
        Self {
            symbol: symbol.into(),
            volatility,
        }
    }
}

/// Weight magnitudes for one bucket.
///
/// Under risk parity a member whose volatility is zero, negative or undefined
/// is left out for this rebalance. The result is empty when no member can be
/// weighted or the allocation is not positive.
pub fn weight(
    members: &[BucketMember],
    method: WeightingMethod,
    allocation: f64,
) -> BTreeMap<String, f64> {
    let mut weights = BTreeMap::new();
    if members.is_empty() || allocation <= 0.0 {
        return weights;
    }

    match method {
        WeightingMethod::EqualWeight => {
            let each = allocation / members.len() as f64;
            for m in members {
                weights.insert(m.symbol.clone(), each);
            }
        }
        WeightingMethod::RiskParity => {
            let inverse: Vec<(&str, f64)> = members
                .iter()
                .filter_map(|m| {
                    let vol = m.volatility.filter(|v| v.is_finite() && *v > 0.0)?;
                    Some((m.symbol.as_str(), 1.0 / vol))
                })
                .collect();
            let total: f64 = inverse.iter().map(|(_, iv)| iv).sum();
            if total > 0.0 && total.is_finite() {
                for (symbol, iv) in inverse {
                    weights.insert(symbol.to_string(), allocation * iv / total);
                }
            }
        }
    }
    weights
}

/// Signed positions and their records for one rebalance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstructedPortfolio {
    pub positions: BTreeMap<String, f64>,
    /// Ordered by symbol.
    pub records: Vec<PositionRecord>,
}

/// Parameters of [`construct_portfolio`].
#[derive(Debug, Clone, Copy)]
pub struct WeightingParams {
    pub method: WeightingMethod,
    pub long_allocation: f64,
    pub short_allocation: f64,
    /// Trailing window used for risk-parity volatility.
    pub volatility_window: usize,
}

/// Build signed positions from ranked signals on the view date.
pub fn construct_portfolio(
    view: &PanelView<'_>,
    signals: &[Signal],
    params: &WeightingParams,
) -> ConstructedPortfolio {
    let mut out = ConstructedPortfolio::default();
    let by_symbol: BTreeMap<&str, &Signal> =
        signals.iter().map(|s| (s.symbol.as_str(), s)).collect();

    for (bucket, allocation) in [
        (Bucket::Long, params.long_allocation),
        (Bucket::Short, params.short_allocation),
    ] {
        let members: Vec<BucketMember> = signals
            .iter()
            .filter(|s| s.bucket == bucket)
            .map(|s| {
                let volatility = match params.method {
                    WeightingMethod::RiskParity => {
                        trailing_volatility(view, &s.symbol, params.volatility_window)
                    }
                    WeightingMethod::EqualWeight => None,
                };
                BucketMember::new(s.symbol.clone(), volatility)
            })
            .collect();

        for (symbol, magnitude) in weight(&members, params.method, allocation) {
            out.positions.insert(symbol, bucket.sign() * magnitude);
        }
    }

    for (symbol, w) in &out.positions {
        if let Some(signal) = by_symbol.get(symbol.as_str()) {
            out.records.push(PositionRecord {
                symbol: symbol.clone(),
                bucket: signal.bucket,
                factor_value: signal.factor_value,
                percentile_rank: signal.percentile_rank,
                weight: *w,
            });
        }
    }
    out
}

/// One-way turnover between two position sets: half the sum of absolute
/// weight changes.
pub fn turnover(previous: &BTreeMap<String, f64>, next: &BTreeMap<String, f64>) -> f64 {
    let mut total = 0.0;
    for (symbol, w) in next {
        total += (w - previous.get(symbol).copied().unwrap_or(0.0)).abs();
    }
    for (symbol, w) in previous {
        if !next.contains_key(symbol) {
            total += w.abs();
        }
    }
    total / 2.0
}
