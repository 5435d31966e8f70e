//! Error types for the factor backtester.
//!
//! Fatal conditions are [`FactorError`] values and abort a run before (or
//! instead of) producing artifacts. Recoverable conditions are [`Warning`]
//! values: they are logged where they are detected and collected into the
//! run result, and the run always completes.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the factor backtester.
#[derive(Error, Debug)]
pub enum FactorError {
    #[error("Invalid configuration for `{field}`: {message}")]
    Config { field: String, message: String },

    #[error("Data error: {0}")]
    Data(String),

    #[error(
        "Allocation invariant violated on {date}: weights sum to {total:.12} (expected 1.0)\nstate dump: {dump}"
    )]
    AllocationInvariant {
        date: NaiveDate,
        total: f64,
        dump: String,
    },

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("No data loaded")]
    NoData,

    #[error("Run cancelled")]
    Cancelled,
}

impl FactorError {
    /// Build a field-level configuration error.
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the error reflects bad input rather than a logic defect.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, Self::AllocationInvariant { .. })
    }
}

/// Result type alias for factor backtest operations.
pub type Result<T> = std::result::Result<T, FactorError>;

/// A recoverable condition that was handled locally.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// A held entity had no price on the next date; its return was taken as 0%.
    #[error("{strategy_id}: missing forward return for {symbol} on {date}, treated as 0% and excluded from later buckets")]
    MissingForwardReturn {
        strategy_id: String,
        symbol: String,
        date: NaiveDate,
    },

    /// No entity had enough history to produce a factor value.
    #[error("{strategy_id}: no entity has {window} periods of history on {date}")]
    InsufficientHistory {
        strategy_id: String,
        date: NaiveDate,
        window: usize,
    },

    /// The regime could not be classified; regime-filtered strategies stay flat.
    #[error("regime undetermined on {date}: {reason}")]
    RegimeUndetermined { date: NaiveDate, reason: String },

    /// Capital held by active strategies is below the full allocation.
    #[error("low capital utilization on {date}: {utilization:.4}")]
    LowUtilization { date: NaiveDate, utilization: f64 },

    /// Inactive flexible weight had no active flexible strategy to absorb it.
    #[error("redistribution undefined on {date}: {freed:.4} of inactive flexible weight, {fallback}")]
    RedistributionUndefined {
        date: NaiveDate,
        freed: f64,
        fallback: String,
    },

    /// Diagonal loading was applied to an ill-conditioned covariance matrix.
    #[error("covariance matrix regularized with lambda = {lambda:e}")]
    CovarianceRegularized { lambda: f64 },

    /// The optimizer could not solve and fell back to equal weighting.
    #[error("optimizer fell back to equal weighting: {reason}")]
    OptimizerFallback { reason: String },

    /// A cap or floor named a strategy that is not part of the return matrix.
    #[error("optimizer bound for unknown strategy `{strategy_id}` ignored")]
    BoundsIgnored { strategy_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_field() {
        let err = FactorError::config("strategies[momentum].long_percentile", "must be <= 1.0");
        let msg = err.to_string();
        assert!(msg.contains("strategies[momentum].long_percentile"));
        assert!(msg.contains("must be <= 1.0"));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_allocation_invariant_is_not_user_error() {
        let err = FactorError::AllocationInvariant {
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            total: 0.9,
            dump: "{}".to_string(),
        };
        assert!(!err.is_user_error());
        assert!(err.to_string().contains("2024-01-01"));
    }

    #[test]
    fn test_warning_serializes_with_kind_tag() {
        let warning = Warning::CovarianceRegularized { lambda: 1e-6 };
        let json = serde_json::to_string(&warning).unwrap();
        assert!(json.contains("\"kind\":\"covariance_regularized\""));
    }
}
