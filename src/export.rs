//! Export functionality for run artifacts.
//!
//! Every artifact is written to a temporary file in the output directory and
//! then renamed into place, so a reader (or a cancelled sweep) only ever sees
//! complete files.
//!
//! A run with prefix `out/run1` publishes:
//!
//! - `out/run1_portfolio_values.csv`: per-date values, exposures and counts
//!   for every strategy and the combined portfolio
//! - `out/run1_positions.csv`: positions committed at each rebalance
//! - `out/run1_allocations.csv`: capital weight per strategy and date
//! - `out/run1_summary.json`: performance metrics and regime statistics
//! - `out/run1_config.json`: configuration snapshot
//! - `out/run1_warnings.json`: recoverable conditions handled during the run

use crate::analytics::PerformanceMetrics;
use crate::error::{FactorError, Result, Warning};
use crate::metadata::RunMetadata;
use crate::optimizer::OptimizationResult;
use crate::portfolio::{CombinedResult, PORTFOLIO_ID};
use crate::regime::RegimeStats;
use crate::types::PerformanceRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Configuration for exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Date format for CSV exports.
    pub date_format: String,
    /// Decimal precision for numeric values.
    pub precision: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            date_format: "%Y-%m-%d".to_string(),
            precision: 10,
        }
    }
}

/// Summary document for JSON export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub portfolio: PerformanceMetrics,
    pub strategies: BTreeMap<String, PerformanceMetrics>,
    pub average_utilization: f64,
    pub regime_stats: RegimeStats,
    pub warning_count: usize,
    pub metadata: Option<RunMetadata>,
}

impl RunSummary {
    pub fn from_result(result: &CombinedResult, metadata: Option<RunMetadata>) -> Self {
        Self {
            portfolio: result.metrics.clone(),
            strategies: result
                .runs
                .iter()
                .map(|r| (r.strategy_id.clone(), r.metrics.clone()))
                .collect(),
            average_utilization: result.average_utilization(),
            regime_stats: result.regime_stats.clone(),
            warning_count: result.warnings.len(),
            metadata,
        }
    }
}

/// Publishes run artifacts under a path prefix.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
    stem: String,
    config: ExportConfig,
}

impl ArtifactWriter {
    /// Writer for `dir/{stem}_{artifact}`. An empty stem drops the separator.
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            config: ExportConfig::default(),
        }
    }

    /// Split an output prefix such as `out/run1` or `out/` into a writer.
    pub fn from_prefix(prefix: impl AsRef<Path>) -> Self {
        let prefix = prefix.as_ref();
        let as_text = prefix.to_string_lossy();
        if prefix.is_dir() || as_text.ends_with('/') || as_text.ends_with(std::path::MAIN_SEPARATOR) {
            return Self::new(prefix, "");
        }
        let dir = match prefix.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = prefix
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(dir, stem)
    }

    pub fn with_config(mut self, config: ExportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final path of an artifact.
    pub fn path_for(&self, artifact: &str) -> PathBuf {
        if self.stem.is_empty() {
            self.dir.join(artifact)
        } else {
            self.dir.join(format!("{}_{}", self.stem, artifact))
        }
    }

    /// Write bytes to a temporary file next to the target and rename it into place.
    pub fn publish(&self, artifact: &str, bytes: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.path_for(artifact);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| FactorError::Io(e.error))?;
        debug!("Published {}", target.display());
        Ok(target)
    }

    fn publish_json<T: Serialize + ?Sized>(&self, artifact: &str, value: &T) -> Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.publish(artifact, &bytes)
    }

    fn num(&self, v: f64) -> String {
        format!("{:.prec$}", v, prec = self.config.precision)
    }

    /// Per-date values for every strategy followed by the combined portfolio.
    pub fn portfolio_values_csv(&self, result: &CombinedResult) -> Result<Vec<u8>> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record([
            "date",
            "strategy_id",
            "daily_return",
            "equity_value",
            "running_peak",
            "drawdown",
            "long_exposure",
            "short_exposure",
            "gross_exposure",
            "net_exposure",
            "long_count",
            "short_count",
            "capital_weight",
        ])?;

        for run in &result.runs {
            for (i, record) in run.records.iter().enumerate() {
                let weight = result
                    .plans
                    .get(i)
                    .map(|p| p.weight(&run.strategy_id))
                    .unwrap_or(0.0);
                wtr.write_record(self.value_row(record, weight))?;
            }
        }
        for (i, record) in result.records.iter().enumerate() {
            let utilization = result.plans.get(i).map(|p| p.utilization).unwrap_or(0.0);
            wtr.write_record(self.value_row(record, utilization))?;
        }

        wtr.into_inner().map_err(|e| FactorError::Io(e.into_error()))
    }

    fn value_row(&self, r: &PerformanceRecord, weight: f64) -> Vec<String> {
        vec![
            r.date.format(&self.config.date_format).to_string(),
            r.strategy_id.clone(),
            self.num(r.daily_return),
            self.num(r.equity_value),
            self.num(r.running_peak),
            self.num(r.drawdown),
            self.num(r.long_exposure),
            self.num(r.short_exposure),
            self.num(r.gross_exposure()),
            self.num(r.net_exposure()),
            r.long_count.to_string(),
            r.short_count.to_string(),
            self.num(weight),
        ]
    }

    /// One row per committed position, plus one empty row for inactive rebalances.
    pub fn positions_csv(&self, result: &CombinedResult) -> Result<Vec<u8>> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record([
            "date",
            "strategy_id",
            "regime",
            "active",
            "eligible",
            "turnover",
            "symbol",
            "bucket",
            "factor_value",
            "percentile_rank",
            "weight",
        ])?;

        for run in &result.runs {
            for rebalance in &run.rebalances {
                let date = rebalance.date.format(&self.config.date_format).to_string();
                let head = [
                    date,
                    rebalance.strategy_id.clone(),
                    rebalance.regime.clone(),
                    rebalance.active.to_string(),
                    rebalance.eligible.to_string(),
                    self.num(rebalance.turnover),
                ];
                if rebalance.positions.is_empty() {
                    let mut row = head.to_vec();
                    row.extend(std::iter::repeat(String::new()).take(5));
                    wtr.write_record(&row)?;
                    continue;
                }
                for p in &rebalance.positions {
                    let mut row = head.to_vec();
                    row.push(p.symbol.clone());
                    row.push(p.bucket.to_string());
                    row.push(self.num(p.factor_value));
                    row.push(self.num(p.percentile_rank));
                    row.push(self.num(p.weight));
                    wtr.write_record(&row)?;
                }
            }
        }

        wtr.into_inner().map_err(|e| FactorError::Io(e.into_error()))
    }

    /// Capital weight of each strategy on each simulated date.
    pub fn allocations_csv(&self, result: &CombinedResult) -> Result<Vec<u8>> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(["date", "strategy_id", "capital_weight", "active", "utilization"])?;

        for (i, plan) in result.plans.iter().enumerate() {
            let date = plan.date.format(&self.config.date_format).to_string();
            for (id, weight) in &plan.weights {
                let active = result
                    .run(id)
                    .map(|r| r.is_active_at(i))
                    .unwrap_or(false);
                wtr.write_record([
                    date.clone(),
                    id.clone(),
                    self.num(*weight),
                    active.to_string(),
                    self.num(plan.utilization),
                ])?;
            }
        }

        wtr.into_inner().map_err(|e| FactorError::Io(e.into_error()))
    }

    /// Publish every run artifact. Returns the published paths in write order.
    pub fn write_run<C: Serialize>(
        &self,
        result: &CombinedResult,
        config: &C,
        metadata: Option<RunMetadata>,
    ) -> Result<Vec<PathBuf>> {
        let portfolio_values = self.portfolio_values_csv(result)?;
        let positions = self.positions_csv(result)?;
        let allocations = self.allocations_csv(result)?;
        let summary = RunSummary::from_result(result, metadata);

        let paths = vec![
            self.publish("portfolio_values.csv", &portfolio_values)?,
            self.publish("positions.csv", &positions)?,
            self.publish("allocations.csv", &allocations)?,
            self.publish_json("summary.json", &summary)?,
            self.publish_json("config.json", config)?,
            self.write_warnings(&result.warnings)?,
        ];

        info!(
            "Wrote {} artifacts for {} under {}",
            paths.len(),
            PORTFOLIO_ID,
            self.dir.display()
        );
        Ok(paths)
    }

    pub fn write_warnings(&self, warnings: &[Warning]) -> Result<PathBuf> {
        self.publish_json("warnings.json", warnings)
    }

    pub fn write_optimization(&self, result: &OptimizationResult) -> Result<PathBuf> {
        self.publish_json("optimization.json", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_for_with_and_without_stem() {
        let w = ArtifactWriter::new("/tmp/out", "run1");
        assert_eq!(w.path_for("summary.json"), PathBuf::from("/tmp/out/run1_summary.json"));

        let w = ArtifactWriter::new("/tmp/out", "");
        assert_eq!(w.path_for("summary.json"), PathBuf::from("/tmp/out/summary.json"));
    }

    #[test]
    fn test_from_prefix_splits_parent_and_stem() {
        let w = ArtifactWriter::from_prefix("results/momentum");
        assert_eq!(w.dir(), Path::new("results"));
        assert_eq!(w.path_for("a.csv"), PathBuf::from("results/momentum_a.csv"));

        let w = ArtifactWriter::from_prefix("momentum");
        assert_eq!(w.dir(), Path::new("."));

        let w = ArtifactWriter::from_prefix("results/");
        assert_eq!(w.path_for("a.csv"), PathBuf::from("results/a.csv"));
    }

    #[test]
    fn test_publish_leaves_only_final_file() {
        let dir = TempDir::new().unwrap();
        let w = ArtifactWriter::new(dir.path().join("nested"), "x");
        let path = w.publish("data.txt", b"hello").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_publish_replaces_existing_artifact() {
        let dir = TempDir::new().unwrap();
        let w = ArtifactWriter::new(dir.path(), "");
        w.publish("w.json", b"[1]").unwrap();
        let path = w.publish("w.json", b"[2]").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "[2]");
    }

    #[test]
    fn test_write_warnings_json() {
        let dir = TempDir::new().unwrap();
        let w = ArtifactWriter::new(dir.path(), "run");
        let warnings = vec![Warning::OptimizerFallback {
            reason: "singular".to_string(),
        }];
        let path = w.write_warnings(&warnings).unwrap();
        let parsed: Vec<Warning> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed, warnings);
    }
}
