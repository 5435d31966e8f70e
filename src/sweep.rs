//! Parallel parameter sweeps over strategy variants and factor windows.
//!
//! Every grid point is an independent single-strategy run. A shared
//! cancellation flag is checked before each point starts; points that never
//! started are reported as cancelled and publish nothing, while points that
//! finished have complete artifacts.

use crate::analytics::PerformanceMetrics;
use crate::engine::BacktestConfig;
use crate::error::{FactorError, Result};
use crate::export::ArtifactWriter;
use crate::data::Panel;
use crate::metadata::{hash_serialized, RunMetadata};
use crate::portfolio::MultiStrategyEngine;
use crate::regime::RegimeConfig;
use crate::strategy::{StrategyConfig, StrategyVariant};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tabled::{builder::Builder, settings::Style};
use tracing::{info, warn};

/// One point of the sweep grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub variant: StrategyVariant,
    pub window: usize,
}

impl SweepPoint {
    /// Strategy id and artifact stem of the point.
    pub fn id(&self) -> String {
        format!("{}_w{}", self.variant, self.window)
    }

    /// Variant defaults with the sweep window applied.
    pub fn strategy(&self) -> StrategyConfig {
        let mut config = self.variant.defaults();
        config.id = self.id();
        config.window = self.window;
        config.volatility_window = self.window;
        config.capital_weight = 1.0;
        config
    }
}

/// Grid of variants × windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepGrid {
    pub variants: Vec<StrategyVariant>,
    pub windows: Vec<usize>,
}

impl SweepGrid {
    pub fn new(variants: Vec<StrategyVariant>, windows: Vec<usize>) -> Self {
        Self { variants, windows }
    }

    /// Points in variant-major order.
    pub fn points(&self) -> Vec<SweepPoint> {
        self.variants
            .iter()
            .flat_map(|v| {
                self.windows.iter().map(move |w| SweepPoint {
                    variant: *v,
                    window: *w,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.variants.len() * self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one grid point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SweepStatus {
    Completed {
        metrics: PerformanceMetrics,
        warnings: usize,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub point: SweepPoint,
    pub status: SweepStatus,
}

impl SweepOutcome {
    pub fn metrics(&self) -> Option<&PerformanceMetrics> {
        match &self.status {
            SweepStatus::Completed { metrics, .. } => Some(metrics),
            _ => None,
        }
    }
}

/// All outcomes of a sweep, in grid order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub outcomes: Vec<SweepOutcome>,
}

impl SweepReport {
    pub fn completed(&self) -> impl Iterator<Item = &SweepOutcome> {
        self.outcomes.iter().filter(|o| o.metrics().is_some())
    }

    pub fn cancelled_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, SweepStatus::Cancelled))
            .count()
    }

    /// Completed point with the highest Sharpe ratio; ties go to the earlier point.
    pub fn best_by_sharpe(&self) -> Option<&SweepOutcome> {
        self.completed().fold(None, |best: Option<&SweepOutcome>, o| match best {
            Some(b) if b.metrics().map(|m| m.sharpe_ratio).unwrap_or(f64::MIN)
                >= o.metrics().map(|m| m.sharpe_ratio).unwrap_or(f64::MIN) =>
            {
                Some(b)
            }
            _ => Some(o),
        })
    }

    pub fn table(&self) -> String {
        let mut builder = Builder::new();
        builder.push_record(["Variant", "Window", "Status", "Return %", "Max DD %", "Sharpe"]);
        for o in &self.outcomes {
            let (status, ret, dd, sharpe) = match &o.status {
                SweepStatus::Completed { metrics, .. } => (
                    "ok".to_string(),
                    format!("{:.2}", metrics.total_return_pct),
                    format!("{:.2}", -metrics.max_drawdown_pct),
                    format!("{:.2}", metrics.sharpe_ratio),
                ),
                SweepStatus::Failed { error } => (format!("failed: {}", error), "-".into(), "-".into(), "-".into()),
                SweepStatus::Cancelled => ("cancelled".to_string(), "-".into(), "-".into(), "-".into()),
            };
            builder.push_record([
                o.point.variant.to_string(),
                o.point.window.to_string(),
                status,
                ret,
                dd,
                sharpe,
            ]);
        }
        builder.build().with(Style::rounded()).to_string()
    }
}

/// Runs a sweep grid in parallel.
#[derive(Debug, Clone)]
pub struct ParameterSweep {
    backtest: BacktestConfig,
    regime: RegimeConfig,
    grid: SweepGrid,
    output_dir: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
}

impl ParameterSweep {
    pub fn new(backtest: BacktestConfig, regime: RegimeConfig, grid: SweepGrid) -> Self {
        Self {
            backtest,
            regime,
            grid,
            output_dir: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish each point's artifacts under `dir` with the point id as stem.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Flag that stops points which have not yet started.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn grid(&self) -> &SweepGrid {
        &self.grid
    }

    /// Validate every point before any simulation.
    pub fn validate(&self) -> Result<()> {
        if self.grid.is_empty() {
            return Err(FactorError::config("sweep", "grid must have at least one variant and window"));
        }
        for point in self.grid.points() {
            self.engine_for(&point).validate()?;
        }
        Ok(())
    }

    fn engine_for(&self, point: &SweepPoint) -> MultiStrategyEngine {
        let mut backtest = self.backtest.clone();
        backtest.show_progress = false;
        MultiStrategyEngine::new(backtest, self.regime.clone(), vec![point.strategy()])
    }

    pub fn run(&self, panel: &Panel) -> Result<SweepReport> {
        self.validate()?;
        let points = self.grid.points();
        info!("Sweeping {} points", points.len());

        let progress = if self.backtest.show_progress {
            let pb = ProgressBar::new(points.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} runs")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            Some(pb)
        } else {
            None
        };

        let base_metadata = RunMetadata::new(&self.backtest, panel, Vec::new());

        let outcomes: Vec<SweepOutcome> = points
            .par_iter()
            .map(|point| {
                let status = self.run_point(point, panel, &base_metadata);
                if let Some(pb) = &progress {
                    pb.inc(1);
                }
                SweepOutcome {
                    point: point.clone(),
                    status,
                }
            })
            .collect();

        if let Some(pb) = progress {
            pb.finish_with_message("Sweep complete");
        }

        let report = SweepReport { outcomes };
        info!(
            "Sweep finished: {} completed, {} cancelled",
            report.completed().count(),
            report.cancelled_count()
        );
        Ok(report)
    }

    fn run_point(&self, point: &SweepPoint, panel: &Panel, base: &RunMetadata) -> SweepStatus {
        if self.cancel.load(Ordering::SeqCst) {
            return SweepStatus::Cancelled;
        }
        match self.execute(point, panel, base) {
            Ok(status) => status,
            Err(FactorError::Cancelled) => SweepStatus::Cancelled,
            Err(e) => {
                warn!("Sweep point {} failed: {}", point.id(), e);
                SweepStatus::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn execute(&self, point: &SweepPoint, panel: &Panel, base: &RunMetadata) -> Result<SweepStatus> {
        let engine = self.engine_for(point);
        let result = engine.run(panel)?;

        if let Some(dir) = &self.output_dir {
            // A cancel raised mid-run discards the finished result unpublished.
            if self.cancel.load(Ordering::SeqCst) {
                return Err(FactorError::Cancelled);
            }
            let strategies = engine.strategies().to_vec();
            let mut metadata = base.clone();
            metadata.config_hash = hash_serialized(&strategies);
            metadata.strategy_ids = vec![point.id()];
            ArtifactWriter::new(dir, point.id()).write_run(&result, &strategies, Some(metadata))?;
        }

        Ok(SweepStatus::Completed {
            metrics: result.metrics.clone(),
            warnings: result.warnings.len(),
        })
    }
}
