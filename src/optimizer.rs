//! Mean-variance optimization of capital weights across strategies.
//!
//! Expected returns and the covariance matrix are estimated from trailing
//! per-strategy daily returns and annualized with `periods_per_year`. The
//! optimizer maximizes the Sharpe ratio subject to per-strategy floors and
//! caps and full investment (`sum(w) = 1`).
//!
//! Maximum Sharpe is solved as a convex QP via the Charnes-Cooper
//! substitution `y = k * w`:
//!
//! ```text
//! minimize    y' S y
//! subject to  (mu - rf)' y = 1
//!             sum(y) - k = 0
//!             floor_i * k <= y_i <= cap_i * k
//!             k >= 0
//! ```
//!
//! and `w = y / k`. When no strategy has a positive excess return the
//! problem has no solution and the bounded minimum-variance portfolio is
//! used instead. Failures are recoverable: a covariance matrix that is not
//! positive definite receives diagonal loading before a retry, and a solver
//! that still fails yields equal weights with a warning.

use crate::engine::StrategyRun;
use crate::error::{FactorError, Result, Warning};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Aligned daily return series, one per strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyReturnMatrix {
    ids: Vec<String>,
    /// `returns[i]` is the series of strategy `ids[i]`.
    returns: Vec<Vec<f64>>,
}

impl StrategyReturnMatrix {
    /// Build from columns of equal length.
    pub fn new(ids: Vec<String>, returns: Vec<Vec<f64>>) -> Result<Self> {
        if ids.is_empty() || ids.len() != returns.len() {
            return Err(FactorError::Data(format!(
                "return matrix needs one series per strategy ({} ids, {} series)",
                ids.len(),
                returns.len()
            )));
        }
        let len = returns[0].len();
        if len < 2 {
            return Err(FactorError::Data(
                "return matrix needs at least two observations".to_string(),
            ));
        }
        for (id, series) in ids.iter().zip(&returns) {
            if series.len() != len {
                return Err(FactorError::Data(format!(
                    "series {} has {} observations, expected {}",
                    id,
                    series.len(),
                    len
                )));
            }
            if series.iter().any(|r| !r.is_finite()) {
                return Err(FactorError::Data(format!("series {} has non-finite returns", id)));
            }
        }
        Ok(Self { ids, returns })
    }

    /// Collect the daily returns of strategy runs.
    pub fn from_runs(runs: &[StrategyRun]) -> Result<Self> {
        let ids = runs.iter().map(|r| r.strategy_id.clone()).collect();
        let returns = runs.iter().map(|r| r.returns()).collect();
        Self::new(ids, returns)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.returns.first().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn series(&self, id: &str) -> Option<&[f64]> {
        let i = self.ids.iter().position(|s| s == id)?;
        Some(&self.returns[i])
    }

    /// Keep only the last `lookback` observations.
    pub fn trailing(&self, lookback: usize) -> Self {
        let len = self.len();
        let start = len.saturating_sub(lookback);
        Self {
            ids: self.ids.clone(),
            returns: self.returns.iter().map(|r| r[start..].to_vec()).collect(),
        }
    }

    /// Annualized mean return per strategy.
    pub fn expected_returns(&self, periods_per_year: f64) -> Vec<f64> {
        self.returns
            .iter()
            .map(|r| r.iter().sum::<f64>() / r.len() as f64 * periods_per_year)
            .collect()
    }

    /// Annualized population covariance matrix.
    pub fn covariance(&self, periods_per_year: f64) -> Vec<Vec<f64>> {
        let n = self.ids.len();
        let means: Vec<f64> = self
            .returns
            .iter()
            .map(|r| r.iter().sum::<f64>() / r.len() as f64)
            .collect();
        let mut cov = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i..n {
                let c = self.returns[i]
                    .iter()
                    .zip(&self.returns[j])
                    .map(|(a, b)| (a - means[i]) * (b - means[j]))
                    .sum::<f64>()
                    / self.len() as f64
                    * periods_per_year;
                cov[i][j] = c;
                cov[j][i] = c;
            }
        }
        cov
    }
}

/// Optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Trailing observations used for estimation; all when `None`.
    pub lookback: Option<usize>,
    /// Annual risk-free rate.
    pub risk_free_rate: f64,
    pub periods_per_year: f64,
    pub default_floor: f64,
    pub default_cap: f64,
    pub max_iter: u32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lookback: None,
            risk_free_rate: 0.0,
            periods_per_year: 365.0,
            default_floor: 0.0,
            default_cap: 1.0,
            max_iter: 100,
        }
    }
}

/// Which problem produced the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMethod {
    MaxSharpe,
    MinVariance,
    EqualWeightFallback,
}

/// Optimized weights and the statistics of the resulting portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub weights: BTreeMap<String, f64>,
    pub method: OptimizationMethod,
    /// Annualized.
    pub expected_return: f64,
    /// Annualized.
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub expected_returns: BTreeMap<String, f64>,
    /// Estimated covariance, rows and columns in `strategy_ids` order.
    pub covariance: Vec<Vec<f64>>,
    pub strategy_ids: Vec<String>,
    /// Diagonal loading applied, if any.
    pub regularization: Option<f64>,
    pub warnings: Vec<Warning>,
}

/// Mean-variance optimizer over strategy return series.
#[derive(Debug, Clone, Default)]
pub struct MeanVarianceOptimizer {
    config: OptimizerConfig,
}

struct Bounds {
    floors: Vec<f64>,
    caps: Vec<f64>,
}

impl MeanVarianceOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn resolve_bounds(
        &self,
        ids: &[String],
        caps: &BTreeMap<String, f64>,
        floors: &BTreeMap<String, f64>,
        warnings: &mut Vec<Warning>,
    ) -> Result<Bounds> {
        for id in caps.keys().chain(floors.keys()) {
            if !ids.contains(id) {
                let w = Warning::BoundsIgnored {
                    strategy_id: id.clone(),
                };
                warn!("{}", w);
                warnings.push(w);
            }
        }

        let mut bounds = Bounds {
            floors: Vec::with_capacity(ids.len()),
            caps: Vec::with_capacity(ids.len()),
        };
        for id in ids {
            let floor = floors.get(id).copied().unwrap_or(self.config.default_floor);
            let cap = caps.get(id).copied().unwrap_or(self.config.default_cap);
            if !floor.is_finite() || !cap.is_finite() || floor < 0.0 || floor > cap {
                return Err(FactorError::config(
                    format!("optimizer.bounds[{}]", id),
                    format!("need 0 <= floor <= cap (floor {}, cap {})", floor, cap),
                ));
            }
            bounds.floors.push(floor);
            bounds.caps.push(cap);
        }

        let floor_sum: f64 = bounds.floors.iter().sum();
        let cap_sum: f64 = bounds.caps.iter().sum();
        if floor_sum > 1.0 + 1e-9 || cap_sum < 1.0 - 1e-9 {
            return Err(FactorError::config(
                "optimizer.bounds",
                format!(
                    "infeasible: sum of floors {:.4} and sum of caps {:.4} must bracket 1.0",
                    floor_sum, cap_sum
                ),
            ));
        }
        Ok(bounds)
    }

    /// Optimize capital weights.
    ///
    /// `caps` and `floors` override the configured defaults per strategy id.
    /// Only invalid input is an error; solver trouble is reported through
    /// the result's warnings.
    pub fn optimize(
        &self,
        matrix: &StrategyReturnMatrix,
        caps: &BTreeMap<String, f64>,
        floors: &BTreeMap<String, f64>,
    ) -> Result<OptimizationResult> {
        let matrix = match self.config.lookback {
            Some(lookback) if lookback >= 2 => matrix.trailing(lookback),
            _ => matrix.clone(),
        };
        let ids = matrix.ids().to_vec();
        let n = ids.len();
        let ppy = self.config.periods_per_year;
        let rf = self.config.risk_free_rate;

        let mut warnings = Vec::new();
        let bounds = self.resolve_bounds(&ids, caps, floors, &mut warnings)?;

        let mu = matrix.expected_returns(ppy);
        let cov = matrix.covariance(ppy);
        let excess: Vec<f64> = mu.iter().map(|m| m - rf).collect();

        info!(
            "Optimizing {} strategies over {} observations",
            n,
            matrix.len()
        );

        let mut regularization = None;
        let mut working = cov.clone();
        if !is_positive_definite(&working) {
            let lambda = regularization_lambda(&working);
            add_diagonal(&mut working, lambda);
            regularization = Some(lambda);
            let w = Warning::CovarianceRegularized { lambda };
            warn!("{}", w);
            warnings.push(w);
        }

        let solved = match self.solve(&working, &excess, &bounds) {
            Ok(solution) => Ok(solution),
            Err(first) => {
                // Stronger loading before giving up.
                let lambda = regularization.map_or_else(|| regularization_lambda(&cov), |l| l * 100.0);
                debug!("Solver failed ({}), retrying with lambda = {:e}", first, lambda);
                let mut retry = cov.clone();
                add_diagonal(&mut retry, lambda);
                regularization = Some(lambda);
                let w = Warning::CovarianceRegularized { lambda };
                warn!("{}", w);
                warnings.push(w);
                self.solve(&retry, &excess, &bounds)
            }
        };

        let (weights, method) = match solved {
            Ok(solution) => solution,
            Err(reason) => {
                let w = Warning::OptimizerFallback { reason };
                warn!("{}", w);
                warnings.push(w);
                (
                    clean_weights(vec![1.0 / n as f64; n], &bounds),
                    OptimizationMethod::EqualWeightFallback,
                )
            }
        };

        let expected_return: f64 = weights.iter().zip(&mu).map(|(w, m)| w * m).sum();
        let variance = quadratic_form(&cov, &weights);
        let volatility = variance.max(0.0).sqrt();
        let sharpe_ratio = if volatility > 0.0 {
            (expected_return - rf) / volatility
        } else {
            0.0
        };

        info!(
            "Optimization ({:?}): {:.2}% return, {:.2}% vol, {:.2} Sharpe",
            method,
            expected_return * 100.0,
            volatility * 100.0,
            sharpe_ratio
        );

        Ok(OptimizationResult {
            weights: ids.iter().cloned().zip(weights).collect(),
            method,
            expected_return,
            volatility,
            sharpe_ratio,
            expected_returns: ids.iter().cloned().zip(mu).collect(),
            covariance: cov,
            strategy_ids: ids,
            regularization,
            warnings,
        })
    }

    fn solve(
        &self,
        cov: &[Vec<f64>],
        excess: &[f64],
        bounds: &Bounds,
    ) -> std::result::Result<(Vec<f64>, OptimizationMethod), String> {
        if excess.iter().any(|e| *e > 0.0) {
            match self.max_sharpe(cov, excess, bounds) {
                Ok(w) => return Ok((w, OptimizationMethod::MaxSharpe)),
                Err(e) => debug!("Max Sharpe failed: {}", e),
            }
        } else {
            debug!("No positive excess return, using minimum variance");
        }
        self.min_variance(cov, bounds)
            .map(|w| (w, OptimizationMethod::MinVariance))
    }

    fn settings(&self) -> std::result::Result<clarabel::solver::DefaultSettings<f64>, String> {
        clarabel::solver::DefaultSettingsBuilder::default()
            .max_iter(self.config.max_iter)
            .verbose(false)
            .build()
            .map_err(|e| format!("Failed to build settings: {}", e))
    }

    fn max_sharpe(
        &self,
        cov: &[Vec<f64>],
        excess: &[f64],
        bounds: &Bounds,
    ) -> std::result::Result<Vec<f64>, String> {
        use clarabel::algebra::*;
        use clarabel::solver::*;

        let n = cov.len();
        let m = n + 1;

        // Objective over (y, k); k does not enter it.
        let p = upper_triangle(cov, m);
        let q = vec![0.0; m];

        // Rows: [excess'y = 1; sum(y) - k = 0; y - cap k <= 0; -y + floor k <= 0; -k <= 0]
        let rows = 2 + 2 * n + 1;
        let mut a_data = Vec::new();
        let mut a_indices = Vec::new();
        let mut a_indptr = vec![0];
        for j in 0..n {
            if excess[j] != 0.0 {
                a_data.push(excess[j]);
                a_indices.push(0);
            }
            a_data.push(1.0);
            a_indices.push(1);
            a_data.push(1.0);
            a_indices.push(2 + j);
            a_data.push(-1.0);
            a_indices.push(2 + n + j);
            a_indptr.push(a_data.len());
        }
        a_data.push(-1.0);
        a_indices.push(1);
        for i in 0..n {
            if bounds.caps[i] != 0.0 {
                a_data.push(-bounds.caps[i]);
                a_indices.push(2 + i);
            }
        }
        for i in 0..n {
            if bounds.floors[i] != 0.0 {
                a_data.push(bounds.floors[i]);
                a_indices.push(2 + n + i);
            }
        }
        a_data.push(-1.0);
        a_indices.push(2 + 2 * n);
        a_indptr.push(a_data.len());

        let a = CscMatrix::new(rows, m, a_indptr, a_indices, a_data);
        let mut b = vec![1.0, 0.0];
        b.extend(vec![0.0; 2 * n + 1]);
        let cones = [ZeroConeT(2), NonnegativeConeT(2 * n + 1)];

        let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, self.settings()?)
            .map_err(|e| format!("Failed to create solver: {:?}", e))?;
        solver.solve();

        if !matches!(
            solver.solution.status,
            SolverStatus::Solved | SolverStatus::AlmostSolved
        ) {
            return Err(format!(
                "Optimization failed with status: {:?}",
                solver.solution.status
            ));
        }

        let x = &solver.solution.x;
        let kappa = x[n];
        if !(kappa.is_finite() && kappa > 1e-12) {
            return Err(format!("degenerate scaling variable {:e}", kappa));
        }
        Ok(clean_weights(x[..n].iter().map(|y| y / kappa).collect(), bounds))
    }

    fn min_variance(&self, cov: &[Vec<f64>], bounds: &Bounds) -> std::result::Result<Vec<f64>, String> {
        use clarabel::algebra::*;
        use clarabel::solver::*;

        let n = cov.len();
        let p = upper_triangle(cov, n);
        let q = vec![0.0; n];

        // Rows: [sum(w) = 1; w <= cap; -w <= -floor]
        let mut a_data = Vec::new();
        let mut a_indices = Vec::new();
        let mut a_indptr = vec![0];
        for j in 0..n {
            a_data.push(1.0);
            a_indices.push(0);
            a_data.push(1.0);
            a_indices.push(1 + j);
            a_data.push(-1.0);
            a_indices.push(1 + n + j);
            a_indptr.push(a_data.len());
        }
        let a = CscMatrix::new(1 + 2 * n, n, a_indptr, a_indices, a_data);

        let mut b = vec![1.0];
        b.extend(bounds.caps.iter().copied());
        b.extend(bounds.floors.iter().map(|f| -f));
        let cones = [ZeroConeT(1), NonnegativeConeT(2 * n)];

        let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, self.settings()?)
            .map_err(|e| format!("Failed to create solver: {:?}", e))?;
        solver.solve();

        if !matches!(
            solver.solution.status,
            SolverStatus::Solved | SolverStatus::AlmostSolved
        ) {
            return Err(format!(
                "Optimization failed with status: {:?}",
                solver.solution.status
            ));
        }
        Ok(clean_weights(solver.solution.x.clone(), bounds))
    }
}

/// Upper triangle of `2 * cov` as a `dim x dim` CSC matrix; columns past
/// `cov.len()` are empty.
fn upper_triangle(cov: &[Vec<f64>], dim: usize) -> clarabel::algebra::CscMatrix<f64> {
    let n = cov.len();
    let mut p_data = Vec::new();
    let mut p_indices = Vec::new();
    let mut p_indptr = vec![0];
    for j in 0..dim {
        if j < n {
            for (i, row) in cov.iter().enumerate().take(j + 1) {
                let val = 2.0 * row[j];
                if val.abs() > 1e-14 {
                    p_data.push(val);
                    p_indices.push(i);
                }
            }
        }
        p_indptr.push(p_data.len());
    }
    clarabel::algebra::CscMatrix::new(dim, dim, p_indptr, p_indices, p_data)
}

/// Clip weights to their bounds, then spread any shortfall or excess over
/// the weights still strictly inside their bounds until they sum to 1.
///
/// Terminates for any bounds with `sum(floors) <= 1 <= sum(caps)`: each pass
/// either closes the gap or pins another weight to a bound.
fn clean_weights(mut weights: Vec<f64>, bounds: &Bounds) -> Vec<f64> {
    for _ in 0..=weights.len() {
        for (i, w) in weights.iter_mut().enumerate() {
            *w = w.clamp(bounds.floors[i], bounds.caps[i]);
        }
        let gap = 1.0 - weights.iter().sum::<f64>();
        if gap.abs() <= 1e-12 {
            break;
        }
        let free: Vec<usize> = (0..weights.len())
            .filter(|&i| {
                if gap > 0.0 {
                    weights[i] < bounds.caps[i]
                } else {
                    weights[i] > bounds.floors[i]
                }
            })
            .collect();
        if free.is_empty() {
            break;
        }
        let mass: f64 = free.iter().map(|&i| weights[i]).sum();
        for &i in &free {
            let share = if mass > 0.0 {
                weights[i] / mass
            } else {
                1.0 / free.len() as f64
            };
            weights[i] += gap * share;
        }
    }
    weights
}

fn quadratic_form(m: &[Vec<f64>], w: &[f64]) -> f64 {
    let mut total = 0.0;
    for (i, row) in m.iter().enumerate() {
        for (j, v) in row.iter().enumerate() {
            total += w[i] * v * w[j];
        }
    }
    total
}

/// Cholesky test for positive definiteness.
pub fn is_positive_definite(m: &[Vec<f64>]) -> bool {
    let n = m.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = m[i][i] - sum;
                if !(d.is_finite() && d > 1e-12) {
                    return false;
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = (m[i][j] - sum) / l[j][j];
            }
        }
    }
    true
}

fn regularization_lambda(m: &[Vec<f64>]) -> f64 {
    let n = m.len().max(1) as f64;
    let trace: f64 = m.iter().enumerate().map(|(i, row)| row[i]).sum();
    (1e-6 * trace / n).max(1e-8)
}

fn add_diagonal(m: &mut [Vec<f64>], lambda: f64) {
    for (i, row) in m.iter_mut().enumerate() {
        row[i] += lambda;
    }
}
