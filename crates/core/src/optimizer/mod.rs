//! Long-only mean-variance optimization (Modern Portfolio Theory).
//!
//! All problems keep `Σw = 1` and `0 ≤ wᵢ ≤ 1`. Solver failures are reported
//! through [`OptimizationResult::success`]; only malformed input is an error.

mod risk;
mod solver;

pub use risk::{calculate_var, estimate_covariance, simple_returns, CovarianceEstimate};

use crate::error::PortfolioError;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use solver::{LinearEquality, SolverSettings};

pub const DEFAULT_RISK_FREE_RATE: f64 = 0.06;
pub const DEFAULT_FRONTIER_POINTS: usize = 50;

/// Portfolio variance below this is treated as riskless (Sharpe reported as 0).
const RISKLESS_VARIANCE: f64 = 1e-18;
const SYMMETRY_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub risk_free_rate: f64,
    /// Budget of L-BFGS iterations per solve.
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
            max_iterations: 20_000,
            tolerance: 1e-10,
        }
    }
}

impl OptimizerConfig {
    pub fn with_risk_free_rate(mut self, risk_free_rate: f64) -> Self {
        self.risk_free_rate = risk_free_rate;
        self
    }

    pub fn validate(&self) -> Result<(), PortfolioError> {
        if !self.risk_free_rate.is_finite() {
            return Err(PortfolioError::InvalidInput(
                "risk_free_rate must be finite".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(PortfolioError::InvalidInput(
                "max_iterations must be positive".to_string(),
            ));
        }
        if self.tolerance <= 0.0 || !self.tolerance.is_finite() {
            return Err(PortfolioError::InvalidInput(
                "tolerance must be a positive number".to_string(),
            ));
        }
        Ok(())
    }

    fn solver_settings(&self) -> SolverSettings {
        SolverSettings {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub expected_risk: f64,
    pub sharpe_ratio: f64,
    pub success: bool,
    pub message: String,
    pub iterations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub target_return: f64,
    #[serde(rename = "return")]
    pub expected_return: f64,
    #[serde(rename = "risk")]
    pub expected_risk: f64,
    #[serde(rename = "sharpe")]
    pub sharpe_ratio: f64,
    pub weights: Vec<f64>,
}

/// Validated expected returns and covariance of matching dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanVariance {
    returns: DVector<f64>,
    cov: DMatrix<f64>,
}

impl MeanVariance {
    pub fn new(returns: &[f64], cov_matrix: &[Vec<f64>]) -> Result<Self, PortfolioError> {
        let n = returns.len();
        if n == 0 {
            return Err(PortfolioError::InvalidInput(
                "returns must not be empty".to_string(),
            ));
        }
        if returns.iter().any(|r| !r.is_finite()) {
            return Err(PortfolioError::InvalidInput(
                "returns must be finite".to_string(),
            ));
        }
        if cov_matrix.len() != n || cov_matrix.iter().any(|row| row.len() != n) {
            return Err(PortfolioError::InvalidInput(format!(
                "cov_matrix must be {n}x{n} to match returns"
            )));
        }

        let cov = DMatrix::from_fn(n, n, |i, j| cov_matrix[i][j]);
        if cov.iter().any(|c| !c.is_finite()) {
            return Err(PortfolioError::InvalidInput(
                "cov_matrix must be finite".to_string(),
            ));
        }
        for i in 0..n {
            if cov[(i, i)] < 0.0 {
                return Err(PortfolioError::InvalidInput(format!(
                    "cov_matrix has negative variance on row {i}"
                )));
            }
            for j in (i + 1)..n {
                let (a, b) = (cov[(i, j)], cov[(j, i)]);
                if (a - b).abs() > SYMMETRY_TOLERANCE * a.abs().max(b.abs()).max(1.0) {
                    return Err(PortfolioError::InvalidInput(format!(
                        "cov_matrix is not symmetric at ({i}, {j})"
                    )));
                }
            }
        }
        // Symmetrize away rounding noise.
        let cov = (&cov + cov.transpose()) * 0.5;

        Ok(Self {
            returns: DVector::from_column_slice(returns),
            cov,
        })
    }

    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }

    pub fn min_return(&self) -> f64 {
        self.returns.min()
    }

    pub fn max_return(&self) -> f64 {
        self.returns.max()
    }

    pub(crate) fn weights_vector(&self, weights: &[f64]) -> Result<DVector<f64>, PortfolioError> {
        if weights.len() != self.len() {
            return Err(PortfolioError::InvalidInput(format!(
                "expected {} weights, got {}",
                self.len(),
                weights.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(PortfolioError::InvalidInput(
                "weights must be finite".to_string(),
            ));
        }
        Ok(DVector::from_column_slice(weights))
    }

    pub(crate) fn portfolio_return(&self, w: &DVector<f64>) -> f64 {
        self.returns.dot(w)
    }

    pub(crate) fn portfolio_variance(&self, w: &DVector<f64>) -> f64 {
        w.dot(&(&self.cov * w))
    }

    /// (return, risk, Sharpe) of a weight vector.
    pub fn portfolio_metrics(
        &self,
        weights: &[f64],
        risk_free_rate: f64,
    ) -> Result<(f64, f64, f64), PortfolioError> {
        let w = self.weights_vector(weights)?;
        Ok(self.metrics(&w, risk_free_rate))
    }

    fn metrics(&self, w: &DVector<f64>, risk_free_rate: f64) -> (f64, f64, f64) {
        let ret = self.portfolio_return(w);
        let variance = self.portfolio_variance(w).max(0.0);
        let risk = variance.sqrt();
        let sharpe = if variance > RISKLESS_VARIANCE {
            (ret - risk_free_rate) / risk
        } else {
            0.0
        };
        (ret, risk, sharpe)
    }
}

/// Mean-variance optimizer. Stateless apart from its configuration.
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Maximizes Sharpe when `target_return` is `None`, otherwise minimizes
    /// variance subject to hitting the target. Starts from equal weights
    /// unless a warm start of matching length is given.
    pub fn optimize(
        &self,
        mv: &MeanVariance,
        target_return: Option<f64>,
        warm_start: Option<&[f64]>,
    ) -> OptimizationResult {
        let x0 = self.initial_guess(mv, warm_start);
        match target_return {
            Some(target) => self.minimize_variance_for_target(mv, target, x0),
            None => self.maximize_sharpe(mv, x0),
        }
    }

    /// Global minimum-variance portfolio.
    pub fn min_variance(&self, mv: &MeanVariance, warm_start: Option<&[f64]>) -> OptimizationResult {
        let x0 = self.initial_guess(mv, warm_start);
        let sol = solver::minimize_variance(&mv.cov, None, x0, self.config.solver_settings());
        let message = if sol.converged {
            "Optimization terminated successfully.".to_string()
        } else {
            format!("Iteration limit reached after {} iterations", sol.iterations)
        };
        self.finish(mv, sol.x, sol.converged, message, sol.iterations)
    }

    /// Minimum-variance portfolios for targets evenly spaced between the lowest
    /// and highest expected return. Failed points are omitted.
    pub fn efficient_frontier(&self, mv: &MeanVariance, n_points: usize) -> Vec<FrontierPoint> {
        let (lo, hi) = (mv.min_return(), mv.max_return());
        let mut points = Vec::with_capacity(n_points);
        let mut warm: Option<Vec<f64>> = None;

        for k in 0..n_points {
            let target = if n_points == 1 {
                lo
            } else {
                lo + (hi - lo) * k as f64 / (n_points - 1) as f64
            };
            let result = self.optimize(mv, Some(target), warm.as_deref());
            if !result.success {
                tracing::debug!(target, message = %result.message, "skipping frontier point");
                continue;
            }
            warm = Some(result.weights.clone());
            points.push(FrontierPoint {
                target_return: target,
                expected_return: result.expected_return,
                expected_risk: result.expected_risk,
                sharpe_ratio: result.sharpe_ratio,
                weights: result.weights,
            });
        }
        points
    }

    fn initial_guess(&self, mv: &MeanVariance, warm_start: Option<&[f64]>) -> DVector<f64> {
        let n = mv.len();
        match warm_start {
            Some(w) if w.len() == n && w.iter().all(|x| x.is_finite()) => {
                solver::project_simplex(&DVector::from_column_slice(w))
            }
            Some(w) => {
                tracing::warn!(expected = n, got = w.len(), "ignoring malformed warm start");
                DVector::from_element(n, 1.0 / n as f64)
            }
            None => DVector::from_element(n, 1.0 / n as f64),
        }
    }

    fn minimize_variance_for_target(
        &self,
        mv: &MeanVariance,
        target: f64,
        x0: DVector<f64>,
    ) -> OptimizationResult {
        let n = mv.len();
        let (lo, hi) = (mv.min_return(), mv.max_return());
        let slack = 1e-12 * lo.abs().max(hi.abs()).max(1.0);
        if !target.is_finite() || target < lo - slack || target > hi + slack {
            let message = format!(
                "Target return {target} is infeasible: achievable range is [{lo}, {hi}]"
            );
            tracing::warn!(target, lo, hi, "infeasible target return");
            return self.finish(mv, DVector::from_element(n, 1.0 / n as f64), false, message, 0);
        }

        if target >= hi - slack || target <= lo + slack {
            return self.solve_on_face(mv, target, slack);
        }

        let a = mv.returns.map(|r| r - target);
        let scale = a.amax();
        let eq = LinearEquality {
            a: a / scale,
            b: 0.0,
        };
        let sol = solver::minimize_variance(&mv.cov, Some(&eq), x0, self.config.solver_settings());

        let message = if sol.converged {
            "Optimization terminated successfully.".to_string()
        } else {
            tracing::warn!(
                target,
                iterations = sol.iterations,
                violation = sol.violation,
                "target-return optimization did not converge"
            );
            format!(
                "Did not converge after {} iterations (constraint residual {:.3e})",
                sol.iterations, sol.violation
            )
        };
        self.finish(mv, sol.x, sol.converged, message, sol.iterations)
    }

    /// A target at the lowest or highest expected return can only be met by
    /// holding assets whose return equals it, so the problem reduces to the
    /// minimum-variance portfolio of that face.
    fn solve_on_face(&self, mv: &MeanVariance, target: f64, slack: f64) -> OptimizationResult {
        let n = mv.len();
        let face: Vec<usize> = (0..n)
            .filter(|&i| (mv.returns[i] - target).abs() <= slack)
            .collect();
        let mut w = DVector::zeros(n);

        if let [only] = face.as_slice() {
            w[*only] = 1.0;
            return self.finish(mv, w, true, "Optimization terminated successfully.".to_string(), 0);
        }

        let sub_cov = DMatrix::from_fn(face.len(), face.len(), |r, c| mv.cov[(face[r], face[c])]);
        let x0 = DVector::from_element(face.len(), 1.0 / face.len() as f64);
        let sol = solver::minimize_variance(&sub_cov, None, x0, self.config.solver_settings());
        for (k, &i) in face.iter().enumerate() {
            w[i] = sol.x[k];
        }
        let message = if sol.converged {
            "Optimization terminated successfully.".to_string()
        } else {
            format!("Iteration limit reached after {} iterations", sol.iterations)
        };
        tracing::debug!(target, assets = face.len(), "target return on the boundary; solved on its face");
        self.finish(mv, w, sol.converged, message, sol.iterations)
    }

    fn maximize_sharpe(&self, mv: &MeanVariance, x0: DVector<f64>) -> OptimizationResult {
        let rf = self.config.risk_free_rate;
        let sol = solver::maximize_sharpe(&mv.returns, &mv.cov, rf, x0, self.config.solver_settings());
        let message = if sol.converged {
            "Optimization terminated successfully.".to_string()
        } else {
            tracing::warn!(iterations = sol.iterations, "max-Sharpe optimization did not converge");
            format!("Did not converge after {} iterations", sol.iterations)
        };
        self.finish(mv, sol.x, sol.converged, message, sol.iterations)
    }

    fn finish(
        &self,
        mv: &MeanVariance,
        w: DVector<f64>,
        success: bool,
        message: String,
        iterations: usize,
    ) -> OptimizationResult {
        let w = w.map(|x| x.clamp(0.0, 1.0));
        let (expected_return, expected_risk, sharpe_ratio) =
            mv.metrics(&w, self.config.risk_free_rate);
        OptimizationResult {
            weights: w.iter().copied().collect(),
            expected_return,
            expected_risk,
            sharpe_ratio,
            success,
            message,
            iterations,
        }
    }
}

fn optimizer_for(risk_free_rate: f64) -> Result<Optimizer, PortfolioError> {
    let config = OptimizerConfig::default().with_risk_free_rate(risk_free_rate);
    config.validate()?;
    Ok(Optimizer::new(config))
}

/// Max-Sharpe weights, or min-variance weights for `target_return`.
pub fn optimize_portfolio(
    returns: &[f64],
    cov_matrix: &[Vec<f64>],
    risk_free_rate: f64,
    target_return: Option<f64>,
) -> Result<OptimizationResult, PortfolioError> {
    let mv = MeanVariance::new(returns, cov_matrix)?;
    Ok(optimizer_for(risk_free_rate)?.optimize(&mv, target_return, None))
}

pub fn min_variance_portfolio(
    returns: &[f64],
    cov_matrix: &[Vec<f64>],
    risk_free_rate: f64,
) -> Result<OptimizationResult, PortfolioError> {
    let mv = MeanVariance::new(returns, cov_matrix)?;
    Ok(optimizer_for(risk_free_rate)?.min_variance(&mv, None))
}

pub fn efficient_frontier(
    returns: &[f64],
    cov_matrix: &[Vec<f64>],
    risk_free_rate: f64,
    n_points: usize,
) -> Result<Vec<FrontierPoint>, PortfolioError> {
    let mv = MeanVariance::new(returns, cov_matrix)?;
    Ok(optimizer_for(risk_free_rate)?.efficient_frontier(&mv, n_points))
}
