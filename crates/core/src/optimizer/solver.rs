//! Long-only mean-variance solvers built on argmin.
//!
//! Weights are parameterized through a softmax so every L-BFGS iterate lies on
//! the simplex; a target-return equality is added with an augmented
//! Lagrangian. Softmax weights never reach zero, so the argmin solution is
//! only used to pick the support: an active-set KKT solve on that support then
//! makes the budget and return constraints exact.

use argmin::core::{CostFunction, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use nalgebra::{DMatrix, DVector};

const LBFGS_MEMORY: usize = 10;
const PENALTY_ROUNDS: usize = 8;
/// Largest penalty multiple of the initial penalty before giving up on growth.
const MAX_PENALTY_GROWTH: f64 = 1e8;
/// Equality residual accepted as feasible (constraint rows are scaled to unit
/// max-norm by callers).
pub(crate) const FEASIBILITY_TOLERANCE: f64 = 1e-8;
/// Weights below this fraction of the largest weight start outside the support.
const SUPPORT_THRESHOLD: f64 = 1e-6;
const WEIGHT_TOLERANCE: f64 = 1e-12;
const DUAL_TOLERANCE: f64 = 1e-9;
const SVD_EPSILON: f64 = 1e-13;
const VARIANCE_FLOOR: f64 = 1e-18;
const MIN_WEIGHT: f64 = 1e-12;

#[derive(Debug, Clone)]
pub(crate) struct LinearEquality {
    pub a: DVector<f64>,
    pub b: f64,
}

impl LinearEquality {
    fn residual(&self, x: &DVector<f64>) -> f64 {
        self.a.dot(x) - self.b
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SolverSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct Solution {
    pub x: DVector<f64>,
    /// L-BFGS iterations across every argmin run.
    pub iterations: usize,
    pub converged: bool,
    /// |aᵀx − b|, zero when there is no equality.
    pub violation: f64,
}

/// Euclidean projection onto `{x : x ≥ 0, Σx = 1}`.
pub(crate) fn project_simplex(v: &DVector<f64>) -> DVector<f64> {
    let n = v.len();
    if n == 0 {
        return v.clone();
    }
    let mut u: Vec<f64> = v.iter().copied().collect();
    u.sort_by(|a, b| b.total_cmp(a));

    let mut css = 0.0;
    let mut theta = 0.0;
    for (j, uj) in u.iter().enumerate() {
        css += uj;
        let t = (css - 1.0) / (j as f64 + 1.0);
        if uj - t > 0.0 {
            theta = t;
        }
    }
    let mut x = v.map(|vi| (vi - theta).max(0.0));

    // Guard against drift from the sort/accumulate above.
    let s = x.sum();
    if s > 0.0 {
        x /= s;
    } else {
        x.fill(1.0 / n as f64);
    }
    x
}

/// Upper bound on the spectral norm of a symmetric matrix.
pub(crate) fn norm_inf(m: &DMatrix<f64>) -> f64 {
    m.row_iter()
        .map(|r| r.iter().map(|x| x.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

fn softmax(x: &[f64]) -> DVector<f64> {
    let n = x.len();
    let peak = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps = DVector::from_iterator(n, x.iter().map(|v| (v - peak).exp()));
    let total = exps.sum();
    if total.is_finite() && total > 0.0 {
        exps / total
    } else {
        DVector::from_element(n, 1.0 / n as f64)
    }
}

fn logits(w: &DVector<f64>) -> Vec<f64> {
    w.iter().map(|v| v.max(MIN_WEIGHT).ln()).collect()
}

#[derive(Debug, Clone)]
struct Penalty {
    eq: LinearEquality,
    lambda: f64,
    rho: f64,
}

#[derive(Debug, Clone)]
enum Objective {
    /// `wᵀQw`, plus the augmented-Lagrangian terms of an equality if present.
    Variance(Option<Penalty>),
    /// `−(μ − rf)ᵀw / σ(w)`.
    NegativeSharpe(DVector<f64>),
}

#[derive(Debug, Clone)]
struct SimplexProblem {
    q: DMatrix<f64>,
    objective: Objective,
}

impl SimplexProblem {
    fn value(&self, w: &DVector<f64>) -> f64 {
        let qw = &self.q * w;
        match &self.objective {
            Objective::Variance(penalty) => {
                let mut f = w.dot(&qw);
                if let Some(p) = penalty {
                    let r = p.eq.residual(w);
                    f += p.lambda * r + 0.5 * p.rho * r * r;
                }
                f
            }
            Objective::NegativeSharpe(excess) => {
                -excess.dot(w) / (w.dot(&qw) + VARIANCE_FLOOR).sqrt()
            }
        }
    }

    fn weight_gradient(&self, w: &DVector<f64>) -> DVector<f64> {
        let qw = &self.q * w;
        match &self.objective {
            Objective::Variance(penalty) => {
                let mut g = qw * 2.0;
                if let Some(p) = penalty {
                    let r = p.eq.residual(w);
                    g.axpy(p.lambda + p.rho * r, &p.eq.a, 1.0);
                }
                g
            }
            Objective::NegativeSharpe(excess) => {
                let sigma = (w.dot(&qw) + VARIANCE_FLOOR).sqrt();
                let e = excess.dot(w);
                qw * (e / (sigma * sigma * sigma)) - excess / sigma
            }
        }
    }

    /// Chain rule through the softmax: `∂f/∂xᵢ = wᵢ (gᵢ − wᵀg)`.
    fn logit_gradient(&self, w: &DVector<f64>) -> Vec<f64> {
        let g = self.weight_gradient(w);
        let mean = w.dot(&g);
        w.iter().zip(g.iter()).map(|(wi, gi)| wi * (gi - mean)).collect()
    }
}

impl CostFunction for SimplexProblem {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        Ok(self.value(&softmax(x)))
    }
}

impl Gradient for SimplexProblem {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        Ok(self.logit_gradient(&softmax(x)))
    }
}

struct Run {
    x: Vec<f64>,
    iterations: usize,
    converged: bool,
}

/// Runs L-BFGS from `x0`. A failed run keeps `x0`.
fn run_lbfgs(problem: SimplexProblem, x0: Vec<f64>, max_iterations: usize, tolerance: f64) -> Run {
    let start = logit_norm(&problem, &x0);
    if start <= tolerance {
        return Run {
            x: x0,
            iterations: 0,
            converged: true,
        };
    }

    let max_iters = max_iterations.max(1) as u64;
    match try_run_lbfgs(problem, x0.clone(), max_iters, tolerance) {
        Ok((Some(x), iterations)) => Run {
            x,
            iterations: iterations as usize,
            converged: iterations < max_iters,
        },
        Ok((None, iterations)) => Run {
            x: x0,
            iterations: iterations as usize,
            converged: false,
        },
        Err(err) => {
            tracing::debug!(error = %err, "L-BFGS run stopped early");
            Run {
                x: x0,
                iterations: 0,
                converged: false,
            }
        }
    }
}

fn logit_norm(problem: &SimplexProblem, x: &[f64]) -> f64 {
    problem
        .logit_gradient(&softmax(x))
        .iter()
        .map(|g| g * g)
        .sum::<f64>()
        .sqrt()
}

fn try_run_lbfgs(
    problem: SimplexProblem,
    x0: Vec<f64>,
    max_iters: u64,
    tolerance: f64,
) -> Result<(Option<Vec<f64>>, u64), argmin::core::Error> {
    let linesearch = MoreThuenteLineSearch::new().with_c(1e-4, 0.9)?;
    let solver = LBFGS::new(linesearch, LBFGS_MEMORY).with_tolerance_grad(tolerance)?;

    let res = Executor::new(problem, solver)
        .configure(|state| state.param(x0).max_iters(max_iters))
        .run()?;

    let state = res.state();
    let x = state.get_best_param().or_else(|| state.get_param()).cloned();
    Ok((x, state.get_iter()))
}

/// Active-set refinement of `min xᵀQx` subject to `Ax = b`, `x ≥ 0`,
/// seeded with the support of `seed`, then with every asset if that fails.
fn refine_active_set(
    q: &DMatrix<f64>,
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    seed: &DVector<f64>,
) -> Option<DVector<f64>> {
    let peak = seed.amax();
    let support: Vec<bool> = seed.iter().map(|&x| x > SUPPORT_THRESHOLD * peak).collect();
    if support.iter().all(|&on| on) {
        return refine_from(q, a, b, support);
    }
    refine_from(q, a, b, support).or_else(|| refine_from(q, a, b, vec![true; seed.len()]))
}

/// Each round solves the KKT system on the current support, then drops the
/// most negative weight or adds the most negative reduced cost. Returns
/// `None` when no KKT point is reached.
fn refine_from(
    q: &DMatrix<f64>,
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    mut active: Vec<bool>,
) -> Option<DVector<f64>> {
    let n = q.nrows();
    let m = a.nrows();
    if !active.iter().any(|&on| on) {
        return None;
    }
    let dual_tolerance = DUAL_TOLERANCE * (2.0 * norm_inf(q)).max(1.0);

    for _ in 0..(4 * n + 4) {
        let support: Vec<usize> = (0..n).filter(|&i| active[i]).collect();
        let k = support.len();

        let mut kkt = DMatrix::zeros(k + m, k + m);
        for (r, &i) in support.iter().enumerate() {
            for (c, &j) in support.iter().enumerate() {
                kkt[(r, c)] = 2.0 * q[(i, j)];
            }
            for row in 0..m {
                kkt[(r, k + row)] = a[(row, i)];
                kkt[(k + row, r)] = a[(row, i)];
            }
        }
        let mut rhs = DVector::zeros(k + m);
        rhs.rows_mut(k, m).copy_from(b);

        let svd = kkt.svd(true, true);
        let eps = SVD_EPSILON * svd.singular_values.max().max(1.0);
        let sol = svd.solve(&rhs, eps).ok()?;

        let mut x = DVector::zeros(n);
        for (r, &i) in support.iter().enumerate() {
            x[i] = sol[r];
        }
        if (a * &x - b).amax() > FEASIBILITY_TOLERANCE {
            return None;
        }

        let leaving = support
            .iter()
            .map(|&i| (i, x[i]))
            .filter(|&(_, v)| v < -WEIGHT_TOLERANCE)
            .min_by(|l, r| l.1.total_cmp(&r.1));
        if let Some((i, _)) = leaving {
            active[i] = false;
            if !active.iter().any(|&on| on) {
                return None;
            }
            continue;
        }

        let nu = sol.rows(k, m).into_owned();
        let reduced = q * &x * 2.0 + a.transpose() * nu;
        let entering = (0..n)
            .filter(|&i| !active[i])
            .map(|i| (i, reduced[i]))
            .filter(|&(_, z)| z < -dual_tolerance)
            .min_by(|l, r| l.1.total_cmp(&r.1));
        if let Some((i, _)) = entering {
            active[i] = true;
            continue;
        }

        return Some(x.map(|v| v.max(0.0)));
    }
    None
}

/// `[1ᵀ; aᵀ] x = [1; b]`, or just the budget row without an equality.
fn simplex_constraints(n: usize, eq: Option<&LinearEquality>) -> (DMatrix<f64>, DVector<f64>) {
    match eq {
        None => (DMatrix::from_element(1, n, 1.0), DVector::from_element(1, 1.0)),
        Some(eq) => (
            DMatrix::from_fn(2, n, |r, c| if r == 0 { 1.0 } else { eq.a[c] }),
            DVector::from_vec(vec![1.0, eq.b]),
        ),
    }
}

/// Minimizes `xᵀQx` over the simplex with an optional linear equality.
pub(crate) fn minimize_variance(
    q: &DMatrix<f64>,
    eq: Option<&LinearEquality>,
    x0: DVector<f64>,
    settings: SolverSettings,
) -> Solution {
    let n = q.nrows();
    let budget = settings.max_iterations.max(1);
    let mut x = logits(&project_simplex(&x0));
    let mut used = 0;
    let mut converged;

    match eq {
        None => {
            let problem = SimplexProblem {
                q: q.clone(),
                objective: Objective::Variance(None),
            };
            let run = run_lbfgs(problem, x, budget, settings.tolerance);
            used += run.iterations;
            converged = run.converged;
            x = run.x;
        }
        Some(eq) => {
            let rho0 = 10.0 * norm_inf(q).max(1e-6);
            let mut penalty = Penalty {
                eq: eq.clone(),
                lambda: 0.0,
                rho: rho0,
            };
            let mut previous_violation = f64::INFINITY;
            converged = false;

            for round in 0..PENALTY_ROUNDS {
                let remaining = budget.saturating_sub(used);
                if remaining == 0 {
                    break;
                }
                let problem = SimplexProblem {
                    q: q.clone(),
                    objective: Objective::Variance(Some(penalty.clone())),
                };
                let per_run = (remaining / (PENALTY_ROUNDS - round)).max(1);
                let run = run_lbfgs(problem, x, per_run, settings.tolerance);
                used += run.iterations;
                converged = run.converged;
                x = run.x;

                let r = eq.residual(&softmax(&x));
                if r.abs() <= FEASIBILITY_TOLERANCE {
                    break;
                }
                penalty.lambda += penalty.rho * r;
                if r.abs() > 0.25 * previous_violation && penalty.rho < rho0 * MAX_PENALTY_GROWTH {
                    penalty.rho *= 10.0;
                }
                previous_violation = r.abs();
            }
        }
    }

    let approx = softmax(&x);
    let (rows, rhs) = simplex_constraints(n, eq);
    let (w, exact) = match refine_active_set(q, &rows, &rhs, &approx) {
        Some(w) if w.sum() > 0.0 => {
            let total = w.sum();
            (w / total, true)
        }
        _ => (approx, false),
    };
    let violation = eq.map_or(0.0, |eq| eq.residual(&w).abs());

    Solution {
        x: w,
        iterations: used,
        converged: exact || (converged && violation <= FEASIBILITY_TOLERANCE),
        violation,
    }
}

/// Maximizes the Sharpe ratio over the simplex. When some asset beats the
/// risk-free rate the support found by L-BFGS is refined on the homogenized
/// form `min yᵀQy` s.t. `(μ − rf)ᵀy = 1`, `y ≥ 0`, with `w = y / Σy`.
pub(crate) fn maximize_sharpe(
    mu: &DVector<f64>,
    q: &DMatrix<f64>,
    risk_free_rate: f64,
    x0: DVector<f64>,
    settings: SolverSettings,
) -> Solution {
    let n = mu.len();
    let excess = mu.map(|m| m - risk_free_rate);
    let problem = SimplexProblem {
        q: q.clone(),
        objective: Objective::NegativeSharpe(excess.clone()),
    };
    let run = run_lbfgs(
        problem,
        logits(&project_simplex(&x0)),
        settings.max_iterations,
        settings.tolerance,
    );
    let approx = softmax(&run.x);

    if excess.max() > 0.0 {
        let scale = excess.amax();
        let rows = DMatrix::from_fn(1, n, |_, c| excess[c] / scale);
        if let Some(y) = refine_active_set(q, &rows, &DVector::from_element(1, 1.0), &approx) {
            let total = y.sum();
            if total > 0.0 && total.is_finite() {
                return Solution {
                    x: y / total,
                    iterations: run.iterations,
                    converged: true,
                    violation: 0.0,
                };
            }
        }
        tracing::debug!("homogenized refinement failed; keeping L-BFGS weights");
    }

    Solution {
        x: approx,
        iterations: run.iterations,
        converged: run.converged,
        violation: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn settings() -> SolverSettings {
        SolverSettings {
            max_iterations: 20_000,
            tolerance: 1e-10,
        }
    }

    #[test]
    fn simplex_projection_lands_on_simplex() {
        for v in [
            vec![0.2, 0.3, 0.5],
            vec![3.0, -1.0, 0.5],
            vec![-5.0, -5.0],
            vec![0.0, 0.0, 0.0, 0.0],
            vec![1e9, 1.0],
        ] {
            let p = project_simplex(&DVector::from_vec(v));
            assert_abs_diff_eq!(p.sum(), 1.0, epsilon = 1e-12);
            assert!(p.iter().all(|x| (0.0..=1.0).contains(x)));
        }
    }

    #[test]
    fn softmax_gradient_matches_finite_differences() {
        let problem = SimplexProblem {
            q: DMatrix::from_row_slice(2, 2, &[0.04, 0.01, 0.01, 0.09]),
            objective: Objective::NegativeSharpe(DVector::from_vec(vec![0.04, 0.09])),
        };
        let x = vec![0.3, -0.2];
        let g = problem.gradient(&x).unwrap();
        let h = 1e-6;
        for i in 0..2 {
            let mut up = x.clone();
            up[i] += h;
            let mut down = x.clone();
            down[i] -= h;
            let fd = (problem.cost(&up).unwrap() - problem.cost(&down).unwrap()) / (2.0 * h);
            assert_abs_diff_eq!(g[i], fd, epsilon = 1e-6);
        }
    }

    #[test]
    fn unconstrained_min_variance_matches_inverse_variance() {
        let q = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.09]);
        let sol = minimize_variance(&q, None, DVector::from_element(2, 0.5), settings());
        assert!(sol.converged);
        assert_abs_diff_eq!(sol.x[0], 0.09 / 0.13, epsilon = 1e-9);
        assert_abs_diff_eq!(sol.x[1], 0.04 / 0.13, epsilon = 1e-9);
    }

    #[test]
    fn equality_constraint_is_enforced() {
        let q = DMatrix::from_row_slice(
            3,
            3,
            &[0.04, 0.006, 0.0, 0.006, 0.09, 0.01, 0.0, 0.01, 0.16],
        );
        let mu = DVector::from_vec(vec![0.08, 0.12, 0.20]);
        let target = 0.14;
        let a = mu.map(|m| m - target);
        let scale = a.amax();
        let eq = LinearEquality {
            a: a / scale,
            b: 0.0,
        };
        let sol = minimize_variance(&q, Some(&eq), DVector::from_element(3, 1.0 / 3.0), settings());
        assert!(sol.converged);
        assert_abs_diff_eq!(sol.x.sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mu.dot(&sol.x), target, epsilon = 1e-10);
        assert!(sol.x.iter().all(|w| *w >= 0.0));
    }

    #[test]
    fn refinement_drops_assets_outside_the_optimal_support() {
        // Covariance above the second variance: the unconstrained solution
        // shorts the first asset, so the long-only optimum holds only the second.
        let q = DMatrix::from_row_slice(2, 2, &[1.0, 0.4, 0.4, 0.25]);
        let rows = DMatrix::from_element(1, 2, 1.0);
        let b = DVector::from_element(1, 1.0);
        let w = refine_active_set(&q, &rows, &b, &DVector::from_element(2, 0.5)).unwrap();
        assert_eq!(w[0], 0.0);
        assert_abs_diff_eq!(w[1], 1.0, epsilon = 1e-12);

        // Seeding without the best asset still reaches it through the reduced costs.
        let q = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.01]);
        let w =refine_active_set(&q, &rows, &b, &DVector::from_vec(vec![1.0, 0.0])).unwrap();
        assert_abs_diff_eq!(w[1], 1.0 / 1.01, epsilon = 1e-12);
    }

    #[test]
    fn sharpe_prefers_least_negative_asset() {
        let q = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.04]);
        let mu = DVector::from_vec(vec![0.01, 0.03]);
        let sol = maximize_sharpe(&mu, &q, 0.06, DVector::from_element(2, 0.5), settings());
        assert_abs_diff_eq!(sol.x.sum(), 1.0, epsilon = 1e-9);
        assert!(sol.x[1] > sol.x[0]);
    }

    #[test]
    fn sharpe_refinement_hits_tangency_exactly() {
        let q = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.09]);
        let mu = DVector::from_vec(vec![0.10, 0.15]);
        let sol = maximize_sharpe(&mu, &q, 0.06, DVector::from_element(2, 0.5), settings());
        assert!(sol.converged);
        assert_abs_diff_eq!(sol.x[0], 0.5, epsilon = 1e-10);
        assert_abs_diff_eq!(sol.x[1], 0.5, epsilon = 1e-10);
    }
}
