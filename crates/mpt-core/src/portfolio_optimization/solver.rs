use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::WeightBounds;

pub const DEFAULT_MAX_ITERATIONS: u32 = 500;
pub const DEFAULT_CONVERGENCE_TOLERANCE: f64 = 1e-9;
pub const DEFAULT_FEASIBILITY_TOLERANCE: f64 = 1e-8;

const MSG_SUCCESS: &str = "Optimization terminated successfully";
const MSG_ITERATION_LIMIT: &str = "Iteration limit reached";
const MSG_INCOMPATIBLE: &str = "Equality constraints are incompatible with the bounds";
const MSG_LINE_SEARCH: &str = "Positive directional derivative in line search";
const MSG_NON_FINITE: &str = "Objective is not finite at the current iterate";

// Armijo sufficient-decrease constant and smallest step fraction tried.
const ARMIJO_C1: f64 = 1e-4;
const MIN_STEP: f64 = 1e-10;

// QP subproblem tolerances: bound excess treated as satisfied, smallest
// multiplier change that can block a step, and the relative curvature below
// which a constraint normal counts as spanned by the active ones.
const QP_VIOLATION_TOLERANCE: f64 = 1e-10;
const DUAL_TOLERANCE: f64 = 1e-14;
const DEPENDENCE_TOLERANCE: f64 = 1e-12;

// Bounds closer than this pin the variable.
const PINNED_WIDTH: f64 = 1e-14;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Solver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Cap on outer (SQP) iterations.
    pub max_iterations: u32,
    /// Stop when the objective or the iterate moves less than this.
    pub convergence_tolerance: f64,
    /// Largest constraint violation a converged point may carry.
    pub feasibility_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            convergence_tolerance: DEFAULT_CONVERGENCE_TOLERANCE,
            feasibility_tolerance: DEFAULT_FEASIBILITY_TOLERANCE,
        }
    }
}

/// Linear equality constraint `coefficients . x = rhs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearEquality {
    pub coefficients: Vec<f64>,
    pub rhs: f64,
}

impl LinearEquality {
    /// `sum(x) = 1`
    pub fn sum_to_one(n: usize) -> Self {
        Self {
            coefficients: vec![1.0; n],
            rhs: 1.0,
        }
    }

    /// `x . values = target`
    pub fn dot_equals(values: &[f64], target: f64) -> Self {
        Self {
            coefficients: values.to_vec(),
            rhs: target,
        }
    }
}

/// What a minimizer hands back: the last iterate, whether the backend
/// considers it a solution, and the backend's own message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOutcome {
    pub point: Vec<f64>,
    pub converged: bool,
    pub message: String,
    pub iterations: u32,
}

/// A scalar function of the decision variables.
pub trait Objective {
    fn value(&self, x: &[f64]) -> f64;

    /// Gradient of [`Objective::value`]. Central differences unless overridden.
    fn gradient(&self, x: &[f64]) -> Vec<f64> {
        numerical_gradient(|p| self.value(p), x)
    }
}

impl<F> Objective for F
where
    F: Fn(&[f64]) -> f64,
{
    fn value(&self, x: &[f64]) -> f64 {
        self(x)
    }
}

/// Backend-agnostic constrained minimizer: minimize `objective` from
/// `initial_point` subject to linear equalities and box bounds.
pub trait Minimizer: Send + Sync {
    fn minimize(
        &self,
        objective: &dyn Objective,
        initial_point: &[f64],
        equalities: &[LinearEquality],
        bounds: &[WeightBounds],
        options: &SolverOptions,
    ) -> SolverOutcome;
}

/// Central-difference gradient.
pub fn numerical_gradient(f: impl Fn(&[f64]) -> f64, x: &[f64]) -> Vec<f64> {
    let step_base = f64::EPSILON.cbrt();
    let mut probe = x.to_vec();
    (0..x.len())
        .map(|i| {
            let h = step_base * x[i].abs().max(1.0);
            probe[i] = x[i] + h;
            let up = f(&probe);
            probe[i] = x[i] - h;
            let down = f(&probe);
            probe[i] = x[i];
            (up - down) / (2.0 * h)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// SQP backend
// ---------------------------------------------------------------------------

/// Sequential quadratic programming for linear equalities and box bounds.
///
/// Each iteration solves the quadratic model `min g'd + d'Bd/2` under the
/// linearized (here exact) constraints with a dual active-set method,
/// then backtracks along `d` with an Armijo test. `B` is a damped BFGS
/// approximation, scaled after the first step. An infeasible start is accepted:
/// the first full QP step lands on the feasible set and every later iterate
/// stays there, since constraints are linear and the feasible set convex.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqpSolver;

impl Minimizer for SqpSolver {
    fn minimize(
        &self,
        objective: &dyn Objective,
        initial_point: &[f64],
        equalities: &[LinearEquality],
        bounds: &[WeightBounds],
        options: &SolverOptions,
    ) -> SolverOutcome {
        let n = initial_point.len();
        if bounds.len() != n || equalities.iter().any(|c| c.coefficients.len() != n) {
            return SolverOutcome {
                point: initial_point.to_vec(),
                converged: false,
                message: "Problem dimensions are inconsistent".into(),
                iterations: 0,
            };
        }

        let constraints = Constraints::new(equalities, bounds);
        let tol = options.convergence_tolerance;
        let feas_tol = options.feasibility_tolerance;

        let mut x = DVector::from_column_slice(initial_point);
        let mut f = objective.value(x.as_slice());
        let mut g = DVector::from_vec(objective.gradient(x.as_slice()));
        let mut hess = DMatrix::<f64>::identity(n, n);
        let mut scaled = false;

        for iter in 1..=options.max_iterations {
            let feasible = constraints.violation(&x) <= feas_tol;

            let d = match solve_qp_step(&hess, &g, &x, &constraints) {
                Some(d) => d,
                None => return finish(x, false, MSG_INCOMPATIBLE, iter),
            };
            let target = &x + &d;
            if constraints.violation(&target) > feas_tol {
                return finish(x, false, MSG_INCOMPATIBLE, iter);
            }

            if feasible && d.amax() <= tol {
                return finish(x, true, MSG_SUCCESS, iter);
            }

            let slope = g.dot(&d);
            let (x_new, f_new) = if feasible {
                match backtrack(objective, &x, &d, f, slope) {
                    Some(step) => step,
                    None if -slope <= tol * (1.0 + f.abs()) => {
                        return finish(x, true, MSG_SUCCESS, iter);
                    }
                    None => return finish(x, false, MSG_LINE_SEARCH, iter),
                }
            } else {
                // Restoration: take the full step onto the feasible set.
                let f_target = objective.value(target.as_slice());
                (target, f_target)
            };

            if !f_new.is_finite() {
                return finish(x_new, false, MSG_NON_FINITE, iter);
            }

            let g_new = DVector::from_vec(objective.gradient(x_new.as_slice()));
            let s = &x_new - &x;
            let y = &g_new - &g;
            bfgs_update(&mut hess, &s, &y, &mut scaled);

            let df = (f - f_new).abs();
            trace!(iter, f = f_new, df, step = s.amax(), "sqp iteration");

            x = x_new;
            f = f_new;
            g = g_new;

            if feasible && (df <= tol * (1.0 + f.abs()) || s.amax() <= tol) {
                return finish(x, true, MSG_SUCCESS, iter);
            }
        }

        finish(x, false, MSG_ITERATION_LIMIT, options.max_iterations)
    }
}

fn finish(x: DVector<f64>, converged: bool, message: &str, iterations: u32) -> SolverOutcome {
    debug!(converged, iterations, message, "sqp finished");
    SolverOutcome {
        point: x.as_slice().to_vec(),
        converged,
        message: message.to_string(),
        iterations,
    }
}

/// Halve the step until the Armijo condition holds.
fn backtrack(
    objective: &dyn Objective,
    x: &DVector<f64>,
    d: &DVector<f64>,
    f: f64,
    slope: f64,
) -> Option<(DVector<f64>, f64)> {
    let mut alpha = 1.0;
    while alpha >= MIN_STEP {
        let trial = x + d * alpha;
        let f_trial = objective.value(trial.as_slice());
        if f_trial.is_finite() && f_trial <= f + ARMIJO_C1 * alpha * slope {
            return Some((trial, f_trial));
        }
        alpha *= 0.5;
    }
    None
}

/// Powell-damped BFGS update. The first update rescales the identity by
/// y'y / s'y so that step lengths match the objective's curvature.
fn bfgs_update(hess: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>, scaled: &mut bool) {
    if s.amax() < 1e-14 {
        return;
    }
    let sy = s.dot(y);
    if !*scaled && sy > 0.0 {
        let n = hess.nrows();
        *hess = DMatrix::identity(n, n) * (y.dot(y) / sy);
        *scaled = true;
    }

    let bs = &*hess * s;
    let sbs = s.dot(&bs);
    if sbs <= 0.0 || !sbs.is_finite() {
        return;
    }
    let theta = if sy >= 0.2 * sbs {
        1.0
    } else {
        0.8 * sbs / (sbs - sy)
    };
    let r = y * theta + &bs * (1.0 - theta);
    let sr = s.dot(&r);
    if sr <= 0.0 || !sr.is_finite() {
        return;
    }

    *hess -= &bs * bs.transpose() / sbs;
    *hess += &r * r.transpose() / sr;
    let sym = (&*hess + hess.transpose()) * 0.5;
    *hess = sym;
}

// ---------------------------------------------------------------------------
// Constraint set and QP subproblem
// ---------------------------------------------------------------------------

struct Constraints {
    matrix: DMatrix<f64>,
    rhs: DVector<f64>,
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl Constraints {
    fn new(equalities: &[LinearEquality], bounds: &[WeightBounds]) -> Self {
        let m = equalities.len();
        let n = bounds.len();
        Self {
            matrix: DMatrix::from_fn(m, n, |k, j| equalities[k].coefficients[j]),
            rhs: DVector::from_fn(m, |k, _| equalities[k].rhs),
            lower: DVector::from_fn(n, |j, _| bounds[j].0),
            upper: DVector::from_fn(n, |j, _| bounds[j].1),
        }
    }

    /// Largest equality residual or bound excess at `x`.
    fn violation(&self, x: &DVector<f64>) -> f64 {
        let eq = if self.matrix.nrows() > 0 {
            (&self.matrix * x - &self.rhs).amax()
        } else {
            0.0
        };
        let bound = x
            .iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .map(|(xi, (lo, hi))| (lo - xi).max(xi - hi).max(0.0))
            .fold(0.0_f64, f64::max);
        eq.max(bound)
    }

    /// All constraints as rows `normal . y (= or >=) rhs`, equalities first.
    /// A variable whose bounds coincide becomes an equality.
    fn rows(&self) -> (Vec<Row>, usize) {
        let n = self.lower.len();
        let mut equalities: Vec<Row> = (0..self.matrix.nrows())
            .map(|k| Row {
                normal: self.matrix.row(k).transpose(),
                rhs: self.rhs[k],
            })
            .collect();
        let mut inequalities = Vec::with_capacity(2 * n);
        for i in 0..n {
            let (lo, hi) = (self.lower[i], self.upper[i]);
            if hi - lo <= PINNED_WIDTH {
                equalities.push(Row::unit(n, i, 1.0, lo));
                continue;
            }
            if lo.is_finite() {
                inequalities.push(Row::unit(n, i, 1.0, lo));
            }
            if hi.is_finite() {
                inequalities.push(Row::unit(n, i, -1.0, -hi));
            }
        }
        let n_eq = equalities.len();
        equalities.extend(inequalities);
        (equalities, n_eq)
    }
}

/// `normal . y = rhs` or `normal . y >= rhs`.
struct Row {
    normal: DVector<f64>,
    rhs: f64,
}

impl Row {
    fn unit(n: usize, i: usize, sign: f64, rhs: f64) -> Self {
        let mut normal = DVector::zeros(n);
        normal[i] = sign;
        Self { normal, rhs }
    }

    fn slack(&self, y: &DVector<f64>) -> f64 {
        self.normal.dot(y) - self.rhs
    }
}

/// Primal and dual directions for adding one constraint to the active set.
struct AddStep {
    /// Primal move per unit of the new multiplier; keeps active rows satisfied.
    primal: DVector<f64>,
    /// Change of the active multipliers per unit of the new one, negated.
    dual: DVector<f64>,
    /// `normal . primal`; zero when the normal is spanned by the active rows.
    curvature: f64,
}

impl AddStep {
    fn has_primal(&self, normal: &DVector<f64>, g_inv: &DMatrix<f64>) -> bool {
        let scale = normal.dot(&(g_inv * normal));
        self.curvature > DEPENDENCE_TOLERANCE * scale.max(f64::MIN_POSITIVE)
    }
}

fn add_step(
    g_inv: &DMatrix<f64>,
    rows: &[Row],
    active: &[usize],
    normal: &DVector<f64>,
) -> Option<AddStep> {
    let g_inv_n = g_inv * normal;
    let k = active.len();
    let (primal, dual) = if k == 0 {
        (g_inv_n, DVector::zeros(0))
    } else {
        let g_inv_active: Vec<DVector<f64>> =
            active.iter().map(|&j| g_inv * &rows[j].normal).collect();
        let gram = DMatrix::from_fn(k, k, |a, b| rows[active[a]].normal.dot(&g_inv_active[b]));
        let rhs = DVector::from_fn(k, |a, _| rows[active[a]].normal.dot(&g_inv_n));
        let dual = gram.lu().solve(&rhs)?;
        let mut primal = g_inv_n;
        for (a, col) in g_inv_active.iter().enumerate() {
            primal -= col * dual[a];
        }
        (primal, dual)
    };
    let curvature = primal.dot(normal);
    Some(AddStep {
        primal,
        dual,
        curvature,
    })
}

/// Inverse of the model Hessian, with a diagonal shift if it lost definiteness.
fn model_inverse(hess: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(chol) = hess.clone().cholesky() {
        return Some(chol.inverse());
    }
    let n = hess.nrows();
    let shift = 1e-8 * hess.diagonal().amax().max(1.0);
    (hess + DMatrix::identity(n, n) * shift)
        .cholesky()
        .map(|chol| chol.inverse())
}

/// Solve `min g'd + d'Bd/2` s.t. `E(x + d) = b`, `lower <= x + d <= upper`.
///
/// Dual active-set method (Goldfarb-Idnani) on `y = x + d`: start from the
/// unconstrained minimizer, add the equalities, then repeatedly add the most
/// violated bound, dropping active bounds whose multiplier would turn
/// negative. No feasible start is needed. `None` means the dual is unbounded,
/// i.e. no point satisfies the constraints.
fn solve_qp_step(
    hess: &DMatrix<f64>,
    g: &DVector<f64>,
    x: &DVector<f64>,
    constraints: &Constraints,
) -> Option<DVector<f64>> {
    let g_inv = model_inverse(hess)?;
    let (rows, n_eq) = constraints.rows();

    // Unconstrained minimizer of (g - Bx)'y + y'By/2.
    let linear = g - hess * x;
    let mut y = -(&g_inv * linear);
    let mut active: Vec<usize> = Vec::with_capacity(rows.len());
    let mut multipliers: Vec<f64> = Vec::with_capacity(rows.len());

    for k in 0..n_eq {
        let sign = if rows[k].slack(&y) > 0.0 { -1.0 } else { 1.0 };
        let normal = &rows[k].normal * sign;
        let slack = sign * rows[k].slack(&y);
        let step = add_step(&g_inv, &rows, &active, &normal)?;
        if !step.has_primal(&normal, &g_inv) {
            // Dependent on earlier equalities: consistent or contradictory.
            if slack.abs() <= QP_VIOLATION_TOLERANCE * (1.0 + rows[k].rhs.abs()) {
                continue;
            }
            return None;
        }
        let t = -slack / step.curvature;
        y += &step.primal * t;
        for (m, r) in multipliers.iter_mut().zip(step.dual.iter()) {
            *m -= t * r;
        }
        active.push(k);
        multipliers.push(t);
    }

    let max_rounds = 4 * rows.len() + 20;
    for _ in 0..max_rounds {
        let violated = (n_eq..rows.len())
            .filter(|i| !active.contains(i))
            .map(|i| (i, rows[i].slack(&y)))
            .filter(|(_, s)| *s < -QP_VIOLATION_TOLERANCE)
            .min_by(|a, b| a.1.total_cmp(&b.1));
        let Some((p, mut slack)) = violated else {
            return Some(y - x);
        };

        let mut new_multiplier = 0.0;
        let mut added = false;
        for _ in 0..=active.len() {
            let step = add_step(&g_inv, &rows, &active, &rows[p].normal)?;

            // Largest dual step keeping active bound multipliers non-negative.
            let mut dual_limit = f64::INFINITY;
            let mut blocking = None;
            for (pos, &j) in active.iter().enumerate() {
                if j < n_eq || step.dual[pos] <= DUAL_TOLERANCE {
                    continue;
                }
                let ratio = multipliers[pos] / step.dual[pos];
                if ratio < dual_limit {
                    dual_limit = ratio;
                    blocking = Some(pos);
                }
            }
            let primal_limit = if step.has_primal(&rows[p].normal, &g_inv) {
                -slack / step.curvature
            } else {
                f64::INFINITY
            };

            let t = dual_limit.min(primal_limit);
            if !t.is_finite() {
                trace!(constraint = p, "qp dual unbounded");
                return None;
            }
            if primal_limit.is_finite() {
                y += &step.primal * t;
            }
            for (m, r) in multipliers.iter_mut().zip(step.dual.iter()) {
                *m -= t * r;
            }
            new_multiplier += t;

            if primal_limit <= dual_limit {
                active.push(p);
                multipliers.push(new_multiplier);
                added = true;
                break;
            }
            let pos = blocking?;
            active.remove(pos);
            multipliers.remove(pos);
            slack = rows[p].slack(&y);
            if slack >= -QP_VIOLATION_TOLERANCE {
                active.push(p);
                multipliers.push(new_multiplier);
                added = true;
                break;
            }
        }
        if !added {
            break;
        }
    }

    // Round cap: accept the iterate only if it is feasible.
    let d = y - x;
    if constraints.violation(&(x + &d)) <= 1e-9 {
        return Some(d);
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
