use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;

use super::covariance::{condition_covariance, matrix_from_rows, ConditionerOptions};
use super::frontier::{sweep_frontier, FrontierOptions, FrontierPoint};
use super::solver::{LinearEquality, Minimizer, Objective, SolverOptions, SqpSolver};
use super::statistics::{annualize, portfolio_stats};
use crate::error::MptError;
use crate::time_value::{check_periods, MONTHS_PER_YEAR};
use crate::types::{with_metadata, ComputationOutput, Rate, WeightBounds, WeightVector};
use crate::MptResult;

const CONCENTRATION_WARNING: f64 = 0.40;
const SHORT_WARNING: f64 = -0.10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Input to every optimizer operation. All rates share one period unit
/// (monthly in the usual workflow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationInput {
    /// Asset identifiers, unique.
    pub asset_names: Vec<String>,
    /// Expected period return per asset.
    pub mean_returns: Vec<Rate>,
    /// N x N covariance matrix of period returns.
    pub covariance: Vec<Vec<f64>>,
    /// Period risk-free rate.
    pub risk_free_rate: Rate,
    /// (lower, upper) per asset weight; a negative lower bound allows shorts.
    pub bounds: Vec<WeightBounds>,
    #[serde(default)]
    pub solver: SolverOptions,
    #[serde(default)]
    pub conditioner: ConditionerOptions,
}

/// Result of a single optimizer invocation.
///
/// `converged` is the solver's own verdict. When it is false the weights are
/// whatever the solver last held and may violate the constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionResult {
    pub weights: WeightVector,
    pub period_return: Rate,
    pub period_volatility: Rate,
    /// Negative infinity for a zero-volatility portfolio.
    pub period_sharpe: f64,
    pub converged: bool,
    pub diagnostic_message: String,
}

/// A single asset weight with risk/return contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetWeight {
    pub name: String,
    pub weight: f64,
    /// Weight times expected return.
    pub contribution_to_return: f64,
    /// Weight times marginal risk contribution; sums to portfolio volatility.
    pub contribution_to_risk: f64,
}

/// A point solution with per-asset breakdown and annualized figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatedSolution {
    pub solution: SolutionResult,
    pub asset_weights: Vec<AssetWeight>,
    pub annual_return: Rate,
    pub annual_volatility: Rate,
}

/// Everything the reporting layer renders for one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioReport {
    /// Maximum Sharpe ratio portfolio.
    pub max_sharpe: AnnotatedSolution,
    /// Global minimum variance portfolio.
    pub min_variance: AnnotatedSolution,
    /// Converged frontier points, by increasing target return.
    pub frontier: Vec<FrontierPoint>,
}

/// Options for [`optimize_portfolio`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportOptions {
    pub frontier: FrontierOptions,
    /// Periods per year used to annualize the point solutions.
    pub periods_per_year: u32,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            frontier: FrontierOptions::default(),
            periods_per_year: MONTHS_PER_YEAR,
        }
    }
}

/// Validated input with a conditioned covariance matrix, shared by all
/// solves on one input.
pub(crate) struct PreparedProblem<'a> {
    pub(crate) input: &'a OptimizationInput,
    pub(crate) covariance: DMatrix<f64>,
}

impl<'a> PreparedProblem<'a> {
    pub(crate) fn new(input: &'a OptimizationInput) -> MptResult<Self> {
        validate_input(input)?;
        let raw = matrix_from_rows(&input.covariance);
        let covariance = condition_covariance(&raw, input.conditioner.eigenvalue_floor);
        Ok(Self { input, covariance })
    }

    fn n(&self) -> usize {
        self.input.asset_names.len()
    }

    fn mean_returns(&self) -> &[f64] {
        &self.input.mean_returns
    }
}

// ---------------------------------------------------------------------------
// Objectives
// ---------------------------------------------------------------------------

/// Portfolio volatility, sqrt(w' Sigma w).
struct VolatilityObjective<'a> {
    covariance: &'a DMatrix<f64>,
}

impl Objective for VolatilityObjective<'_> {
    fn value(&self, x: &[f64]) -> f64 {
        super::statistics::portfolio_volatility(x, self.covariance)
    }

    fn gradient(&self, x: &[f64]) -> Vec<f64> {
        let w = DVector::from_column_slice(x);
        let sigma_w = self.covariance * &w;
        let vol = w.dot(&sigma_w).max(0.0).sqrt();
        if vol > 0.0 {
            (sigma_w / vol).as_slice().to_vec()
        } else {
            vec![0.0; x.len()]
        }
    }
}

/// Negative Sharpe ratio; `+inf` at zero volatility.
struct NegativeSharpeObjective<'a> {
    mean_returns: &'a [f64],
    covariance: &'a DMatrix<f64>,
    risk_free_rate: Rate,
}

impl Objective for NegativeSharpeObjective<'_> {
    fn value(&self, x: &[f64]) -> f64 {
        -portfolio_stats(x, self.mean_returns, self.covariance, self.risk_free_rate).period_sharpe
    }

    fn gradient(&self, x: &[f64]) -> Vec<f64> {
        let w = DVector::from_column_slice(x);
        let sigma_w = self.covariance * &w;
        let vol = w.dot(&sigma_w).max(0.0).sqrt();
        if vol <= 0.0 {
            return vec![0.0; x.len()];
        }
        let excess = super::statistics::dot(x, self.mean_returns) - self.risk_free_rate;
        // d(-S)/dw = -(mu * vol - excess * Sigma w / vol) / vol^2
        (0..x.len())
            .map(|i| -(self.mean_returns[i] * vol - excess * sigma_w[i] / vol) / (vol * vol))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Maximum Sharpe ratio portfolio under sum-to-one and the box bounds.
pub fn max_sharpe(input: &OptimizationInput) -> MptResult<ComputationOutput<SolutionResult>> {
    max_sharpe_with(input, &SqpSolver)
}

/// [`max_sharpe`] with an explicit solver backend.
pub fn max_sharpe_with(
    input: &OptimizationInput,
    solver: &dyn Minimizer,
) -> MptResult<ComputationOutput<SolutionResult>> {
    let start = Instant::now();
    let problem = PreparedProblem::new(input)?;
    let solution = solve_max_sharpe(&problem, solver);
    Ok(wrap_solution(
        "Maximum Sharpe Ratio (SQP)",
        "negative_sharpe",
        input,
        None,
        solution,
        start,
    ))
}

/// Global minimum variance portfolio under sum-to-one and the box bounds.
pub fn min_variance(input: &OptimizationInput) -> MptResult<ComputationOutput<SolutionResult>> {
    min_variance_with(input, &SqpSolver)
}

/// [`min_variance`] with an explicit solver backend.
pub fn min_variance_with(
    input: &OptimizationInput,
    solver: &dyn Minimizer,
) -> MptResult<ComputationOutput<SolutionResult>> {
    let start = Instant::now();
    let problem = PreparedProblem::new(input)?;
    let solution = solve_min_variance(&problem, solver);
    Ok(wrap_solution(
        "Global Minimum Variance (SQP)",
        "volatility",
        input,
        None,
        solution,
        start,
    ))
}

/// Minimum variance portfolio whose expected return equals `target_return`.
///
/// An unreachable target is not rejected up front; it shows up as
/// `converged = false` from the solver.
pub fn min_variance_for_target(
    input: &OptimizationInput,
    target_return: Rate,
) -> MptResult<ComputationOutput<SolutionResult>> {
    min_variance_for_target_with(input, target_return, &SqpSolver)
}

/// [`min_variance_for_target`] with an explicit solver backend.
pub fn min_variance_for_target_with(
    input: &OptimizationInput,
    target_return: Rate,
    solver: &dyn Minimizer,
) -> MptResult<ComputationOutput<SolutionResult>> {
    let start = Instant::now();
    if !target_return.is_finite() {
        return Err(MptError::InvalidInput {
            field: "target_return".into(),
            reason: "Target return must be finite".into(),
        });
    }
    let problem = PreparedProblem::new(input)?;
    let solution = solve_min_variance_for_target(&problem, target_return, solver);
    Ok(wrap_solution(
        "Minimum Variance at Target Return (SQP)",
        "volatility",
        input,
        Some(target_return),
        solution,
        start,
    ))
}

/// Run maximum Sharpe, minimum variance and the frontier sweep on one input,
/// with per-asset contributions and annualized figures for both point
/// solutions.
pub fn optimize_portfolio(
    input: &OptimizationInput,
    options: &ReportOptions,
) -> MptResult<ComputationOutput<PortfolioReport>> {
    let start = Instant::now();
    check_periods(options.periods_per_year)?;
    let problem = PreparedProblem::new(input)?;
    let solver = SqpSolver;

    let max_sharpe = annotate(&problem, solve_max_sharpe(&problem, &solver), options)?;
    let min_variance = annotate(&problem, solve_min_variance(&problem, &solver), options)?;
    let sweep = sweep_frontier(&problem, &options.frontier, &solver)?;

    let mut warnings = Vec::new();
    warnings.extend(
        solution_warnings(input, &max_sharpe.solution)
            .into_iter()
            .map(|w| format!("Max Sharpe: {}", w)),
    );
    warnings.extend(
        solution_warnings(input, &min_variance.solution)
            .into_iter()
            .map(|w| format!("Min variance: {}", w)),
    );
    warnings.extend(sweep.warnings());

    let output = PortfolioReport {
        max_sharpe,
        min_variance,
        frontier: sweep.points,
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Markowitz Mean-Variance Optimization (SQP)",
        &serde_json::json!({
            "n_assets": input.asset_names.len(),
            "risk_free_rate": input.risk_free_rate,
            "max_iterations": input.solver.max_iterations,
            "eigenvalue_floor": input.conditioner.eigenvalue_floor,
            "frontier_points": options.frontier.point_count,
            "frontier_upper_multiplier": options.frontier.upper_multiplier,
            "periods_per_year": options.periods_per_year,
        }),
        warnings,
        elapsed,
        output,
    ))
}

// ---------------------------------------------------------------------------
// Core optimization routines
// ---------------------------------------------------------------------------

pub(crate) fn solve_max_sharpe(problem: &PreparedProblem, solver: &dyn Minimizer) -> SolutionResult {
    let objective = NegativeSharpeObjective {
        mean_returns: problem.mean_returns(),
        covariance: &problem.covariance,
        risk_free_rate: problem.input.risk_free_rate,
    };
    let constraints = [LinearEquality::sum_to_one(problem.n())];
    run(problem, &objective, &constraints, solver)
}

pub(crate) fn solve_min_variance(problem: &PreparedProblem, solver: &dyn Minimizer) -> SolutionResult {
    let objective = VolatilityObjective {
        covariance: &problem.covariance,
    };
    let constraints = [LinearEquality::sum_to_one(problem.n())];
    run(problem, &objective, &constraints, solver)
}

pub(crate) fn solve_min_variance_for_target(
    problem: &PreparedProblem,
    target_return: Rate,
    solver: &dyn Minimizer,
) -> SolutionResult {
    let objective = VolatilityObjective {
        covariance: &problem.covariance,
    };
    let constraints = [
        LinearEquality::sum_to_one(problem.n()),
        LinearEquality::dot_equals(problem.mean_returns(), target_return),
    ];
    run(problem, &objective, &constraints, solver)
}

/// Minimize from equal weights and score the solver's final iterate.
fn run(
    problem: &PreparedProblem,
    objective: &dyn Objective,
    constraints: &[LinearEquality],
    solver: &dyn Minimizer,
) -> SolutionResult {
    let init = equal_weights(problem.n());
    let outcome = solver.minimize(
        objective,
        &init,
        constraints,
        &problem.input.bounds,
        &problem.input.solver,
    );
    let stats = portfolio_stats(
        &outcome.point,
        problem.mean_returns(),
        &problem.covariance,
        problem.input.risk_free_rate,
    );
    SolutionResult {
        weights: outcome.point,
        period_return: stats.period_return,
        period_volatility: stats.period_volatility,
        period_sharpe: stats.period_sharpe,
        converged: outcome.converged,
        diagnostic_message: outcome.message,
    }
}

fn annotate(
    problem: &PreparedProblem,
    solution: SolutionResult,
    options: &ReportOptions,
) -> MptResult<AnnotatedSolution> {
    let input = problem.input;
    let w = DVector::from_column_slice(&solution.weights);
    let sigma_w = &problem.covariance * &w;
    let vol = solution.period_volatility;

    let asset_weights = input
        .asset_names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mcr = if vol > 0.0 { sigma_w[i] / vol } else { 0.0 };
            AssetWeight {
                name: name.clone(),
                weight: w[i],
                contribution_to_return: w[i] * input.mean_returns[i],
                contribution_to_risk: w[i] * mcr,
            }
        })
        .collect();

    let (annual_return, annual_volatility) =
        annualize(solution.period_return, vol, options.periods_per_year)?;

    Ok(AnnotatedSolution {
        solution,
        asset_weights,
        annual_return,
        annual_volatility,
    })
}

fn wrap_solution(
    methodology: &str,
    objective: &str,
    input: &OptimizationInput,
    target_return: Option<Rate>,
    solution: SolutionResult,
    start: Instant,
) -> ComputationOutput<SolutionResult> {
    let warnings = solution_warnings(input, &solution);
    let elapsed = start.elapsed().as_micros() as u64;
    with_metadata(
        methodology,
        &serde_json::json!({
            "n_assets": input.asset_names.len(),
            "objective": objective,
            "risk_free_rate": input.risk_free_rate,
            "target_return": target_return,
            "max_iterations": input.solver.max_iterations,
            "eigenvalue_floor": input.conditioner.eigenvalue_floor,
            "initial_guess": "equal_weights",
        }),
        warnings,
        elapsed,
        solution,
    )
}

fn solution_warnings(input: &OptimizationInput, solution: &SolutionResult) -> Vec<String> {
    let mut warnings = Vec::new();
    if !solution.converged {
        warnings.push(format!(
            "Solver did not converge ({}); weights are unreliable",
            solution.diagnostic_message
        ));
        return warnings;
    }
    for (name, w) in input.asset_names.iter().zip(solution.weights.iter()) {
        if *w > CONCENTRATION_WARNING {
            warnings.push(format!("Concentrated position: {} has weight {:.4}", name, w));
        }
        if *w < SHORT_WARNING {
            warnings.push(format!("Short position: {} has weight {:.4}", name, w));
        }
    }
    warnings
}

/// Equal weights for n assets.
fn equal_weights(n: usize) -> Vec<f64> {
    vec![1.0 / n as f64; n]
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_input(input: &OptimizationInput) -> MptResult<()> {
    let n = input.asset_names.len();
    if n < 2 {
        return Err(MptError::InsufficientData(
            "At least two assets required for portfolio optimization".into(),
        ));
    }

    let mut seen = HashSet::new();
    for name in &input.asset_names {
        if !seen.insert(name.as_str()) {
            return Err(MptError::InvalidInput {
                field: "asset_names".into(),
                reason: format!("Duplicate asset name '{}'", name),
            });
        }
    }

    if input.mean_returns.len() != n {
        return Err(MptError::InvalidInput {
            field: "mean_returns".into(),
            reason: format!("Expected {} returns but got {}", n, input.mean_returns.len()),
        });
    }
    if let Some(i) = input.mean_returns.iter().position(|r| !r.is_finite()) {
        return Err(MptError::InvalidInput {
            field: "mean_returns".into(),
            reason: format!("Return {} is not finite", i),
        });
    }

    if !input.risk_free_rate.is_finite() {
        return Err(MptError::InvalidInput {
            field: "risk_free_rate".into(),
            reason: "Risk-free rate must be finite".into(),
        });
    }

    validate_covariance_matrix(&input.covariance, n)?;
    validate_bounds(&input.bounds, n)?;

    let opts = &input.solver;
    if opts.max_iterations == 0 {
        return Err(MptError::InvalidInput {
            field: "solver.max_iterations".into(),
            reason: "Must be > 0".into(),
        });
    }
    let positive = |v: f64| v.is_finite() && v > 0.0;
    if !positive(opts.convergence_tolerance) || !positive(opts.feasibility_tolerance) {
        return Err(MptError::InvalidInput {
            field: "solver".into(),
            reason: "Tolerances must be positive".into(),
        });
    }
    let floor = input.conditioner.eigenvalue_floor;
    if !floor.is_finite() || floor < 0.0 {
        return Err(MptError::InvalidInput {
            field: "conditioner.eigenvalue_floor".into(),
            reason: "Eigenvalue floor must be finite and non-negative".into(),
        });
    }

    Ok(())
}

#[allow(clippy::needless_range_loop)]
fn validate_covariance_matrix(cov: &[Vec<f64>], n: usize) -> MptResult<()> {
    if cov.len() != n {
        return Err(MptError::InvalidInput {
            field: "covariance".into(),
            reason: format!("Expected {}x{} matrix but got {} rows", n, n, cov.len()),
        });
    }
    for (i, row) in cov.iter().enumerate() {
        if row.len() != n {
            return Err(MptError::InvalidInput {
                field: "covariance".into(),
                reason: format!("Row {} has {} columns, expected {}", i, row.len(), n),
            });
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(MptError::InvalidInput {
                field: "covariance".into(),
                reason: format!("Row {} has a non-finite entry", i),
            });
        }
    }
    let scale = cov
        .iter()
        .flatten()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let tolerance = 1e-10 * scale.max(1e-12);
    for i in 0..n {
        for j in (i + 1)..n {
            if (cov[i][j] - cov[j][i]).abs() > tolerance {
                return Err(MptError::InvalidInput {
                    field: "covariance".into(),
                    reason: format!(
                        "Not symmetric: [{},{}]={} != [{},{}]={}",
                        i, j, cov[i][j], j, i, cov[j][i]
                    ),
                });
            }
        }
    }
    Ok(())
}

fn validate_bounds(bounds: &[WeightBounds], n: usize) -> MptResult<()> {
    if bounds.len() != n {
        return Err(MptError::InvalidInput {
            field: "bounds".into(),
            reason: format!("Expected {} bounds but got {}", n, bounds.len()),
        });
    }
    for (i, (lo, hi)) in bounds.iter().enumerate() {
        if lo.is_nan() || hi.is_nan() || lo > hi {
            return Err(MptError::InvalidInput {
                field: format!("bounds[{}]", i),
                reason: format!("Invalid range ({}, {})", lo, hi),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
