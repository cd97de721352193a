use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::mean_variance::{solve_min_variance_for_target, OptimizationInput, PreparedProblem};
use super::solver::{Minimizer, SqpSolver};
use crate::error::MptError;
use crate::types::{with_metadata, ComputationOutput, Rate, WeightVector};
use crate::MptResult;

pub const DEFAULT_POINT_COUNT: usize = 40;
pub const DEFAULT_UPPER_MULTIPLIER: f64 = 1.3;

const NO_FEASIBLE_FRONTIER: &str = "No feasible frontier under current bounds";

/// Frontier sweep configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontierOptions {
    /// Number of target returns in the grid.
    pub point_count: usize,
    /// The grid ends at `upper_multiplier * max(mean_returns)`.
    pub upper_multiplier: f64,
}

impl Default for FrontierOptions {
    fn default() -> Self {
        Self {
            point_count: DEFAULT_POINT_COUNT,
            upper_multiplier: DEFAULT_UPPER_MULTIPLIER,
        }
    }
}

/// A converged minimum-variance portfolio at one target return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub target_return: Rate,
    pub weights: WeightVector,
    pub period_return: Rate,
    pub period_volatility: Rate,
    pub period_sharpe: f64,
}

/// Converged points plus how many targets were requested.
pub(crate) struct FrontierSweep {
    pub(crate) points: Vec<FrontierPoint>,
    requested: usize,
}

impl FrontierSweep {
    pub(crate) fn warnings(&self) -> Vec<String> {
        if self.points.is_empty() {
            vec![NO_FEASIBLE_FRONTIER.to_string()]
        } else if self.points.len() < self.requested {
            vec![format!(
                "{} of {} frontier targets did not converge and were omitted",
                self.requested - self.points.len(),
                self.requested
            )]
        } else {
            Vec::new()
        }
    }
}

/// Trace the efficient frontier: minimum-variance portfolios over an evenly
/// spaced grid of target returns from `min(mu)` to `upper_multiplier * max(mu)`.
///
/// Targets the solver cannot reach are left out, so the curve may be shorter
/// than `point_count` or empty. Points are ordered by target return.
pub fn efficient_frontier(
    input: &OptimizationInput,
    options: &FrontierOptions,
) -> MptResult<ComputationOutput<Vec<FrontierPoint>>> {
    efficient_frontier_with(input, options, &SqpSolver)
}

/// [`efficient_frontier`] with an explicit solver backend.
pub fn efficient_frontier_with(
    input: &OptimizationInput,
    options: &FrontierOptions,
    solver: &dyn Minimizer,
) -> MptResult<ComputationOutput<Vec<FrontierPoint>>> {
    let start = Instant::now();
    let problem = PreparedProblem::new(input)?;
    let sweep = sweep_frontier(&problem, options, solver)?;
    let warnings = sweep.warnings();

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Efficient Frontier (minimum variance per target return)",
        &serde_json::json!({
            "n_assets": input.asset_names.len(),
            "point_count": options.point_count,
            "upper_multiplier": options.upper_multiplier,
            "risk_free_rate": input.risk_free_rate,
            "parallel": cfg!(feature = "parallel"),
        }),
        warnings,
        elapsed,
        sweep.points,
    ))
}

/// Evenly spaced, ascending target returns spanning
/// `[min(mu), upper_multiplier * max(mu)]`.
///
/// The endpoints are ordered before spacing so the grid never descends, which
/// matters when every mean return is negative. A degenerate span collapses to
/// a single target.
pub fn target_grid(mean_returns: &[f64], options: &FrontierOptions) -> Vec<Rate> {
    if mean_returns.is_empty() || options.point_count == 0 {
        return Vec::new();
    }
    let min_mu = mean_returns.iter().copied().fold(f64::INFINITY, f64::min);
    let max_mu = mean_returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let a = min_mu;
    let b = options.upper_multiplier * max_mu;
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

    if options.point_count == 1 || hi <= lo {
        return vec![lo];
    }
    let step = (hi - lo) / (options.point_count - 1) as f64;
    (0..options.point_count)
        .map(|k| {
            if k == options.point_count - 1 {
                hi
            } else {
                lo + step * k as f64
            }
        })
        .collect()
}

pub(crate) fn sweep_frontier(
    problem: &PreparedProblem,
    options: &FrontierOptions,
    solver: &dyn Minimizer,
) -> MptResult<FrontierSweep> {
    validate_options(options)?;
    let grid = target_grid(&problem.input.mean_returns, options);

    let solve = |target: &Rate| -> Option<FrontierPoint> {
        let solution = solve_min_variance_for_target(problem, *target, solver);
        if !solution.converged {
            debug!(
                target_return = *target,
                message = %solution.diagnostic_message,
                "dropping frontier target"
            );
            return None;
        }
        Some(FrontierPoint {
            target_return: *target,
            weights: solution.weights,
            period_return: solution.period_return,
            period_volatility: solution.period_volatility,
            period_sharpe: solution.period_sharpe,
        })
    };

    // Indexed collection keeps grid order on both paths.
    #[cfg(feature = "parallel")]
    let solved: Vec<Option<FrontierPoint>> = grid.par_iter().map(solve).collect();
    #[cfg(not(feature = "parallel"))]
    let solved: Vec<Option<FrontierPoint>> = grid.iter().map(solve).collect();

    let points: Vec<FrontierPoint> = solved.into_iter().flatten().collect();
    debug!(requested = grid.len(), kept = points.len(), "frontier sweep done");

    Ok(FrontierSweep {
        points,
        requested: grid.len(),
    })
}

fn validate_options(options: &FrontierOptions) -> MptResult<()> {
    if options.point_count == 0 {
        return Err(MptError::InvalidInput {
            field: "frontier.point_count".into(),
            reason: "At least one frontier point required".into(),
        });
    }
    if !options.upper_multiplier.is_finite() {
        return Err(MptError::InvalidInput {
            field: "frontier.upper_multiplier".into(),
            reason: "Upper multiplier must be finite".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
