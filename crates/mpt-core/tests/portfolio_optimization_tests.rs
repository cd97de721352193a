use mpt_core::portfolio_optimization::covariance::ConditionerOptions;
use mpt_core::portfolio_optimization::frontier::{
    efficient_frontier, efficient_frontier_with, FrontierOptions,
};
use mpt_core::portfolio_optimization::mean_variance::{
    max_sharpe, max_sharpe_with, min_variance, min_variance_for_target, optimize_portfolio,
    OptimizationInput, ReportOptions,
};
use mpt_core::portfolio_optimization::solver::{
    LinearEquality, Minimizer, Objective, SolverOptions, SolverOutcome,
};
use mpt_core::portfolio_optimization::statistics::{annualize, portfolio_stats};
use mpt_core::{MptError, WeightBounds};
use nalgebra::DMatrix;

// ===========================================================================
// Fixtures
// ===========================================================================

fn two_asset_input() -> OptimizationInput {
    // Monthly figures: 1% and 2% expected return, 2% and 3% volatility
    OptimizationInput {
        asset_names: vec!["Fixed income fund".into(), "Equity fund".into()],
        mean_returns: vec![0.01, 0.02],
        covariance: vec![vec![0.0004, 0.0001], vec![0.0001, 0.0009]],
        risk_free_rate: 0.005,
        bounds: vec![(0.0, 1.0), (0.0, 1.0)],
        solver: SolverOptions::default(),
        conditioner: ConditionerOptions::default(),
    }
}

fn four_asset_input() -> OptimizationInput {
    let vols = [0.03, 0.05, 0.07, 0.02];
    let corr = [
        [1.0, 0.4, 0.3, 0.1],
        [0.4, 1.0, 0.6, 0.0],
        [0.3, 0.6, 1.0, -0.1],
        [0.1, 0.0, -0.1, 1.0],
    ];
    let covariance = (0..4)
        .map(|i| (0..4).map(|j| corr[i][j] * vols[i] * vols[j]).collect())
        .collect();
    OptimizationInput {
        asset_names: vec!["PETR4".into(), "VALE3".into(), "MGLU3".into(), "IMAB11".into()],
        mean_returns: vec![0.012, 0.015, 0.02, 0.008],
        covariance,
        risk_free_rate: 0.0085,
        bounds: vec![(0.0, 1.0); 4],
        solver: SolverOptions::default(),
        conditioner: ConditionerOptions::default(),
    }
}

/// Six assets under a one-factor model: Sigma = beta beta' sm^2 + diag(e^2).
fn six_asset_factor_input() -> OptimizationInput {
    let betas = [0.6, 0.9, 1.1, 1.4, 0.3, 1.0];
    let residual = [0.02, 0.03, 0.035, 0.05, 0.015, 0.04];
    let market_variance = 0.04_f64.powi(2);
    let covariance = (0..6)
        .map(|i| {
            (0..6)
                .map(|j| {
                    let common = betas[i] * betas[j] * market_variance;
                    if i == j {
                        common + residual[i] * residual[i]
                    } else {
                        common
                    }
                })
                .collect()
        })
        .collect();
    OptimizationInput {
        asset_names: vec![
            "BOVA11".into(),
            "ITUB4".into(),
            "PETR4".into(),
            "MGLU3".into(),
            "IMAB11".into(),
            "VALE3".into(),
        ],
        mean_returns: vec![0.009, 0.011, 0.013, 0.018, 0.006, 0.012],
        covariance,
        risk_free_rate: 0.0085,
        bounds: vec![(0.0, 1.0); 6],
        solver: SolverOptions::default(),
        conditioner: ConditionerOptions::default(),
    }
}

fn sigma(input: &OptimizationInput) -> DMatrix<f64> {
    let n = input.covariance.len();
    DMatrix::from_fn(n, n, |i, j| input.covariance[i][j])
}

fn assert_feasible(weights: &[f64], bounds: &[WeightBounds]) {
    let total: f64 = weights.iter().sum();
    assert!((total - 1.0).abs() < 1e-6, "weights sum to {}", total);
    for (w, (lo, hi)) in weights.iter().zip(bounds.iter()) {
        assert!(
            *w >= lo - 1e-6 && *w <= hi + 1e-6,
            "weight {} outside [{}, {}]",
            w,
            lo,
            hi
        );
    }
}

// ===========================================================================
// Point solutions
// ===========================================================================

#[test]
fn test_two_asset_min_variance_closed_form() {
    let input = two_asset_input();
    let result = min_variance(&input).unwrap();
    let sol = &result.result;
    assert!(sol.converged, "{}", sol.diagnostic_message);

    // w1 = (s2^2 - s12) / (s1^2 + s2^2 - 2 s12)
    let w1 = (0.0009 - 0.0001) / (0.0004 + 0.0009 - 2.0 * 0.0001);
    assert!((sol.weights[0] - w1).abs() < 1e-2, "w1 = {}", sol.weights[0]);
    assert!((sol.weights[1] - (1.0 - w1)).abs() < 1e-2, "w2 = {}", sol.weights[1]);
    assert_feasible(&sol.weights, &input.bounds);
}

#[test]
fn test_two_asset_max_sharpe_beats_equal_weights() {
    let input = two_asset_input();
    let sol = max_sharpe(&input).unwrap().result;
    assert!(sol.converged, "{}", sol.diagnostic_message);
    assert_feasible(&sol.weights, &input.bounds);

    let equal = portfolio_stats(
        &[0.5, 0.5],
        &input.mean_returns,
        &sigma(&input),
        input.risk_free_rate,
    );
    assert!(sol.period_sharpe >= equal.period_sharpe);
}

#[test]
fn test_four_asset_max_sharpe_dominates_min_variance_sharpe() {
    let input = four_asset_input();
    let ms = max_sharpe(&input).unwrap().result;
    let mv = min_variance(&input).unwrap().result;
    assert!(ms.converged && mv.converged);
    assert_feasible(&ms.weights, &input.bounds);
    assert_feasible(&mv.weights, &input.bounds);
    assert!(ms.period_sharpe >= mv.period_sharpe - 1e-9);
    assert!(mv.period_volatility <= ms.period_volatility + 1e-9);
}

#[test]
fn test_four_asset_min_variance_beats_each_single_asset() {
    let input = four_asset_input();
    let mv = min_variance(&input).unwrap().result;
    assert!(mv.converged, "{}", mv.diagnostic_message);
    for i in 0..4 {
        assert!(mv.period_volatility <= input.covariance[i][i].sqrt() + 1e-9);
    }
}

#[test]
fn test_max_sharpe_with_rf_above_all_means() {
    // Sharpe is negative everywhere; the best is all in the equity fund:
    // (0.02 - 0.03) / 0.03 = -1/3
    let mut input = two_asset_input();
    input.risk_free_rate = 0.03;
    let sol = max_sharpe(&input).unwrap().result;
    assert!(sol.converged, "{}", sol.diagnostic_message);
    assert_feasible(&sol.weights, &input.bounds);
    assert!(sol.weights[1] > 1.0 - 1e-4, "weights {:?}", sol.weights);
    assert!((sol.period_sharpe + 1.0 / 3.0).abs() < 1e-6);
}

#[test]
fn test_target_return_is_met() {
    let input = four_asset_input();
    let sol = min_variance_for_target(&input, 0.014).unwrap().result;
    assert!(sol.converged, "{}", sol.diagnostic_message);
    assert!((sol.period_return - 0.014).abs() < 1e-7);
    assert_feasible(&sol.weights, &input.bounds);
}

#[test]
fn test_target_above_reach_reports_not_converged() {
    // Long-only cannot exceed the largest mean return
    let input = four_asset_input();
    let out = min_variance_for_target(&input, 0.03).unwrap();
    assert!(!out.result.converged);
    assert!(!out.warnings.is_empty());
}

#[test]
fn test_shape_errors_fail_before_solving() {
    let mut input = two_asset_input();
    input.covariance = vec![vec![0.0004, 0.0001, 0.0], vec![0.0001, 0.0009, 0.0]];
    match min_variance(&input) {
        Err(MptError::InvalidInput { field, .. }) => assert_eq!(field, "covariance"),
        other => panic!("expected InvalidInput, got {:?}", other.map(|o| o.result)),
    }
}

// ===========================================================================
// Frontier
// ===========================================================================

#[test]
fn test_frontier_forty_points() {
    let input = two_asset_input();
    let out = efficient_frontier(&input, &FrontierOptions::default()).unwrap();
    let points = &out.result;
    assert!((1..=40).contains(&points.len()), "{} points", points.len());
    assert!(points.windows(2).all(|w| w[0].target_return < w[1].target_return));
    for p in points {
        assert_feasible(&p.weights, &input.bounds);
    }
}

#[test]
fn test_frontier_upper_branch_volatility_rises() {
    let input = four_asset_input();
    let mv = min_variance(&input).unwrap().result;
    let out = efficient_frontier(&input, &FrontierOptions::default()).unwrap();
    let upper: Vec<_> = out
        .result
        .iter()
        .filter(|p| p.period_return > mv.period_return + 1e-6)
        .collect();
    assert!(upper.len() > 2);
    for pair in upper.windows(2) {
        assert!(pair[1].period_volatility >= pair[0].period_volatility - 1e-7);
    }
}

#[test]
fn test_frontier_keeps_every_target_between_min_and_max_mean() {
    let input = six_asset_factor_input();
    let options = FrontierOptions {
        point_count: 40,
        upper_multiplier: 1.0,
    };
    let out = efficient_frontier(&input, &options).unwrap();
    assert_eq!(out.result.len(), 40, "{:?}", out.warnings);
    assert!(out.warnings.is_empty());
    assert!((out.result[0].target_return - 0.006).abs() < 1e-15);
    assert!((out.result[39].target_return - 0.018).abs() < 1e-15);
    for p in &out.result {
        assert_feasible(&p.weights, &input.bounds);
        assert!((p.period_return - p.target_return).abs() < 1e-6);
    }
}

#[test]
fn test_frontier_short_selling_extends_range() {
    let mut input = two_asset_input();
    let long_only = efficient_frontier(&input, &FrontierOptions::default())
        .unwrap()
        .result;
    input.bounds = vec![(-1.0, 1.0), (-1.0, 2.0)];
    let with_shorts = efficient_frontier(&input, &FrontierOptions::default())
        .unwrap()
        .result;
    assert!(with_shorts.len() > long_only.len());
    assert_eq!(with_shorts.len(), 40);
}

// ===========================================================================
// Combined report
// ===========================================================================

#[test]
fn test_report_end_to_end() {
    let input = four_asset_input();
    let out = optimize_portfolio(&input, &ReportOptions::default()).unwrap();
    let report = &out.result;

    assert!(report.max_sharpe.solution.converged);
    assert!(report.min_variance.solution.converged);
    assert_eq!(report.max_sharpe.asset_weights.len(), 4);
    assert_eq!(report.max_sharpe.asset_weights[3].name, "IMAB11");
    assert!(!report.frontier.is_empty());

    let (r, v) = annualize(
        report.max_sharpe.solution.period_return,
        report.max_sharpe.solution.period_volatility,
        12,
    )
    .unwrap();
    assert_eq!(report.max_sharpe.annual_return, r);
    assert_eq!(report.max_sharpe.annual_volatility, v);
    assert_eq!(out.assumptions["frontier_points"], 40);
}

#[test]
fn test_report_serializes_to_json() {
    let out = optimize_portfolio(&two_asset_input(), &ReportOptions::default()).unwrap();
    let json = serde_json::to_value(&out).unwrap();
    assert!(json["result"]["max_sharpe"]["solution"]["weights"].is_array());
    assert_eq!(json["metadata"]["precision"], "f64");
}

#[test]
fn test_input_from_json_uses_defaults() {
    let json = r#"{
        "asset_names": ["A", "B"],
        "mean_returns": [0.01, 0.02],
        "covariance": [[0.0004, 0.0001], [0.0001, 0.0009]],
        "risk_free_rate": 0.005,
        "bounds": [[0.0, 1.0], [0.0, 1.0]]
    }"#;
    let input: OptimizationInput = serde_json::from_str(json).unwrap();
    assert_eq!(input.solver, SolverOptions::default());
    assert_eq!(input.conditioner.eigenvalue_floor, 1e-10);
    assert!(min_variance(&input).unwrap().result.converged);
}

// ===========================================================================
// Solver backend seam
// ===========================================================================

/// Hands back the starting point without solving anything.
struct StartingPointBackend;

impl Minimizer for StartingPointBackend {
    fn minimize(
        &self,
        _objective: &dyn Objective,
        initial_point: &[f64],
        _equalities: &[LinearEquality],
        _bounds: &[WeightBounds],
        _options: &SolverOptions,
    ) -> SolverOutcome {
        SolverOutcome {
            point: initial_point.to_vec(),
            converged: false,
            message: "backend gave up".into(),
            iterations: 0,
        }
    }
}

#[test]
fn test_backend_verdict_passed_through() {
    let out = max_sharpe_with(&two_asset_input(), &StartingPointBackend).unwrap();
    let sol = &out.result;
    assert!(!sol.converged);
    assert_eq!(sol.diagnostic_message, "backend gave up");
    assert_eq!(sol.weights, vec![0.5, 0.5]);
    assert!(out.warnings.iter().any(|w| w.contains("backend gave up")));
}

#[test]
fn test_backend_failure_empties_frontier() {
    let out = efficient_frontier_with(
        &two_asset_input(),
        &FrontierOptions::default(),
        &StartingPointBackend,
    )
    .unwrap();
    assert!(out.result.is_empty());
    assert_eq!(out.warnings, vec!["No feasible frontier under current bounds".to_string()]);
}
