use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::time_value::{check_periods, compound, MONTHS_PER_YEAR};
use crate::types::Rate;
use crate::MptResult;

/// Return, volatility and Sharpe ratio of a portfolio, all in the period unit
/// of the inputs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioStats {
    pub period_return: Rate,
    pub period_volatility: Rate,
    /// Negative infinity when the portfolio has zero volatility.
    pub period_sharpe: f64,
}

/// Compute portfolio return, volatility and Sharpe ratio.
///
/// `period_return = w . mu` and `period_volatility = sqrt(w' Sigma w)`, where a
/// quadratic form that comes out negative from rounding is clamped to zero
/// first. With zero volatility the Sharpe ratio is `-inf`, so a degenerate
/// portfolio ranks last in any maximization instead of faulting.
pub fn portfolio_stats(
    weights: &[f64],
    mean_returns: &[f64],
    covariance: &DMatrix<f64>,
    risk_free_rate: Rate,
) -> PortfolioStats {
    let period_return = dot(weights, mean_returns);
    let period_volatility = portfolio_volatility(weights, covariance);
    PortfolioStats {
        period_return,
        period_volatility,
        period_sharpe: sharpe_ratio(period_return, risk_free_rate, period_volatility),
    }
}

/// Sharpe ratio with the zero-volatility convention.
pub fn sharpe_ratio(ret: Rate, risk_free_rate: Rate, volatility: Rate) -> f64 {
    if volatility > 0.0 {
        (ret - risk_free_rate) / volatility
    } else {
        f64::NEG_INFINITY
    }
}

/// Portfolio standard deviation: sqrt(max(w' Sigma w, 0)).
pub fn portfolio_volatility(weights: &[f64], covariance: &DMatrix<f64>) -> Rate {
    portfolio_variance(weights, covariance).max(0.0).sqrt()
}

/// Raw quadratic form w' Sigma w. May be marginally negative for a
/// non-conditioned matrix.
pub fn portfolio_variance(weights: &[f64], covariance: &DMatrix<f64>) -> f64 {
    let w = DVector::from_column_slice(weights);
    w.dot(&(covariance * &w))
}

/// Annualize a period return (geometric compounding) and a period volatility
/// (square-root-of-time scaling, i.e. i.i.d. period returns).
pub fn annualize(
    period_return: Rate,
    period_volatility: Rate,
    periods_per_year: u32,
) -> MptResult<(Rate, Rate)> {
    check_periods(periods_per_year)?;
    let annual_return = compound(period_return, periods_per_year) - 1.0;
    let annual_volatility = period_volatility * f64::from(periods_per_year).sqrt();
    Ok((annual_return, annual_volatility))
}

/// [`annualize`] for monthly figures.
pub fn annualize_monthly(period_return: Rate, period_volatility: Rate) -> MptResult<(Rate, Rate)> {
    annualize(period_return, period_volatility, MONTHS_PER_YEAR)
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
