use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::io;
use std::path::Path;
use tracing::debug;

use crate::error::MptError;
use crate::portfolio_optimization::covariance::ConditionerOptions;
use crate::portfolio_optimization::mean_variance::OptimizationInput;
use crate::portfolio_optimization::solver::SolverOptions;
use crate::types::{Rate, WeightBounds};
use crate::MptResult;

const DATE_FORMAT: &str = "%Y-%m-%d";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Price observations, one row per date and one column per asset.
/// A `None` cell is a missing observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    pub dates: Vec<NaiveDate>,
    pub asset_names: Vec<String>,
    pub prices: Vec<Vec<Option<f64>>>,
}

/// Aligned simple returns: every row has a value for every asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnTable {
    /// Date of the later price in each return.
    pub dates: Vec<NaiveDate>,
    pub asset_names: Vec<String>,
    pub returns: Vec<Vec<Rate>>,
}

/// Sample mean vector and covariance matrix of a return table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleMoments {
    pub mean_returns: Vec<Rate>,
    pub covariance: Vec<Vec<f64>>,
    pub observations: usize,
}

impl PriceTable {
    /// Read a price CSV with header `date,<asset>,<asset>,...`.
    ///
    /// Dates are `YYYY-MM-DD`; blank or `NaN` cells are missing values. Rows
    /// come back sorted by date, with empty columns and empty rows removed.
    pub fn from_csv_reader<R: io::Read>(reader: R) -> MptResult<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        if headers.len() < 2 {
            return Err(MptError::ParseError(
                "Price CSV needs a date column and at least one asset column".into(),
            ));
        }
        let asset_names: Vec<String> = headers.iter().skip(1).map(String::from).collect();

        let mut rows: Vec<(NaiveDate, Vec<Option<f64>>)> = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let raw_date = record.get(0).unwrap_or_default();
            let date = NaiveDate::parse_from_str(raw_date, DATE_FORMAT).map_err(|e| {
                MptError::DateError(format!("Row {}: '{}' ({})", line + 1, raw_date, e))
            })?;
            let values = record
                .iter()
                .skip(1)
                .enumerate()
                .map(|(col, cell)| parse_cell(cell, line + 1, &asset_names[col]))
                .collect::<MptResult<Vec<_>>>()?;
            rows.push((date, values));
        }
        rows.sort_by_key(|(date, _)| *date);

        let (dates, prices) = rows.into_iter().unzip();
        Ok(Self {
            dates,
            asset_names,
            prices,
        }
        .drop_empty())
    }

    /// [`PriceTable::from_csv_reader`] over a file.
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> MptResult<Self> {
        let file = std::fs::File::open(path.as_ref()).map_err(|e| {
            MptError::ParseError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_csv_reader(file)
    }

    pub fn n_assets(&self) -> usize {
        self.asset_names.len()
    }

    /// Remove columns with no observations, then rows with no observations.
    fn drop_empty(self) -> Self {
        let keep_cols: Vec<usize> = (0..self.asset_names.len())
            .filter(|&c| self.prices.iter().any(|row| row[c].is_some()))
            .collect();
        let dropped_cols = self.asset_names.len() - keep_cols.len();

        let asset_names = keep_cols.iter().map(|&c| self.asset_names[c].clone()).collect();
        let mut dates = Vec::with_capacity(self.dates.len());
        let mut prices = Vec::with_capacity(self.prices.len());
        for (date, row) in self.dates.into_iter().zip(self.prices) {
            let kept: Vec<Option<f64>> = keep_cols.iter().map(|&c| row[c]).collect();
            if kept.iter().any(Option::is_some) {
                dates.push(date);
                prices.push(kept);
            }
        }
        if dropped_cols > 0 {
            debug!(dropped_cols, "dropped empty price columns");
        }
        Self {
            dates,
            asset_names,
            prices,
        }
    }
}

fn parse_cell(cell: &str, line: usize, asset: &str) -> MptResult<Option<f64>> {
    if cell.is_empty() {
        return Ok(None);
    }
    let value: f64 = cell.parse().map_err(|_| {
        MptError::ParseError(format!(
            "Row {}, column '{}': '{}' is not a number",
            line, asset, cell
        ))
    })?;
    Ok(value.is_finite().then_some(value))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Reject tables that cannot feed a portfolio optimization. Sparse missing
/// values are accepted.
pub fn validate_prices(table: &PriceTable) -> MptResult<()> {
    if table.n_assets() < 2 {
        return Err(MptError::InsufficientData(
            "Prices for at least two assets required".into(),
        ));
    }
    if table.prices.len() != table.dates.len()
        || table.prices.iter().any(|row| row.len() != table.n_assets())
    {
        return Err(MptError::InvalidInput {
            field: "prices".into(),
            reason: "Every row needs one cell per asset and a date".into(),
        });
    }
    Ok(())
}

/// Resample to one row per calendar month, keeping the last observed price of
/// each asset within the month. Rows are dated at the month end.
pub fn to_monthly_last(table: &PriceTable) -> MptResult<PriceTable> {
    let n = table.n_assets();
    let mut dates: Vec<NaiveDate> = Vec::new();
    let mut prices: Vec<Vec<Option<f64>>> = Vec::new();
    let mut current: Option<(i32, u32)> = None;

    for (date, row) in table.dates.iter().zip(table.prices.iter()) {
        let key = (date.year(), date.month());
        if current != Some(key) {
            current = Some(key);
            dates.push(month_end(key.0, key.1)?);
            prices.push(vec![None; n]);
        }
        if let Some(last) = prices.last_mut() {
            for (slot, value) in last.iter_mut().zip(row.iter()) {
                if value.is_some() {
                    *slot = *value;
                }
            }
        }
    }

    Ok(PriceTable {
        dates,
        asset_names: table.asset_names.clone(),
        prices,
    }
    .drop_empty())
}

/// Simple returns `r_t = P_t / P_(t-1) - 1` between consecutive rows.
///
/// A return is undefined when either price is missing or the earlier price
/// is not positive; rows with any undefined return are dropped so that every
/// asset is observed on the same dates.
pub fn simple_returns(table: &PriceTable) -> ReturnTable {
    let mut dates = Vec::new();
    let mut returns = Vec::new();
    let mut dropped = 0usize;

    for t in 1..table.prices.len() {
        let prev = &table.prices[t - 1];
        let curr = &table.prices[t];
        let row: Option<Vec<f64>> = prev
            .iter()
            .zip(curr.iter())
            .map(|(p0, p1)| match (p0, p1) {
                (Some(p0), Some(p1)) if *p0 > 0.0 => Some(p1 / p0 - 1.0),
                _ => None,
            })
            .collect();
        match row {
            Some(r) => {
                dates.push(table.dates[t]);
                returns.push(r);
            }
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        debug!(dropped, "dropped return rows with missing prices");
    }

    ReturnTable {
        dates,
        asset_names: table.asset_names.clone(),
        returns,
    }
}

/// Sample mean and sample covariance (n - 1 denominator) of each asset's
/// returns.
pub fn estimate_moments(returns: &ReturnTable) -> MptResult<SampleMoments> {
    let observations = returns.returns.len();
    if observations < 2 {
        return Err(MptError::InsufficientData(format!(
            "At least 2 return observations required, got {}",
            observations
        )));
    }
    let n = returns.asset_names.len();
    let columns: Vec<Vec<f64>> = (0..n)
        .map(|c| returns.returns.iter().map(|row| row[c]).collect())
        .collect();

    let mean_returns: Vec<f64> = columns.iter().map(|col| col.iter().mean()).collect();
    let mut covariance = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let c = columns[i].iter().covariance(columns[j].iter());
            covariance[i][j] = c;
            covariance[j][i] = c;
        }
    }

    Ok(SampleMoments {
        mean_returns,
        covariance,
        observations,
    })
}

/// Price table to optimizer input: simple returns, sample moments, and the
/// given risk-free rate and bounds. Everything stays in the table's period
/// unit, so resample with [`to_monthly_last`] first for monthly inputs.
pub fn build_optimization_input(
    table: &PriceTable,
    risk_free_rate: Rate,
    bounds: Vec<WeightBounds>,
) -> MptResult<OptimizationInput> {
    validate_prices(table)?;
    let returns = simple_returns(table);
    let moments = estimate_moments(&returns)?;
    debug!(
        assets = table.n_assets(),
        observations = moments.observations,
        "estimated return moments"
    );
    Ok(OptimizationInput {
        asset_names: returns.asset_names,
        mean_returns: moments.mean_returns,
        covariance: moments.covariance,
        risk_free_rate,
        bounds,
        solver: SolverOptions::default(),
        conditioner: ConditionerOptions::default(),
    })
}

/// `(-1, 1)` per asset when shorts are allowed, else `(0, 1)`.
pub fn uniform_bounds(n: usize, allow_short: bool) -> Vec<WeightBounds> {
    let lower = if allow_short { -1.0 } else { 0.0 };
    vec![(lower, 1.0); n]
}

fn month_end(year: i32, month: u32) -> MptResult<NaiveDate> {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .ok_or_else(|| MptError::DateError(format!("No month end for {}-{:02}", year, month)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
