use crate::error::MptError;
use crate::types::Rate;
use crate::MptResult;

/// Months per year, the period unit used for optimizer inputs.
pub const MONTHS_PER_YEAR: u32 = 12;

fn check_rate(field: &str, rate: Rate) -> MptResult<()> {
    if !rate.is_finite() || rate <= -1.0 {
        return Err(MptError::InvalidInput {
            field: field.into(),
            reason: "Rate must be finite and greater than -100%".into(),
        });
    }
    Ok(())
}

pub(crate) fn check_periods(periods_per_year: u32) -> MptResult<()> {
    if periods_per_year == 0 {
        return Err(MptError::InvalidInput {
            field: "periods_per_year".into(),
            reason: "Number of periods per year must be > 0".into(),
        });
    }
    Ok(())
}

/// Effective annual rate to effective period rate: (1 + a)^(1/p) - 1
pub fn annual_to_period_rate(annual: Rate, periods_per_year: u32) -> MptResult<Rate> {
    check_rate("annual", annual)?;
    check_periods(periods_per_year)?;
    Ok((1.0 + annual).powf(1.0 / periods_per_year as f64) - 1.0)
}

/// Effective period rate to effective annual rate: (1 + r)^p - 1
pub fn period_to_annual_rate(period: Rate, periods_per_year: u32) -> MptResult<Rate> {
    check_rate("period", period)?;
    check_periods(periods_per_year)?;
    Ok(compound(period, periods_per_year) - 1.0)
}

/// Future value of a single amount under compound interest.
pub fn future_value(present_value: f64, rate: Rate, periods: u32) -> MptResult<f64> {
    check_rate("rate", rate)?;
    Ok(present_value * compound(rate, periods))
}

/// Present value of a single amount under compound interest.
pub fn present_value(future_value: f64, rate: Rate, periods: u32) -> MptResult<f64> {
    check_rate("rate", rate)?;
    Ok(future_value / compound(rate, periods))
}

/// Growth factor (1 + r)^n. No validation; callers check the rate.
pub(crate) fn compound(rate: Rate, periods: u32) -> f64 {
    match i32::try_from(periods) {
        Ok(n) => (1.0 + rate).powi(n),
        Err(_) => (1.0 + rate).powf(f64::from(periods)),
    }
}
