use nalgebra::{DMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Smallest eigenvalue a conditioned covariance matrix may carry.
pub const DEFAULT_EIGENVALUE_FLOOR: f64 = 1e-10;

/// Options for covariance conditioning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionerOptions {
    /// Eigenvalues below this floor are raised to it.
    pub eigenvalue_floor: f64,
}

impl Default for ConditionerOptions {
    fn default() -> Self {
        Self {
            eigenvalue_floor: DEFAULT_EIGENVALUE_FLOOR,
        }
    }
}

/// Repair a symmetric covariance matrix so that every eigenvalue is at least
/// `floor`.
///
/// The matrix is decomposed as `V diag(lambda) V'`, each eigenvalue is clipped
/// to `max(lambda, floor)` and the matrix is rebuilt. The reconstruction runs
/// unconditionally: a PSD input comes back equal up to rounding. The result is
/// re-symmetrized to remove rounding asymmetry from the product.
pub fn condition_covariance(sigma: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let mut eigen = SymmetricEigen::new(sigma.clone());

    let mut clipped = 0usize;
    for lambda in eigen.eigenvalues.iter_mut() {
        if *lambda < floor {
            *lambda = floor;
            clipped += 1;
        }
    }
    if clipped > 0 {
        debug!(clipped, floor, "raised covariance eigenvalues to floor");
    }

    let rebuilt = eigen.recompose();
    (&rebuilt + rebuilt.transpose()) * 0.5
}

/// Row-major convenience wrapper around [`condition_covariance`].
pub fn condition_covariance_rows(cov: &[Vec<f64>], options: &ConditionerOptions) -> Vec<Vec<f64>> {
    let conditioned = condition_covariance(&matrix_from_rows(cov), options.eigenvalue_floor);
    rows_from_matrix(&conditioned)
}

/// Build a dense matrix from validated square row-major data.
pub(crate) fn matrix_from_rows(rows: &[Vec<f64>]) -> DMatrix<f64> {
    let n = rows.len();
    DMatrix::from_fn(n, n, |i, j| rows[i][j])
}

pub(crate) fn rows_from_matrix(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    m.row_iter().map(|row| row.iter().copied().collect()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn min_eigenvalue(m: &DMatrix<f64>) -> f64 {
        SymmetricEigen::new(m.clone())
            .eigenvalues
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    fn max_abs_diff(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
        (a - b).iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }

    fn assert_symmetric(m: &DMatrix<f64>) {
        for i in 0..m.nrows() {
            for j in 0..m.ncols() {
                assert_eq!(m[(i, j)], m[(j, i)], "asymmetric at [{},{}]", i, j);
            }
        }
    }

    #[test]
    fn test_negative_eigenvalue_is_raised() {
        // Eigenvalues 3 and -1
        let sigma = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let fixed = condition_covariance(&sigma, DEFAULT_EIGENVALUE_FLOOR);
        assert_symmetric(&fixed);
        assert!(
            min_eigenvalue(&fixed) >= DEFAULT_EIGENVALUE_FLOOR - 1e-12,
            "min eigenvalue {}",
            min_eigenvalue(&fixed)
        );
    }

    #[test]
    fn test_psd_input_left_unchanged() {
        let sigma = DMatrix::from_row_slice(2, 2, &[0.0004, 0.0001, 0.0001, 0.0009]);
        let fixed = condition_covariance(&sigma, DEFAULT_EIGENVALUE_FLOOR);
        assert!(max_abs_diff(&sigma, &fixed) < 1e-15);
    }

    #[test]
    fn test_idempotent() {
        let sigma = DMatrix::from_row_slice(
            3,
            3,
            &[0.04, 0.05, 0.01, 0.05, 0.04, 0.02, 0.01, 0.02, 0.01],
        );
        let once = condition_covariance(&sigma, DEFAULT_EIGENVALUE_FLOOR);
        let twice = condition_covariance(&once, DEFAULT_EIGENVALUE_FLOOR);
        assert!(max_abs_diff(&once, &twice) < 1e-12);
    }

    #[test]
    fn test_singular_matrix_gets_floor() {
        // Perfectly correlated assets: eigenvalues 0.08 and 0
        let sigma = DMatrix::from_row_slice(2, 2, &[0.04, 0.04, 0.04, 0.04]);
        let fixed = condition_covariance(&sigma, 1e-6);
        let w = nalgebra::DVector::from_vec(vec![1.0, -1.0]);
        let quad = w.dot(&(&fixed * &w));
        assert!(quad >= 1e-6 * 2.0 - 1e-12, "quadratic form {}", quad);
    }

    #[test]
    fn test_random_symmetric_matrices() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..25 {
            let n = rng.gen_range(2..7);
            let mut sigma = DMatrix::<f64>::zeros(n, n);
            for i in 0..n {
                for j in i..n {
                    let v: f64 = rng.gen_range(-0.05..0.05);
                    sigma[(i, j)] = v;
                    sigma[(j, i)] = v;
                }
            }
            let fixed = condition_covariance(&sigma, DEFAULT_EIGENVALUE_FLOOR);
            assert_symmetric(&fixed);
            assert!(min_eigenvalue(&fixed) >= DEFAULT_EIGENVALUE_FLOOR - 1e-12);

            let w = nalgebra::DVector::from_fn(n, |_, _| rng.gen_range(-1.0..1.0));
            assert!(w.dot(&(&fixed * &w)) >= 0.0);
        }
    }

    #[test]
    fn test_rows_wrapper_roundtrip_shape() {
        let rows = vec![vec![1.0, 2.0], vec![2.0, 1.0]];
        let fixed = condition_covariance_rows(&rows, &ConditionerOptions::default());
        assert_eq!(fixed.len(), 2);
        assert!(fixed.iter().all(|r| r.len() == 2));
        assert_eq!(fixed[0][1], fixed[1][0]);
    }
}
