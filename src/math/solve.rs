//! Robust solvers for the sky normal equations.
//!
//! We repeatedly solve symmetric positive semi-definite systems `A x = b`
//! where `A = Σ_f (√w_f R_f)ᵗ (√w_f R_f)`.
//!
//! Implementation choices:
//! - Cholesky first: it is the cheap path and succeeds whenever every
//!   selected wavelength carries weight.
//! - SVD least squares when Cholesky fails. Nalgebra's SVD solve takes an
//!   explicit singular-value tolerance, so we try a few progressively looser
//!   ones before giving up.
//! - Moore–Penrose pseudo-inverse as the last resort, which always exists.
//!
//! Failures are returned as [`SingularityError`] values and the fallback is
//! chosen explicitly by the caller-facing helpers; nothing here panics on a
//! singular system.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::BandedSymmetric;

/// Relative singular-value cutoff for the pseudo-inverse (numpy's `rcond`).
const PINV_RCOND: f64 = 1e-15;

/// Which path produced a solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveMethod {
    Cholesky,
    LeastSquares,
    PseudoInverse,
}

impl SolveMethod {
    pub fn display_name(self) -> &'static str {
        match self {
            SolveMethod::Cholesky => "cholesky",
            SolveMethod::LeastSquares => "lstsq",
            SolveMethod::PseudoInverse => "pinv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SingularityError {
    #[error("matrix of size {size} is not positive definite")]
    NotPositiveDefinite { size: usize },
    #[error("factorization produced non-finite values")]
    NonFinite,
    #[error("singular value decomposition did not yield a solution")]
    SvdFailed,
}

/// A best-effort solution and the path that produced it.
#[derive(Debug, Clone)]
pub struct Solution {
    pub x: DVector<f64>,
    pub method: SolveMethod,
    /// The Cholesky failure that triggered a fallback, if any.
    pub fallback_reason: Option<SingularityError>,
}

/// Solution of the full system together with its covariance `A⁻¹` (or `A⁺`).
#[derive(Debug, Clone)]
pub struct CovarianceSolution {
    pub x: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub method: SolveMethod,
    pub fallback_reason: Option<SingularityError>,
}

fn all_finite<'a>(values: impl IntoIterator<Item = &'a f64>) -> bool {
    values.into_iter().all(|v| v.is_finite())
}

/// Solve `A x = b` by Cholesky factorization.
pub fn cholesky_solve(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, SingularityError> {
    let chol = a
        .clone()
        .cholesky()
        .ok_or(SingularityError::NotPositiveDefinite { size: a.nrows() })?;
    let x = chol.solve(b);
    if all_finite(x.iter()) {
        Ok(x)
    } else {
        Err(SingularityError::NonFinite)
    }
}

/// Solve `A x = b` and return `A⁻¹` from the same Cholesky factor.
pub fn cholesky_solve_and_invert(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
) -> Result<(DVector<f64>, DMatrix<f64>), SingularityError> {
    let chol = a
        .clone()
        .cholesky()
        .ok_or(SingularityError::NotPositiveDefinite { size: a.nrows() })?;
    let x = chol.solve(b);
    let inverse = chol.inverse();
    if all_finite(x.iter()) && all_finite(inverse.iter()) {
        Ok((x, inverse))
    } else {
        Err(SingularityError::NonFinite)
    }
}

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Tolerances are absolute singular-value cutoffs, scaled to the largest one.
    let scale = svd.singular_values.max().max(f64::MIN_POSITIVE);
    for &tol in &[1e-14, 1e-12, 1e-10] {
        if let Ok(beta) = svd.solve(y, tol * scale) {
            if all_finite(beta.iter()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Moore–Penrose pseudo-inverse.
pub fn pseudo_inverse(a: &DMatrix<f64>) -> Result<DMatrix<f64>, SingularityError> {
    let svd = a.clone().svd(true, true);
    let eps = PINV_RCOND * svd.singular_values.max();
    let pinv = svd.pseudo_inverse(eps).map_err(|_| SingularityError::SvdFailed)?;
    if all_finite(pinv.iter()) {
        Ok(pinv)
    } else {
        Err(SingularityError::NonFinite)
    }
}

/// Solve a dense symmetric system, falling back from Cholesky to least
/// squares to the pseudo-inverse. Never fails: if every path breaks down the
/// zero vector is returned under [`SolveMethod::PseudoInverse`].
pub fn solve_dense(a: &DMatrix<f64>, b: &DVector<f64>) -> Solution {
    let reason = match cholesky_solve(a, b) {
        Ok(x) => {
            return Solution {
                x,
                method: SolveMethod::Cholesky,
                fallback_reason: None,
            };
        }
        Err(e) => e,
    };

    if let Some(x) = solve_least_squares(a, b) {
        return Solution {
            x,
            method: SolveMethod::LeastSquares,
            fallback_reason: Some(reason),
        };
    }

    let x = pseudo_inverse(a)
        .map(|pinv| pinv * b)
        .unwrap_or_else(|_| DVector::zeros(b.len()));
    Solution {
        x,
        method: SolveMethod::PseudoInverse,
        fallback_reason: Some(reason),
    }
}

/// Solve the normal equations restricted to wavelengths with any weight.
///
/// Indices with `diag(A) == 0` are excluded from the dense sub-system and
/// stay exactly zero in the returned solution.
pub fn solve_restricted(a: &BandedSymmetric, b: &[f64]) -> Solution {
    let n = a.size();
    let selected: Vec<usize> = a
        .diagonal()
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| if d > 0.0 { Some(i) } else { None })
        .collect();

    let mut x = DVector::<f64>::zeros(n);
    if selected.is_empty() {
        return Solution {
            x,
            method: SolveMethod::Cholesky,
            fallback_reason: None,
        };
    }

    let a_sub = a.to_dense_subset(&selected);
    let b_sub = DVector::from_iterator(selected.len(), selected.iter().map(|&i| b[i]));
    let sub = solve_dense(&a_sub, &b_sub);
    for (k, &i) in selected.iter().enumerate() {
        x[i] = sub.x[k];
    }

    Solution {
        x,
        method: sub.method,
        fallback_reason: sub.fallback_reason,
    }
}

/// Solve the full (unrestricted) system and return the deconvolved covariance.
///
/// Falls back to the pseudo-inverse of `A` when Cholesky fails; if even that
/// breaks down the covariance is all zeros, which downstream maps to zero ivar.
pub fn solve_with_covariance(a: &DMatrix<f64>, b: &DVector<f64>) -> CovarianceSolution {
    match cholesky_solve_and_invert(a, b) {
        Ok((x, covariance)) => CovarianceSolution {
            x,
            covariance,
            method: SolveMethod::Cholesky,
            fallback_reason: None,
        },
        Err(reason) => {
            let n = a.nrows();
            let covariance = pseudo_inverse(a).unwrap_or_else(|_| DMatrix::zeros(n, n));
            let x = &covariance * b;
            CovarianceSolution {
                x,
                covariance,
                method: SolveMethod::PseudoInverse,
                fallback_reason: Some(reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn cholesky_path_on_positive_definite() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DVector::from_row_slice(&[1.0, 2.0]);
        let sol = solve_dense(&a, &b);
        assert_eq!(sol.method, SolveMethod::Cholesky);
        let r = &a * &sol.x - &b;
        assert!(r.norm() < 1e-12);
    }

    #[test]
    fn singular_system_falls_back_without_failing() {
        // Two identical rows: rank 1.
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let b = DVector::from_row_slice(&[2.0, 2.0]);
        let sol = solve_dense(&a, &b);
        assert_ne!(sol.method, SolveMethod::Cholesky);
        assert!(sol.fallback_reason.is_some());
        assert!(sol.x.iter().all(|v| v.is_finite()));
        // Minimum-norm solution of x0 + x1 = 2.
        assert!((sol.x[0] - 1.0).abs() < 1e-9);
        assert!((sol.x[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn restricted_solve_leaves_unweighted_indices_at_zero() {
        let mut a = BandedSymmetric::zeros(3, 1);
        a.add_at(0, 0, 2.0);
        a.add_at(2, 2, 4.0);
        let b = [4.0, 0.0, 2.0];
        let sol = solve_restricted(&a, &b);
        assert_eq!(sol.method, SolveMethod::Cholesky);
        assert_eq!(sol.x[1], 0.0);
        assert!((sol.x[0] - 2.0).abs() < 1e-12);
        assert!((sol.x[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn covariance_is_inverse_when_well_conditioned() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 8.0]);
        let b = DVector::from_row_slice(&[2.0, 8.0]);
        let sol = solve_with_covariance(&a, &b);
        assert_eq!(sol.method, SolveMethod::Cholesky);
        assert!((sol.covariance[(0, 0)] - 0.5).abs() < 1e-12);
        assert!((sol.covariance[(1, 1)] - 0.125).abs() < 1e-12);
        assert!((sol.x[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn covariance_falls_back_to_pseudo_inverse_on_zero_row() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 0.0]);
        let b = DVector::from_row_slice(&[4.0, 0.0]);
        let sol = solve_with_covariance(&a, &b);
        assert_eq!(sol.method, SolveMethod::PseudoInverse);
        assert!((sol.covariance[(0, 0)] - 0.25).abs() < 1e-12);
        assert_eq!(sol.covariance[(1, 1)], 0.0);
        assert!((sol.x[0] - 1.0).abs() < 1e-12);
    }
}
