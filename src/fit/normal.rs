//! Weighted normal equations for the shared sky spectrum.
//!
//! Every sky fiber `f` observes `R_f · sky` with per-pixel weights `w_f`.
//! Minimizing `Σ_f ||√w_f (flux_f - R_f sky)||²` gives
//!
//! ```text
//! A = Σ_f (√w_f R_f)ᵗ (√w_f R_f)      B = Σ_f (√w_f R_f)ᵗ (√w_f flux_f)
//! ```
//!
//! Each fiber's contribution is computed on its own and the contributions are
//! summed, so nothing is mutated in place across fibers.

use nalgebra::{DMatrix, DVector};

use crate::domain::row_vec;
use crate::math::{BandedSymmetric, CovarianceSolution, Solution, solve_restricted, solve_with_covariance};
use crate::resolution::Resolution;

#[derive(Debug, Clone, PartialEq)]
pub struct NormalEquations {
    pub a: BandedSymmetric,
    pub b: Vec<f64>,
}

impl NormalEquations {
    pub fn zeros(nwave: usize, bandwidth: usize) -> Self {
        Self {
            a: BandedSymmetric::zeros(nwave, bandwidth),
            b: vec![0.0; nwave],
        }
    }

    pub fn nwave(&self) -> usize {
        self.b.len()
    }

    /// Sum of two systems over the same grid.
    pub fn add(self, other: NormalEquations) -> NormalEquations {
        let a = self.a.add(&other.a);
        let b = self.b.iter().zip(other.b.iter()).map(|(x, y)| x + y).collect();
        NormalEquations { a, b }
    }

    /// Solve restricted to wavelengths with non-zero total weight.
    pub fn solve(&self) -> Solution {
        solve_restricted(&self.a, &self.b)
    }

    /// Solve the full system and return the deconvolved covariance.
    pub fn solve_with_covariance(&self) -> CovarianceSolution {
        let b = DVector::from_column_slice(&self.b);
        solve_with_covariance(&self.a.to_dense(), &b)
    }
}

/// Contribution of a single fiber.
pub fn fiber_contribution(resolution: &Resolution, sqrtw: &[f64], sqrtwflux: &[f64]) -> NormalEquations {
    let (a, b) = resolution.weighted(sqrtw).normal_equation_contribution(sqrtwflux);
    NormalEquations { a, b }
}

/// Accumulate the normal equations over all fibers.
///
/// `sqrtw` and `sqrtwflux` are `nfibers × nwave`, row `f` matching `resolutions[f]`.
pub fn build_normal_equations(
    resolutions: &[&Resolution],
    sqrtw: &DMatrix<f64>,
    sqrtwflux: &DMatrix<f64>,
) -> NormalEquations {
    let nwave = sqrtw.ncols();
    let bandwidth = resolutions
        .iter()
        .map(|r| 2 * r.half_width())
        .max()
        .unwrap_or(0);

    resolutions
        .iter()
        .enumerate()
        .map(|(f, r)| fiber_contribution(r, &row_vec(sqrtw, f), &row_vec(sqrtwflux, f)))
        .fold(NormalEquations::zeros(nwave, bandwidth), NormalEquations::add)
}
