//! Iterative chi-square clipping around the shared sky solve.
//!
//! Each iteration:
//!
//! - builds the normal equations from the current weights
//! - solves for the deconvolved sky
//! - evaluates `chi2 = ivar · (flux - R·sky)²` for every sky-fiber pixel
//! - zeroes the weight of outliers
//!
//! The first iteration only drops the worst fiber per wavelength, since the
//! initial solution is still pulled by the outliers. Later iterations drop
//! every pixel above threshold.
//!
//! The loop stops as soon as an iteration rejects nothing, or when the
//! iteration budget runs out (the last solution is kept in that case).

use nalgebra::{DMatrix, DVector};

use crate::domain::row_vec;
use crate::error::SkyError;
use crate::fit::SkyContext;
use crate::fit::normal::{NormalEquations, build_normal_equations};
use crate::math::{SolveMethod, median_mut};
use crate::report::IterationReport;
use crate::resolution::Resolution;

/// Working copies of the per-pixel weights. Never aliases exposure arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct FitState {
    pub current_ivar: DMatrix<f64>,
    pub sqrtw: DMatrix<f64>,
    pub sqrtwflux: DMatrix<f64>,
    pub chi2: DMatrix<f64>,
}

impl FitState {
    pub fn new(flux: &DMatrix<f64>, ivar: DMatrix<f64>) -> Self {
        let sqrtw = ivar.map(|v| v.max(0.0).sqrt());
        let sqrtwflux = sqrtw.component_mul(flux);
        let chi2 = DMatrix::zeros(flux.nrows(), flux.ncols());
        Self {
            current_ivar: ivar,
            sqrtw,
            sqrtwflux,
            chi2,
        }
    }

    fn reject(&mut self, f: usize, j: usize) {
        self.current_ivar[(f, j)] = 0.0;
        self.sqrtw[(f, j)] = 0.0;
        self.sqrtwflux[(f, j)] = 0.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionPolicy {
    /// At most one rejection per wavelength: the fiber with the largest chi2.
    WorstPerWavelength,
    /// Every pixel above threshold.
    AllAboveThreshold,
}

impl RejectionPolicy {
    pub fn for_iteration(iteration: u32) -> Self {
        if iteration < 1 {
            RejectionPolicy::WorstPerWavelength
        } else {
            RejectionPolicy::AllAboveThreshold
        }
    }
}

/// Result of the clipping loop.
#[derive(Debug, Clone)]
pub struct ClippedFit {
    pub skyflux: DVector<f64>,
    /// Normal equations of the last iteration (used for the covariance solve).
    pub normal: NormalEquations,
    pub state: FitState,
    pub nout_tot: usize,
    /// Number of iterations actually run.
    pub iterations: u32,
    pub converged: bool,
    pub method: SolveMethod,
}

/// Smooth inverse-variance model: fiber scale × wavelength shape.
///
/// `ivar[f, λ] ≈ median_f / median(median_f) · median_λ`, except where the
/// input is at or below `threshold · median_λ`, where the input is kept.
pub fn model_ivar(ivar: &DMatrix<f64>, threshold: f64) -> DMatrix<f64> {
    let (nfib, nwave) = ivar.shape();
    let median_vs_wave: Vec<f64> = (0..nwave)
        .map(|j| {
            let mut col: Vec<f64> = ivar.column(j).iter().copied().collect();
            median_mut(&mut col).unwrap_or(0.0)
        })
        .collect();
    let mut median_vs_fiber: Vec<f64> = (0..nfib)
        .map(|f| median_mut(&mut row_vec(ivar, f)).unwrap_or(0.0))
        .collect();
    let median_median = median_mut(&mut median_vs_fiber.clone()).unwrap_or(0.0);
    if median_median <= 0.0 {
        return ivar.clone();
    }
    median_vs_fiber.iter_mut().for_each(|m| *m /= median_median);

    DMatrix::from_fn(nfib, nwave, |f, j| {
        let input = ivar[(f, j)];
        if input <= threshold * median_vs_wave[j] {
            input
        } else {
            median_vs_fiber[f] * median_vs_wave[j]
        }
    })
}

/// `chi2[f, λ] = ivar[f, λ] · (flux[f, λ] - (R_f · sky)[λ])²`.
pub fn compute_chi2(
    flux: &DMatrix<f64>,
    ivar: &DMatrix<f64>,
    resolutions: &[&Resolution],
    skyflux: &DVector<f64>,
) -> DMatrix<f64> {
    let mut chi2 = DMatrix::zeros(flux.nrows(), flux.ncols());
    for (f, r) in resolutions.iter().enumerate() {
        let model = r.apply(skyflux.as_slice());
        for (j, m) in model.iter().enumerate() {
            let d = flux[(f, j)] - m;
            chi2[(f, j)] = ivar[(f, j)] * d * d;
        }
    }
    chi2
}

/// Zero the weights of outliers in `state.chi2`; returns how many were rejected.
pub fn apply_rejection(state: &mut FitState, threshold: f64, policy: RejectionPolicy) -> usize {
    let (nfib, nwave) = state.chi2.shape();
    let mut nout = 0;
    match policy {
        RejectionPolicy::WorstPerWavelength => {
            for j in 0..nwave {
                let column = state.chi2.column(j);
                if !column.iter().any(|&c| c > threshold) {
                    continue;
                }
                // First index of the maximum, like numpy's argmax.
                let mut worst = 0;
                for f in 1..nfib {
                    if column[f] > column[worst] {
                        worst = f;
                    }
                }
                state.reject(worst, j);
                nout += 1;
            }
        }
        RejectionPolicy::AllAboveThreshold => {
            for f in 0..nfib {
                for j in 0..nwave {
                    if state.chi2[(f, j)] > threshold {
                        state.reject(f, j);
                        nout += 1;
                    }
                }
            }
        }
    }
    nout
}

/// Run the clipping loop on sky fibers only.
///
/// `flux` and `ivar` are `nsky × nwave`; `ivar` must already be zero on masked pixels.
pub fn fit_with_clipping(
    flux: &DMatrix<f64>,
    ivar: DMatrix<f64>,
    resolutions: &[&Resolution],
    ctx: &mut SkyContext<'_>,
) -> Result<ClippedFit, SkyError> {
    if flux.shape() != ivar.shape() || resolutions.len() != flux.nrows() {
        return Err(SkyError::shape(
            "sky fiber arrays",
            format!("{}x{} with {} resolutions", flux.nrows(), flux.ncols(), flux.nrows()),
            format!("{}x{} with {} resolutions", ivar.nrows(), ivar.ncols(), resolutions.len()),
        ));
    }

    let nwave = flux.ncols();
    let threshold = ctx.config.nsig_clipping * ctx.config.nsig_clipping;
    let max_iterations = ctx.config.max_iterations;

    let mut state = FitState::new(flux, ivar);
    let mut nout_tot = 0usize;
    let mut last: Option<(DVector<f64>, NormalEquations, SolveMethod)> = None;
    let mut iterations = 0u32;
    let mut converged = false;

    for iteration in 0..max_iterations {
        if iteration > 0 && ctx.reporter.should_abort(iteration) {
            return Err(SkyError::Aborted { iteration });
        }

        let normal = build_normal_equations(resolutions, &state.sqrtw, &state.sqrtwflux);
        let solution = normal.solve();
        if let Some(reason) = &solution.fallback_reason {
            ctx.warn(format!(
                "cholesky failed ({reason}), using {} in iteration {iteration}",
                solution.method.display_name()
            ));
        }

        state.chi2 = compute_chi2(flux, &state.current_ivar, resolutions, &solution.x);
        let sum_chi2: f64 = state.chi2.iter().sum();
        let npos = state.chi2.iter().filter(|&&c| c > 0.0).count();
        let ndf = npos as i64 - nwave as i64;
        let chi2pdf = if ndf > 0 { sum_chi2 / ndf as f64 } else { 0.0 };

        let nout = apply_rejection(&mut state, threshold, RejectionPolicy::for_iteration(iteration));
        nout_tot += nout;
        iterations = iteration + 1;

        ctx.reporter.on_iteration(&IterationReport {
            iteration,
            chi2: sum_chi2,
            ndf,
            chi2pdf,
            nout,
            method: solution.method,
        });

        last = Some((solution.x, normal, solution.method));
        if nout == 0 {
            converged = true;
            break;
        }
    }

    if !converged {
        ctx.warn(format!(
            "clipping did not converge within {max_iterations} iterations; keeping last solution"
        ));
    }

    let Some((skyflux, normal, method)) = last else {
        return Err(SkyError::InvalidConfig("max_iterations must be >= 1".into()));
    };

    Ok(ClippedFit {
        skyflux,
        normal,
        state,
        nout_tot,
        iterations,
        converged,
        method,
    })
}
