//! Sky-model variance from the fit covariance, inflated around sky lines.
//!
//! The statistical variance of the convolved sky underestimates the real
//! residual scatter near bright emission lines, where small wavelength
//! calibration or line-spread errors dominate. Around each line we model the
//! extra variance as `(σ_flat · sky)² + (σ_wave · dsky/dλ)²` and raise
//! `σ_wave` until the sky-fiber residuals in the window reach a reduced
//! chi-square of 1.

use nalgebra::DMatrix;

use crate::domain::{InflationConfig, PeakInflation};
use crate::math::{combine_ivar, guarded_div, ivar_from_var, mean_gradient, var_from_ivar};
use crate::report::Reporter;
use crate::resolution::Resolution;

/// Statistical inverse variance of the convolved sky, `1 / diag(R̄ C R̄ᵗ)`.
///
/// Wavelengths with a non-positive convolved variance get zero ivar.
pub fn convolved_sky_ivar(skycovar: &DMatrix<f64>, mean_resolution: &Resolution) -> Vec<f64> {
    mean_resolution
        .sandwich_diagonal(skycovar)
        .into_iter()
        .map(ivar_from_var)
        .collect()
}

/// Mean of each column of a `nspec × nwave` array.
pub fn mean_spectrum(flux: &DMatrix<f64>) -> Vec<f64> {
    let n = flux.nrows().max(1) as f64;
    (0..flux.ncols()).map(|j| flux.column(j).sum() / n).collect()
}

/// `|dsky/dλ|` by central differences; zero at both ends.
pub fn sky_derivative(msky: &[f64], wave: &[f64]) -> Vec<f64> {
    let n = msky.len();
    let mut out = vec![0.0; n];
    for i in 1..n.saturating_sub(1) {
        out[i] = ((msky[i + 1] - msky[i - 1]) / (wave[i + 1] - wave[i - 1])).abs();
    }
    out
}

/// Strict local maxima of `msky` brighter than `fraction · max(msky)`.
pub fn find_sky_peaks(msky: &[f64], fraction: f64) -> Vec<usize> {
    let max = msky.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let floor = fraction * max;
    (1..msky.len().saturating_sub(1))
        .filter(|&i| msky[i] > msky[i + 1] && msky[i] > msky[i - 1] && msky[i] > floor)
        .collect()
}

/// Inputs of the inflation step, restricted to sky fibers where 2D.
pub struct InflationInput<'a> {
    pub wave: &'a [f64],
    /// Observed sky-fiber flux, `nsky × nwave`.
    pub flux: &'a DMatrix<f64>,
    /// Observed sky-fiber ivar, already zero where the frame mask is set.
    pub ivar: &'a DMatrix<f64>,
    /// Convolved sky model for the same fibers.
    pub cskyflux: &'a DMatrix<f64>,
    /// Mean convolved sky over all fibers of the exposure.
    pub msky: &'a [f64],
    /// Statistical sky ivar per wavelength.
    pub cskyivar: &'a [f64],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inflation {
    /// Inflated sky variance per wavelength.
    pub skyvar: Vec<f64>,
    /// Reduced chi-square of sky-fiber residuals per wavelength (1 where undefined).
    pub chi2: Vec<f64>,
    /// Number of unmasked sky fibers per wavelength.
    pub ndata: Vec<usize>,
    pub peaks: Vec<PeakInflation>,
}

impl Inflation {
    /// `(cskyivar > 0) / skyvar`.
    pub fn inflated_ivar(&self, cskyivar: &[f64]) -> Vec<f64> {
        cskyivar
            .iter()
            .zip(self.skyvar.iter())
            .map(|(&iv, &var)| if iv > 0.0 { guarded_div(1.0, var) } else { 0.0 })
            .collect()
    }
}

pub fn inflate_sky_variance(
    input: &InflationInput<'_>,
    config: &InflationConfig,
    reporter: &mut dyn Reporter,
) -> Inflation {
    let (nsky, nwave) = input.flux.shape();
    let msky = input.msky;
    let dskydw = sky_derivative(msky, input.wave);

    // Combined residual ivar; frame-masked pixels stay fully masked.
    let mut tivar = DMatrix::from_fn(nsky, nwave, |f, j| {
        let iv = input.ivar[(f, j)];
        if iv > 0.0 { combine_ivar(iv, input.cskyivar[j]) } else { 0.0 }
    });
    let res2 = DMatrix::from_fn(nsky, nwave, |f, j| {
        let d = input.flux[(f, j)] - input.cskyflux[(f, j)];
        d * d
    });

    // Residuals beyond any plausible sky-model error are cosmics or PSF
    // failures, not sky-model error.
    let nsig2 = config.outlier_nsig * config.outlier_nsig;
    for j in 0..nwave {
        let model_var =
            (config.max_flat_error * msky[j]).powi(2) + (config.max_wave_error * dskydw[j]).powi(2);
        for f in 0..nsky {
            let max_var = var_from_ivar(tivar[(f, j)]) + model_var;
            if res2[(f, j)] > nsig2 * max_var {
                tivar[(f, j)] = 0.0;
            }
        }
    }

    let ndata: Vec<usize> = (0..nwave)
        .map(|j| tivar.column(j).iter().filter(|&&v| v > 0.0).count())
        .collect();
    let chi2: Vec<f64> = (0..nwave)
        .map(|j| {
            if ndata[j] > 1 {
                let s: f64 = (0..nsky).map(|f| tivar[(f, j)] * res2[(f, j)]).sum();
                s / (ndata[j] - 1) as f64
            } else {
                1.0
            }
        })
        .collect();

    let mut skyvar: Vec<f64> = input.cskyivar.iter().map(|&iv| var_from_ivar(iv)).collect();
    let dwave = mean_gradient(input.wave);
    let dpix = if dwave > 0.0 {
        (config.half_window_angstrom / dwave).ceil() as usize
    } else {
        0
    };

    let mut peaks = Vec::new();
    for peak in find_sky_peaks(msky, config.peak_fraction) {
        let begin = peak.saturating_sub(dpix);
        let end = (peak + dpix + 1).min(nwave);
        let width = (end - begin) as f64;
        let mean_chi2 = chi2[begin..end].iter().sum::<f64>() / width;
        let mean_ndata = ndata[begin..end].iter().sum::<usize>() as f64 / width;

        let sigma_wave = search_sigma_wave(&tivar, &res2, msky, &dskydw, begin, end, config);
        if let Some(sigma) = sigma_wave {
            reporter.info(&format!(
                "peak at {}A : sigma_wave={sigma:.3}",
                input.wave[peak] as i64
            ));
            for j in begin..end {
                skyvar[j] += (config.sigma_flat * msky[j]).powi(2) + (sigma * dskydw[j]).powi(2);
            }
        } else {
            reporter.info(&format!(
                "peak at {}A : no sigma_wave below {} reaches chi2 <= 1",
                input.wave[peak] as i64, config.sigma_wave_max
            ));
        }

        peaks.push(PeakInflation {
            peak,
            wavelength: input.wave[peak],
            begin,
            end,
            mean_chi2,
            mean_ndata,
            sigma_wave,
        });
    }

    Inflation {
        skyvar,
        chi2,
        ndata,
        peaks,
    }
}

/// First `σ_wave = k · step < max` for which the window's chi2 drops to 1.
fn search_sigma_wave(
    tivar: &DMatrix<f64>,
    res2: &DMatrix<f64>,
    msky: &[f64],
    dskydw: &[f64],
    begin: usize,
    end: usize,
    config: &InflationConfig,
) -> Option<f64> {
    let nsky = tivar.nrows();
    let nd = (0..nsky)
        .flat_map(|f| (begin..end).map(move |j| (f, j)))
        .filter(|&(f, j)| tivar[(f, j)] > 0.0)
        .count();
    if nd == 0 {
        return None;
    }

    let mut k = 1u32;
    loop {
        let sigma_wave = k as f64 * config.sigma_wave_step;
        if sigma_wave >= config.sigma_wave_max {
            return None;
        }
        let mut pchi2 = 0.0;
        for f in 0..nsky {
            for j in begin..end {
                let iv = tivar[(f, j)];
                // Masked residuals are left out of the window chi2.
                if iv <= 0.0 {
                    continue;
                }
                let var = 1.0 / iv
                    + (config.sigma_flat * msky[j]).powi(2)
                    + (sigma_wave * dskydw[j]).powi(2);
                pchi2 += res2[(f, j)] / var;
            }
        }
        if pchi2 / nd as f64 <= 1.0 {
            return Some(sigma_wave);
        }
        k += 1;
    }
}

/// Broadcast a per-wavelength curve to `nspec` identical rows.
pub fn broadcast(values: &[f64], nspec: usize) -> DMatrix<f64> {
    DMatrix::from_fn(nspec, values.len(), |_, j| values[j])
}

/// Per-fiber convolved sky: row `f` is `R_f · skyflux`.
pub fn convolve_per_fiber(resolutions: &[Resolution], skyflux: &[f64]) -> DMatrix<f64> {
    let nwave = skyflux.len();
    let mut out = DMatrix::zeros(resolutions.len(), nwave);
    for (f, r) in resolutions.iter().enumerate() {
        for (j, v) in r.apply(skyflux).into_iter().enumerate() {
            out[(f, j)] = v;
        }
    }
    out
}

/// Rows of `m` selected by `indices`.
pub(crate) fn select_rows(m: &DMatrix<f64>, indices: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(indices.len(), m.ncols(), |r, j| m[(indices[r], j)])
}
