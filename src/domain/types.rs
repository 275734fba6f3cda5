//! Shared domain types.
//!
//! These types are kept as plain in-memory arrays so they can be:
//!
//! - produced by any I/O collaborator (FITS readers live outside this crate)
//! - consumed by the sky fitter without conversion
//! - exported to JSON for inspection

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::SkyError;
use crate::math::SolveMethod;
use crate::resolution::Resolution;

/// Sky fibers are addressed by index within one spectrograph; the hardware
/// never has more than this many.
pub const MAX_SKY_FIBER_INDEX: usize = 500;

/// Mask bit set on sky-model pixels without a usable statistical variance.
pub const SKY_MODEL_BAD: u32 = 1 << 0;

/// Fiber classification (the `OBJTYPE` fibermap column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FiberType {
    Sky,
    Target,
    Standard,
    Unused,
}

impl FiberType {
    pub fn from_objtype(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "SKY" => FiberType::Sky,
            "STD" | "STAR" | "FSTD" => FiberType::Standard,
            "" | "UNUSED" | "NA" => FiberType::Unused,
            _ => FiberType::Target,
        }
    }
}

/// One camera's extracted spectra.
///
/// 2D arrays are `nspec × nwave` (one row per fiber). `mask == 0` means good.
#[derive(Debug, Clone)]
pub struct Exposure {
    pub wave: Vec<f64>,
    pub flux: DMatrix<f64>,
    pub ivar: DMatrix<f64>,
    pub mask: DMatrix<u32>,
    pub resolution_data: Vec<Resolution>,
    pub fibertype: Vec<FiberType>,
}

impl Exposure {
    pub fn new(
        wave: Vec<f64>,
        flux: DMatrix<f64>,
        ivar: DMatrix<f64>,
        mask: DMatrix<u32>,
        resolution_data: Vec<Resolution>,
        fibertype: Vec<FiberType>,
    ) -> Result<Self, SkyError> {
        let exposure = Self {
            wave,
            flux,
            ivar,
            mask,
            resolution_data,
            fibertype,
        };
        exposure.validate()?;
        Ok(exposure)
    }

    pub fn nspec(&self) -> usize {
        self.flux.nrows()
    }

    pub fn nwave(&self) -> usize {
        self.wave.len()
    }

    /// Check every array against `wave` and `flux`.
    pub fn validate(&self) -> Result<(), SkyError> {
        validate_wave(&self.wave)?;
        let shape = (self.nspec(), self.nwave());
        let fmt = |s: (usize, usize)| format!("{}x{}", s.0, s.1);
        if self.flux.shape() != shape {
            return Err(SkyError::shape("flux", fmt(shape), fmt(self.flux.shape())));
        }
        if self.ivar.shape() != shape {
            return Err(SkyError::shape("ivar", fmt(shape), fmt(self.ivar.shape())));
        }
        if self.mask.shape() != shape {
            return Err(SkyError::shape("mask", fmt(shape), fmt(self.mask.shape())));
        }
        if self.resolution_data.len() != self.nspec() {
            return Err(SkyError::shape(
                "resolution_data",
                format!("{} fibers", self.nspec()),
                self.resolution_data.len(),
            ));
        }
        if let Some(r) = self.resolution_data.iter().find(|r| r.nwave() != self.nwave()) {
            return Err(SkyError::shape("resolution nwave", self.nwave(), r.nwave()));
        }
        if self.fibertype.len() != self.nspec() {
            return Err(SkyError::shape(
                "fibertype",
                format!("{} fibers", self.nspec()),
                self.fibertype.len(),
            ));
        }
        Ok(())
    }

    /// Indices of fibers classified as sky.
    pub fn sky_fibers(&self) -> Vec<usize> {
        self.fibertype
            .iter()
            .enumerate()
            .filter_map(|(i, t)| (*t == FiberType::Sky).then_some(i))
            .collect()
    }
}

fn validate_wave(wave: &[f64]) -> Result<(), SkyError> {
    if wave.is_empty() {
        return Err(SkyError::InvalidWavelengthGrid("empty grid".into()));
    }
    if let Some(i) = wave.windows(2).position(|w| !(w[1] > w[0])) {
        return Err(SkyError::InvalidWavelengthGrid(format!(
            "not strictly increasing at index {}",
            i + 1
        )));
    }
    Ok(())
}

/// Copy of row `f` of a `nspec × nwave` array.
pub(crate) fn row_vec(m: &DMatrix<f64>, f: usize) -> Vec<f64> {
    m.row(f).iter().copied().collect()
}

/// Constants of the sky-line variance inflation search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InflationConfig {
    /// Peaks must exceed this fraction of the maximum mean sky.
    pub peak_fraction: f64,
    /// Half-width of the window around each peak (Angstrom).
    pub half_window_angstrom: f64,
    pub sigma_wave_step: f64,
    /// `sigma_wave` search stops below this value.
    pub sigma_wave_max: f64,
    /// Relative flat-field error; the flux ivar already includes it.
    pub sigma_flat: f64,
    /// Worst plausible relative flat error, for outlier screening.
    pub max_flat_error: f64,
    /// Worst plausible wavelength error (Angstrom), for outlier screening.
    pub max_wave_error: f64,
    /// Residuals beyond this many sigma of the worst plausible model error are masked.
    pub outlier_nsig: f64,
}

impl Default for InflationConfig {
    fn default() -> Self {
        Self {
            peak_fraction: 0.1,
            half_window_angstrom: 3.0,
            sigma_wave_step: 0.005,
            sigma_wave_max: 2.0,
            sigma_flat: 0.0,
            max_flat_error: 0.2,
            max_wave_error: 0.5,
            outlier_nsig: 3.0,
        }
    }
}

/// Sky fitting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkyConfig {
    /// Chi-square clipping threshold in sigma.
    pub nsig_clipping: f64,
    pub max_iterations: u32,
    /// Replace ivar by a smooth fiber × wavelength model before fitting.
    pub model_ivar: bool,
    /// Input ivar is kept where it is below this fraction of the per-wavelength median.
    pub model_ivar_threshold: f64,
    /// Inflate the sky variance around sky lines.
    pub add_variance: bool,
    pub inflation: InflationConfig,
}

impl Default for SkyConfig {
    fn default() -> Self {
        Self {
            nsig_clipping: 4.0,
            max_iterations: 100,
            model_ivar: false,
            model_ivar_threshold: 0.01,
            add_variance: true,
            inflation: InflationConfig::default(),
        }
    }
}

impl SkyConfig {
    pub fn validate(&self) -> Result<(), SkyError> {
        if !(self.nsig_clipping.is_finite() && self.nsig_clipping > 0.0) {
            return Err(SkyError::InvalidConfig(format!(
                "nsig_clipping must be finite and > 0, got {}",
                self.nsig_clipping
            )));
        }
        if self.max_iterations == 0 {
            return Err(SkyError::InvalidConfig("max_iterations must be >= 1".into()));
        }
        if !(self.model_ivar_threshold >= 0.0) {
            return Err(SkyError::InvalidConfig("model_ivar_threshold must be >= 0".into()));
        }
        let inf = &self.inflation;
        if !(inf.sigma_wave_step > 0.0 && inf.sigma_wave_max > 0.0) {
            return Err(SkyError::InvalidConfig(
                "sigma_wave_step and sigma_wave_max must be > 0".into(),
            ));
        }
        if !(inf.half_window_angstrom > 0.0 && inf.outlier_nsig > 0.0) {
            return Err(SkyError::InvalidConfig(
                "half_window_angstrom and outlier_nsig must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// The fitted sky, ready to be subtracted from any exposure on the same grid.
///
/// Immutable once constructed; all arrays are `nspec × nwave`.
#[derive(Debug, Clone, PartialEq)]
pub struct SkyModel {
    wave: Vec<f64>,
    flux: DMatrix<f64>,
    ivar: DMatrix<f64>,
    mask: DMatrix<u32>,
    nrej: usize,
    stat_ivar: DMatrix<f64>,
}

impl SkyModel {
    pub fn new(
        wave: Vec<f64>,
        flux: DMatrix<f64>,
        ivar: DMatrix<f64>,
        mask: DMatrix<u32>,
        nrej: usize,
        stat_ivar: DMatrix<f64>,
    ) -> Result<Self, SkyError> {
        validate_wave(&wave)?;
        let shape = flux.shape();
        let fmt = |s: (usize, usize)| format!("{}x{}", s.0, s.1);
        if shape.1 != wave.len() {
            return Err(SkyError::shape("sky flux", format!("nwave={}", wave.len()), fmt(shape)));
        }
        if ivar.shape() != shape {
            return Err(SkyError::shape("sky ivar", fmt(shape), fmt(ivar.shape())));
        }
        if mask.shape() != shape {
            return Err(SkyError::shape("sky mask", fmt(shape), fmt(mask.shape())));
        }
        if stat_ivar.shape() != shape {
            return Err(SkyError::shape("sky stat_ivar", fmt(shape), fmt(stat_ivar.shape())));
        }
        Ok(Self {
            wave,
            flux,
            ivar,
            mask,
            nrej,
            stat_ivar,
        })
    }

    pub fn wave(&self) -> &[f64] {
        &self.wave
    }

    pub fn flux(&self) -> &DMatrix<f64> {
        &self.flux
    }

    pub fn ivar(&self) -> &DMatrix<f64> {
        &self.ivar
    }

    pub fn mask(&self) -> &DMatrix<u32> {
        &self.mask
    }

    /// Pixels rejected while fitting.
    pub fn nrej(&self) -> usize {
        self.nrej
    }

    /// Statistical (pre-inflation) inverse variance.
    pub fn stat_ivar(&self) -> &DMatrix<f64> {
        &self.stat_ivar
    }

    pub fn nspec(&self) -> usize {
        self.flux.nrows()
    }

    pub fn nwave(&self) -> usize {
        self.wave.len()
    }
}

/// Diagnostics of one sky-line peak considered for variance inflation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakInflation {
    pub peak: usize,
    pub wavelength: f64,
    /// Half-open pixel window `[begin, end)`.
    pub begin: usize,
    pub end: usize,
    /// Mean per-wavelength reduced chi-square in the window, before inflation.
    pub mean_chi2: f64,
    /// Mean number of contributing sky fibers in the window.
    pub mean_ndata: f64,
    /// `None` when the search reached its cap without satisfying `chi2 <= 1`.
    pub sigma_wave: Option<f64>,
}

/// Everything the fitter learned besides the model itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub nsky: usize,
    pub iterations: u32,
    pub nrej: usize,
    /// `false` when the iteration budget ran out while pixels were still being rejected.
    pub converged: bool,
    pub final_method: SolveMethod,
    pub covariance_method: SolveMethod,
    /// Empty when inflation was skipped.
    pub peaks: Vec<PeakInflation>,
    pub inflation_applied: bool,
}
