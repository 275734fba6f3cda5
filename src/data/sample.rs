//! Synthetic exposure generation.
//!
//! The true sky is a flat continuum plus Gaussian emission lines. Each fiber
//! sees it through its own Gaussian line-spread function, whose width drifts
//! slowly across the slit. Target fibers get an extra smooth object spectrum.

use nalgebra::DMatrix;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::domain::{Exposure, FiberType};
use crate::error::SkyError;
use crate::resolution::Resolution;

/// A sky emission line (Angstrom units).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyLine {
    pub wavelength: f64,
    pub amplitude: f64,
    /// Intrinsic Gaussian sigma, before the instrument.
    pub width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticSpec {
    pub nspec: usize,
    pub nwave: usize,
    pub wave_min: f64,
    pub wave_step: f64,
    /// Every `sky_every`-th fiber (starting at 0) is a sky fiber.
    pub sky_every: usize,
    pub ndiag: usize,
    /// Line-spread sigma in pixels at the first fiber.
    pub lsf_sigma: f64,
    /// Relative LSF width change from the first to the last fiber.
    pub lsf_drift: f64,
    pub continuum: f64,
    pub lines: Vec<SkyLine>,
    /// Peak object flux added to target fibers.
    pub target_flux: f64,
    pub read_noise: f64,
    pub noise: bool,
    /// Cosmic-ray hits injected on sky fibers.
    pub cosmics: usize,
    pub cosmic_amplitude: f64,
    pub seed: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            nspec: 20,
            nwave: 200,
            wave_min: 6250.0,
            wave_step: 0.8,
            sky_every: 4,
            ndiag: 11,
            lsf_sigma: 1.0,
            lsf_drift: 0.1,
            continuum: 20.0,
            lines: vec![
                SkyLine { wavelength: 6300.3, amplitude: 400.0, width: 0.5 },
                SkyLine { wavelength: 6363.8, amplitude: 150.0, width: 0.5 },
                SkyLine { wavelength: 6329.8, amplitude: 60.0, width: 0.5 },
            ],
            target_flux: 30.0,
            read_noise: 3.0,
            noise: true,
            cosmics: 0,
            cosmic_amplitude: 5000.0,
            seed: 42,
        }
    }
}

/// A generated exposure together with the sky it was built from.
#[derive(Debug, Clone)]
pub struct SyntheticExposure {
    pub exposure: Exposure,
    /// Deconvolved (native resolution) sky.
    pub true_sky: Vec<f64>,
    /// Noise-free sky as seen by each fiber.
    pub convolved_sky: DMatrix<f64>,
    /// `(fiber, pixel)` of injected cosmic rays.
    pub cosmic_hits: Vec<(usize, usize)>,
}

impl SyntheticSpec {
    pub fn validate(&self) -> Result<(), SkyError> {
        if self.nspec == 0 || self.nwave < 2 {
            return Err(SkyError::InvalidConfig("synthetic exposure needs nspec >= 1 and nwave >= 2".into()));
        }
        if !(self.wave_step.is_finite() && self.wave_step > 0.0 && self.wave_min.is_finite()) {
            return Err(SkyError::InvalidConfig("wave_step must be finite and > 0".into()));
        }
        if self.sky_every == 0 {
            return Err(SkyError::InvalidConfig("sky_every must be >= 1".into()));
        }
        if self.ndiag % 2 == 0 {
            return Err(SkyError::InvalidConfig(format!("ndiag must be odd, got {}", self.ndiag)));
        }
        if !(self.lsf_sigma > 0.0 && self.lsf_drift > -1.0) {
            return Err(SkyError::InvalidConfig("lsf_sigma must be > 0 and lsf_drift > -1".into()));
        }
        if self.noise && !(self.read_noise > 0.0) {
            return Err(SkyError::InvalidConfig("read_noise must be > 0 when noise is enabled".into()));
        }
        if self.lines.iter().any(|l| !(l.width > 0.0)) {
            return Err(SkyError::InvalidConfig("sky line widths must be > 0".into()));
        }
        Ok(())
    }

    pub fn wave(&self) -> Vec<f64> {
        (0..self.nwave).map(|i| self.wave_min + self.wave_step * i as f64).collect()
    }

    pub fn fibertype(&self, fiber: usize) -> FiberType {
        if fiber % self.sky_every == 0 { FiberType::Sky } else { FiberType::Target }
    }
}

/// Sky spectrum at native resolution.
pub fn true_sky(wave: &[f64], continuum: f64, lines: &[SkyLine]) -> Vec<f64> {
    wave.iter()
        .map(|&w| {
            continuum
                + lines
                    .iter()
                    .map(|l| l.amplitude * (-0.5 * ((w - l.wavelength) / l.width).powi(2)).exp())
                    .sum::<f64>()
        })
        .collect()
}

/// Gaussian line-spread function; each column sums to one where it fits on the grid.
pub fn gaussian_resolution(nwave: usize, ndiag: usize, sigma: f64) -> Result<Resolution, SkyError> {
    let h = ndiag / 2;
    let kernel: Vec<f64> = (0..ndiag)
        .map(|k| {
            let d = k as f64 - h as f64;
            (-0.5 * (d / sigma).powi(2)).exp()
        })
        .collect();
    let norm: f64 = kernel.iter().sum();

    let mut data = vec![0.0; ndiag * nwave];
    for (k, v) in kernel.iter().enumerate() {
        for j in 0..nwave {
            data[k * nwave + j] = v / norm;
        }
    }
    Resolution::new(ndiag, nwave, data)
}

pub fn generate_exposure(spec: &SyntheticSpec) -> Result<SyntheticExposure, SkyError> {
    spec.validate()?;

    let mut rng = StdRng::seed_from_u64(spec.seed);
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| SkyError::InvalidConfig(format!("noise distribution error: {e}")))?;

    let wave = spec.wave();
    let sky = true_sky(&wave, spec.continuum, &spec.lines);
    let center = 0.5 * (wave[0] + wave[spec.nwave - 1]);
    let span = wave[spec.nwave - 1] - wave[0];

    let mut resolution_data = Vec::with_capacity(spec.nspec);
    let mut fibertype = Vec::with_capacity(spec.nspec);
    let mut convolved_sky = DMatrix::zeros(spec.nspec, spec.nwave);
    let mut flux = DMatrix::zeros(spec.nspec, spec.nwave);
    let mut ivar = DMatrix::zeros(spec.nspec, spec.nwave);

    for f in 0..spec.nspec {
        let slit = if spec.nspec > 1 { f as f64 / (spec.nspec - 1) as f64 } else { 0.0 };
        let sigma = spec.lsf_sigma * (1.0 + spec.lsf_drift * slit);
        let r = gaussian_resolution(spec.nwave, spec.ndiag, sigma)?;
        let csky = r.apply(&sky);
        let kind = spec.fibertype(f);

        for j in 0..spec.nwave {
            let object = if kind == FiberType::Target {
                // Smooth object continuum, tilted across the band.
                spec.target_flux * (1.0 + 0.5 * (wave[j] - center) / span) * (1.0 + slit)
            } else {
                0.0
            };
            let signal = csky[j] + object;
            convolved_sky[(f, j)] = csky[j];
            if spec.noise {
                let var = spec.read_noise * spec.read_noise + signal.max(0.0);
                flux[(f, j)] = signal + var.sqrt() * normal.sample(&mut rng);
                ivar[(f, j)] = 1.0 / var;
            } else {
                flux[(f, j)] = signal;
                ivar[(f, j)] = 1.0;
            }
        }

        resolution_data.push(r);
        fibertype.push(kind);
    }

    let sky_fibers: Vec<usize> = (0..spec.nspec).filter(|&f| spec.fibertype(f) == FiberType::Sky).collect();
    let mut cosmic_hits = Vec::with_capacity(spec.cosmics);
    if !sky_fibers.is_empty() {
        for _ in 0..spec.cosmics {
            let f = sky_fibers[rng.gen_range(0..sky_fibers.len())];
            let j = rng.gen_range(0..spec.nwave);
            flux[(f, j)] += spec.cosmic_amplitude;
            cosmic_hits.push((f, j));
        }
    }

    let exposure = Exposure::new(
        wave,
        flux,
        ivar,
        DMatrix::zeros(spec.nspec, spec.nwave),
        resolution_data,
        fibertype,
    )?;

    Ok(SyntheticExposure {
        exposure,
        true_sky: sky,
        convolved_sky,
        cosmic_hits,
    })
}
