//! Sky model estimation for one exposure.
//!
//! Given:
//! - an exposure whose sky fibers are flagged `SKY`
//! - flat-fielded flux (we don't check this here)
//!
//! we:
//! - fit one deconvolved sky spectrum shared by all sky fibers (with clipping)
//! - solve once more for its covariance
//! - convolve sky and variance back to every fiber's resolution
//! - optionally inflate the variance around sky lines

use nalgebra::DMatrix;

use crate::domain::{Exposure, FitSummary, MAX_SKY_FIBER_INDEX, SKY_MODEL_BAD, SkyModel};
use crate::error::SkyError;
use crate::fit::SkyContext;
use crate::fit::clipping::{fit_with_clipping, model_ivar};
use crate::fit::inflation::{
    InflationInput, broadcast, convolve_per_fiber, convolved_sky_ivar, inflate_sky_variance,
    mean_spectrum, select_rows,
};
use crate::resolution::Resolution;

/// A fitted sky model plus the fit diagnostics.
#[derive(Debug, Clone)]
pub struct SkyFit {
    pub model: SkyModel,
    pub summary: FitSummary,
}

/// Estimate the sky model of `frame`.
pub fn compute_sky(frame: &Exposure, ctx: &mut SkyContext<'_>) -> Result<SkyFit, SkyError> {
    ctx.config.validate()?;
    frame.validate()?;
    ctx.info("starting");

    let skyfibers = frame.sky_fibers();
    let Some(&max_index) = skyfibers.iter().max() else {
        return Err(SkyError::NoSkyFibers);
    };
    if max_index >= MAX_SKY_FIBER_INDEX {
        return Err(SkyError::SkyFiberIndexOutOfRange {
            index: max_index,
            limit: MAX_SKY_FIBER_INDEX,
        });
    }

    let nsky = skyfibers.len();
    let nspec = frame.nspec();
    let nwave = frame.nwave();

    // Working copies restricted to sky fibers; masked pixels get zero weight.
    let flux = select_rows(&frame.flux, &skyfibers);
    let masked_ivar = DMatrix::from_fn(nsky, nwave, |r, j| {
        let f = skyfibers[r];
        if frame.mask[(f, j)] == 0 { frame.ivar[(f, j)] } else { 0.0 }
    });
    let rsky: Vec<&Resolution> = skyfibers.iter().map(|&f| &frame.resolution_data[f]).collect();

    let current_ivar = if ctx.config.model_ivar {
        ctx.info("use a model of the inverse variance to remove bias due to correlated ivar and flux");
        model_ivar(&masked_ivar, ctx.config.model_ivar_threshold)
    } else {
        masked_ivar.clone()
    };

    let clipped = fit_with_clipping(&flux, current_ivar, &rsky, ctx)?;

    let covar = clipped.normal.solve_with_covariance();
    if let Some(reason) = &covar.fallback_reason {
        ctx.warn(format!(
            "cholesky_solve_and_invert failed ({reason}), switching to pseudo-inverse"
        ));
    }

    // Variance of the sky convolved with the mean resolution of all fibers.
    let mean_resolution = Resolution::mean(&frame.resolution_data)?;
    let cskyivar = convolved_sky_ivar(&covar.covariance, &mean_resolution);

    let skyflux = clipped.skyflux.as_slice();
    let cskyflux = convolve_per_fiber(&frame.resolution_data, skyflux);

    let (ivar, peaks, inflation_applied) = if nsky > 1 && ctx.config.add_variance {
        ctx.info("add a model error due to wavelength solution noise");
        let msky = mean_spectrum(&cskyflux);
        let sky_cskyflux = select_rows(&cskyflux, &skyfibers);
        let input = InflationInput {
            wave: &frame.wave,
            flux: &flux,
            ivar: &masked_ivar,
            cskyflux: &sky_cskyflux,
            msky: &msky,
            cskyivar: &cskyivar,
        };
        let inflation = inflate_sky_variance(&input, &ctx.config.inflation, &mut *ctx.reporter);
        let ivar = inflation.inflated_ivar(&cskyivar);
        (ivar, inflation.peaks, true)
    } else {
        (cskyivar.clone(), Vec::new(), false)
    };

    let mask = DMatrix::from_fn(nspec, nwave, |_, j| {
        if cskyivar[j] == 0.0 { SKY_MODEL_BAD } else { 0 }
    });

    let model = SkyModel::new(
        frame.wave.clone(),
        cskyflux,
        broadcast(&ivar, nspec),
        mask,
        clipped.nout_tot,
        broadcast(&cskyivar, nspec),
    )?;

    let summary = FitSummary {
        nsky,
        iterations: clipped.iterations,
        nrej: clipped.nout_tot,
        converged: clipped.converged,
        final_method: clipped.method,
        covariance_method: covar.method,
        peaks,
        inflation_applied,
    };
    ctx.reporter.on_finish(&summary);

    Ok(SkyFit { model, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FiberType, SkyConfig};
    use crate::report::MemoryReporter;

    fn exposure(nspec: usize, nwave: usize, sky: &[usize]) -> Exposure {
        let wave: Vec<f64> = (0..nwave).map(|i| 6000.0 + i as f64).collect();
        let flux = DMatrix::from_fn(nspec, nwave, |_, j| 50.0 + j as f64);
        let fibertype = (0..nspec)
            .map(|f| if sky.contains(&f) { FiberType::Sky } else { FiberType::Target })
            .collect();
        Exposure::new(
            wave,
            flux,
            DMatrix::from_element(nspec, nwave, 4.0),
            DMatrix::zeros(nspec, nwave),
            vec![Resolution::identity(nwave); nspec],
            fibertype,
        )
        .unwrap()
    }

    #[test]
    fn no_sky_fibers_is_fatal() {
        let frame = exposure(3, 8, &[]);
        let mut reporter = MemoryReporter::new();
        let mut ctx = SkyContext::new(SkyConfig::default(), &mut reporter);
        assert!(matches!(compute_sky(&frame, &mut ctx), Err(SkyError::NoSkyFibers)));
    }

    #[test]
    fn sky_fiber_index_must_be_below_hardware_limit() {
        let frame = exposure(502, 4, &[0, 501]);
        let mut reporter = MemoryReporter::new();
        let mut ctx = SkyContext::new(SkyConfig::default(), &mut reporter);
        let err = compute_sky(&frame, &mut ctx).unwrap_err();
        assert!(matches!(err, SkyError::SkyFiberIndexOutOfRange { index: 501, limit: 500 }));
    }

    #[test]
    fn noise_free_sky_is_recovered_for_every_fiber() {
        let frame = exposure(5, 12, &[0, 2, 4]);
        let mut reporter = MemoryReporter::new();
        let mut ctx = SkyContext::new(SkyConfig::default(), &mut reporter);
        let fit = compute_sky(&frame, &mut ctx).unwrap();

        assert_eq!(fit.model.nrej(), 0);
        assert_eq!(fit.summary.iterations, 1);
        assert!(fit.summary.converged);
        assert_eq!(fit.model.flux().shape(), (5, 12));
        assert!((fit.model.flux() - &frame.flux).abs().max() < 1e-9);
        // Three fibers with ivar 4 each: statistical sky ivar is 12.
        assert!((fit.model.stat_ivar()[(1, 3)] - 12.0).abs() < 1e-9);
        assert!(fit.model.mask().iter().all(|&m| m == 0));
        // The rejection total is delivered once, through the summary.
        assert_eq!(reporter.summary.as_ref().map(|s| s.nrej), Some(0));
        assert!(!reporter.infos.iter().any(|m| m.starts_with("nout tot")));
    }

    #[test]
    fn single_sky_fiber_skips_inflation() {
        let frame = exposure(3, 10, &[1]);
        let mut reporter = MemoryReporter::new();
        let mut ctx = SkyContext::new(SkyConfig::default(), &mut reporter);
        let fit = compute_sky(&frame, &mut ctx).unwrap();
        assert!(!fit.summary.inflation_applied);
        assert_eq!(fit.model.ivar(), fit.model.stat_ivar());
    }

    #[test]
    fn fully_masked_wavelength_is_flagged() {
        let mut frame = exposure(4, 10, &[0, 1, 2, 3]);
        for f in 0..4 {
            frame.mask[(f, 6)] = 1;
        }
        let mut reporter = MemoryReporter::new();
        let mut ctx = SkyContext::new(SkyConfig::default(), &mut reporter);
        let fit = compute_sky(&frame, &mut ctx).unwrap();

        assert_eq!(fit.model.mask()[(2, 6)], SKY_MODEL_BAD);
        assert_eq!(fit.model.ivar()[(2, 6)], 0.0);
        assert_eq!(fit.model.mask()[(2, 5)], 0);
        // The unconstrained wavelength forces the covariance fallback.
        assert!(!reporter.warnings.is_empty());
        assert!(fit.model.flux().iter().all(|v| v.is_finite()));
    }
}
