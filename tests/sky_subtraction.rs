use std::collections::BTreeSet;

use nalgebra::DMatrix;

use skysub::app::pipeline::run_pipeline;
use skysub::data::{SyntheticSpec, generate_exposure};
use skysub::domain::{Exposure, FiberType, SkyConfig, SkyModel};
use skysub::error::SkyError;
use skysub::fit::{SkyContext, compute_sky, subtract_sky};
use skysub::math::combine_ivar;
use skysub::report::MemoryReporter;
use skysub::resolution::Resolution;

fn small_spec() -> SyntheticSpec {
    SyntheticSpec {
        nspec: 12,
        nwave: 120,
        wave_min: 6280.0,
        ..SyntheticSpec::default()
    }
}

#[test]
fn noise_free_pipeline_removes_sky_from_every_fiber() {
    let spec = SyntheticSpec {
        noise: false,
        ..small_spec()
    };
    let mut reporter = MemoryReporter::new();
    let run = run_pipeline(&spec, &SkyConfig::default(), &mut reporter).unwrap();

    assert_eq!(run.fit.model.nrej(), 0);
    assert_eq!(run.fit.summary.iterations, 1);

    // What remains is the object flux, i.e. input minus the true convolved sky.
    let expected = &run.sample.exposure.flux - &run.sample.convolved_sky;
    let err = (&run.subtracted.flux - &expected).abs().max();
    assert!(err < 1e-6, "max residual {err}");
}

#[test]
fn noisy_pipeline_leaves_noise_level_residuals() {
    let mut reporter = MemoryReporter::new();
    let run = run_pipeline(&small_spec(), &SkyConfig::default(), &mut reporter).unwrap();

    assert!(run.stats.npix > 0);
    assert!(
        run.stats.sky_chi2pdf > 0.2 && run.stats.sky_chi2pdf < 1.5,
        "chi2pdf {}",
        run.stats.sky_chi2pdf
    );
    assert_eq!(reporter.iterations.len() as u32, run.fit.summary.iterations);
    assert!(reporter.summary.is_some());
}

#[test]
fn cosmic_rays_on_sky_fibers_are_rejected() {
    let spec = SyntheticSpec {
        cosmics: 4,
        ..small_spec()
    };
    let mut reporter = MemoryReporter::new();
    let run = run_pipeline(&spec, &SkyConfig::default(), &mut reporter).unwrap();

    let distinct: BTreeSet<_> = run.sample.cosmic_hits.iter().copied().collect();
    assert!(run.fit.summary.nrej >= distinct.len());
    assert!(run.fit.summary.iterations >= 2);
    assert!(run.fit.summary.converged);
    // Iteration 0 never rejects more than one fiber per wavelength.
    assert!(reporter.iterations[0].nout <= spec.nwave);
}

#[test]
fn host_can_abort_between_iterations() {
    let spec = SyntheticSpec {
        cosmics: 4,
        ..small_spec()
    };
    let mut reporter = MemoryReporter {
        abort_after: Some(1),
        ..MemoryReporter::new()
    };
    let err = run_pipeline(&spec, &SkyConfig::default(), &mut reporter).unwrap_err();
    assert!(matches!(err, SkyError::Aborted { iteration: 1 }));
    assert_eq!(err.exit_code(), 5);
    assert_eq!(reporter.iterations.len(), 1);
}

#[test]
fn inflated_variance_never_drops_below_statistical_variance() {
    let mut reporter = MemoryReporter::new();
    let run = run_pipeline(&small_spec(), &SkyConfig::default(), &mut reporter).unwrap();
    let model = &run.fit.model;

    assert!(run.fit.summary.inflation_applied);
    assert!(!run.fit.summary.peaks.is_empty());
    for (ivar, stat) in model.ivar().iter().zip(model.stat_ivar().iter()) {
        assert!(*ivar <= *stat * (1.0 + 1e-12));
    }
    // The strongest line needs extra variance.
    let worst = model
        .ivar()
        .iter()
        .zip(model.stat_ivar().iter())
        .any(|(ivar, stat)| *ivar < *stat);
    assert!(worst);
}

#[test]
fn single_sky_fiber_keeps_statistical_variance() {
    let spec = SyntheticSpec {
        nspec: 5,
        sky_every: 5,
        ..small_spec()
    };
    let sample = generate_exposure(&spec).unwrap();
    assert_eq!(sample.exposure.sky_fibers(), vec![0]);

    let mut reporter = MemoryReporter::new();
    let mut ctx = SkyContext::new(SkyConfig::default(), &mut reporter);
    let fit = compute_sky(&sample.exposure, &mut ctx).unwrap();
    assert!(!fit.summary.inflation_applied);
    assert_eq!(fit.model.ivar(), fit.model.stat_ivar());
}

#[test]
fn duplicate_and_dead_fibers_still_give_finite_sky() {
    let nwave = 16;
    let wave: Vec<f64> = (0..nwave).map(|i| 7000.0 + 0.5 * i as f64).collect();
    let flux = DMatrix::from_fn(3, nwave, |_, j| 10.0 + (j % 4) as f64);
    // Fiber 1 duplicates fiber 0; fiber 2 has no weight at all, and a block
    // of wavelengths is dead everywhere so the full normal matrix is singular.
    let mut ivar = DMatrix::from_element(3, nwave, 1.0);
    ivar.row_mut(2).fill(0.0);
    for j in 6..12 {
        ivar[(0, j)] = 0.0;
        ivar[(1, j)] = 0.0;
    }
    let r = skysub::data::gaussian_resolution(nwave, 5, 0.8).unwrap();
    let frame = Exposure::new(
        wave,
        flux,
        ivar,
        DMatrix::zeros(3, nwave),
        vec![r; 3],
        vec![FiberType::Sky; 3],
    )
    .unwrap();

    let mut reporter = MemoryReporter::new();
    let mut ctx = SkyContext::new(SkyConfig::default(), &mut reporter);
    let fit = compute_sky(&frame, &mut ctx).unwrap();
    assert!(fit.model.flux().iter().all(|v| v.is_finite()));
    assert!(fit.model.ivar().iter().all(|v| v.is_finite() && *v >= 0.0));
    assert_ne!(fit.summary.covariance_method, skysub::math::SolveMethod::Cholesky);
    assert!(!reporter.warnings.is_empty());
}

#[test]
fn subtraction_rejects_foreign_wavelength_grid() {
    let sample = generate_exposure(&SyntheticSpec {
        noise: false,
        ..small_spec()
    })
    .unwrap();
    let mut reporter = MemoryReporter::new();
    let mut ctx = SkyContext::new(SkyConfig::default(), &mut reporter);
    let fit = compute_sky(&sample.exposure, &mut ctx).unwrap();

    let shifted: Vec<f64> = fit.model.wave().iter().map(|w| w + 0.4).collect();
    let foreign = SkyModel::new(
        shifted,
        fit.model.flux().clone(),
        fit.model.ivar().clone(),
        fit.model.mask().clone(),
        fit.model.nrej(),
        fit.model.stat_ivar().clone(),
    )
    .unwrap();

    let mut frame = sample.exposure.clone();
    let err = subtract_sky(&mut frame, &foreign, &mut ctx).unwrap_err();
    assert!(matches!(err, SkyError::GridMismatch));
    assert_eq!(frame.flux, sample.exposure.flux);
    assert!(reporter.warnings.iter().any(|w| w.contains("same wavelength grid")));
}

#[test]
fn combined_ivar_ignores_missing_information() {
    let a = [0.0, 0.5, 2.0, 10.0];
    for &x in &a {
        assert_eq!(combine_ivar(x, 0.0), x);
        for &y in &a {
            assert_eq!(combine_ivar(x, y), combine_ivar(y, x));
        }
    }
}

#[test]
fn identity_resolution_recovers_shared_sky_exactly() {
    let nwave = 30;
    let wave: Vec<f64> = (0..nwave).map(|i| 5500.0 + i as f64).collect();
    let sky: Vec<f64> = (0..nwave).map(|j| 5.0 + if j == 12 { 300.0 } else { 0.0 }).collect();
    let flux = DMatrix::from_fn(4, nwave, |_, j| sky[j]);
    let frame = Exposure::new(
        wave,
        flux,
        DMatrix::from_element(4, nwave, 1.0),
        DMatrix::zeros(4, nwave),
        vec![Resolution::identity(nwave); 4],
        vec![FiberType::Sky; 4],
    )
    .unwrap();

    let mut reporter = MemoryReporter::new();
    let mut ctx = SkyContext::new(SkyConfig::default(), &mut reporter);
    let fit = compute_sky(&frame, &mut ctx).unwrap();
    assert_eq!(fit.model.nrej(), 0);
    for j in 0..nwave {
        assert!((fit.model.flux()[(2, j)] - sky[j]).abs() < 1e-10);
    }
}
