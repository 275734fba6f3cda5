//! Shared sky pipeline used by the CLI and the integration tests.
//!
//! synthetic exposure -> sky fit -> subtraction -> residual statistics

use crate::data::{SyntheticExposure, SyntheticSpec, generate_exposure};
use crate::domain::{Exposure, SkyConfig};
use crate::error::SkyError;
use crate::fit::{SkyContext, SkyFit, compute_sky, subtract_sky};
use crate::report::{Reporter, SubtractionStats, compute_subtraction_stats};

/// All computed outputs of a single `skysub run`.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub sample: SyntheticExposure,
    pub fit: SkyFit,
    pub subtracted: Exposure,
    pub stats: SubtractionStats,
}

/// Execute the full pipeline and return the computed outputs.
pub fn run_pipeline(
    spec: &SyntheticSpec,
    config: &SkyConfig,
    reporter: &mut dyn Reporter,
) -> Result<RunOutput, SkyError> {
    let sample = generate_exposure(spec)?;
    let mut ctx = SkyContext::new(config.clone(), reporter);

    let fit = compute_sky(&sample.exposure, &mut ctx)?;

    let mut subtracted = sample.exposure.clone();
    subtract_sky(&mut subtracted, &fit.model, &mut ctx)?;
    let stats = compute_subtraction_stats(&subtracted);

    Ok(RunOutput {
        sample,
        fit,
        subtracted,
        stats,
    })
}
