//! Apply a sky model to an exposure.

use crate::domain::{Exposure, SkyModel};
use crate::error::SkyError;
use crate::fit::SkyContext;
use crate::math::{all_close, combine_ivar};

/// `numpy.allclose` defaults.
const WAVE_RTOL: f64 = 1e-5;
const WAVE_ATOL: f64 = 1e-8;

/// Subtract `sky` from `frame` in place, combining inverse variances and masks.
///
/// This is a one-shot operation: calling it twice subtracts the sky twice.
/// The sky model is not modified and can be applied to other frames.
pub fn subtract_sky(frame: &mut Exposure, sky: &SkyModel, ctx: &mut SkyContext<'_>) -> Result<(), SkyError> {
    frame.validate()?;
    if frame.nspec() != sky.nspec() {
        return Err(SkyError::shape("sky model nspec", frame.nspec(), sky.nspec()));
    }
    if frame.nwave() != sky.nwave() {
        return Err(SkyError::shape("sky model nwave", frame.nwave(), sky.nwave()));
    }
    ctx.info("starting");

    if !all_close(&frame.wave, sky.wave(), WAVE_RTOL, WAVE_ATOL) {
        let err = SkyError::GridMismatch;
        ctx.warn(err.to_string());
        return Err(err);
    }

    frame.flux -= sky.flux();
    frame.ivar.zip_apply(sky.ivar(), |a, b| *a = combine_ivar(*a, b));
    frame.mask.zip_apply(sky.mask(), |a, b| *a |= b);

    ctx.info("done");
    Ok(())
}
