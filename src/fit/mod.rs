//! Sky fitting.
//!
//! Responsibilities:
//!
//! - accumulate weighted normal equations over sky fibers
//! - solve with iterative outlier rejection
//! - convolve the deconvolved sky back to each fiber and inflate its variance
//! - subtract a sky model from an exposure

pub mod clipping;
pub mod context;
pub mod inflation;
pub mod normal;
pub mod sky;
pub mod subtract;

pub use clipping::{ClippedFit, RejectionPolicy, fit_with_clipping};
pub use context::*;
pub use inflation::{Inflation, InflationInput, inflate_sky_variance};
pub use normal::*;
pub use sky::*;
pub use subtract::*;
