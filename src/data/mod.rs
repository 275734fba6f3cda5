//! Input data sources.
//!
//! Real exposures come from FITS readers outside this crate; here we only
//! provide a synthetic generator for demos and tests.

pub mod sample;

pub use sample::*;
