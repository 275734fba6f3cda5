//! `skysub` library crate.
//!
//! The binary (`skysub`) is a thin wrapper around this library so that:
//!
//! - the sky fitter is testable without spawning processes
//! - pipelines can embed it with their own I/O and diagnostics sinks
//!
//! Typical use:
//!
//! ```no_run
//! use skysub::domain::{Exposure, SkyConfig};
//! use skysub::fit::{SkyContext, compute_sky, subtract_sky};
//! use skysub::report::LogReporter;
//!
//! fn process(frame: &mut Exposure) -> Result<(), skysub::error::SkyError> {
//!     let mut reporter = LogReporter;
//!     let mut ctx = SkyContext::new(SkyConfig::default(), &mut reporter);
//!     let sky = compute_sky(frame, &mut ctx)?;
//!     subtract_sky(frame, &sky.model, &mut ctx)
//! }
//! ```

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod report;
pub mod resolution;
