//! Domain types used throughout the sky fit.
//!
//! This module defines:
//!
//! - the consumed exposure (`Exposure`, `FiberType`)
//! - fit configuration (`SkyConfig`, `InflationConfig`)
//! - fit outputs (`SkyModel`, `FitSummary`, `PeakInflation`)

pub mod types;

pub use types::*;
