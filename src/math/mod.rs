//! Numerical utilities: band storage, robust solves, and inverse-variance arithmetic.

pub mod banded;
pub mod ivar;
pub mod solve;

pub use banded::*;
pub use ivar::*;
pub use solve::*;
