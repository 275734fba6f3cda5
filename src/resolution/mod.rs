//! Per-fiber resolution operators.
//!
//! A resolution operator maps a true (deconvolved) spectrum onto what a given
//! fiber observes. The fitter relies on four primitive operations:
//! - forward application (model evaluation)
//! - row weighting by `√ivar`
//! - the normal-equation contribution `(√w R)ᵗ(√w R)`, `(√w R)ᵗ √w f`
//! - the covariance sandwich `R C Rᵗ`

pub mod operator;

pub use operator::*;
