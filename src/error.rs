//! Error type shared by the library and the `skysub` binary.
//!
//! Only fatal conditions live here. Numerical singularities in the solver are
//! recovered through fallback paths and surface as reporter warnings instead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkyError {
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    #[error("invalid wavelength grid: {0}")]
    InvalidWavelengthGrid(String),

    #[error("frame and sky not on same wavelength grid")]
    GridMismatch,

    #[error("no sky fibers found in exposure")]
    NoSkyFibers,

    /// Sky fibers are addressed by index within one spectrograph, never by fiber number.
    #[error("sky fiber index {index} is out of range (must be < {limit})")]
    SkyFiberIndexOutOfRange { index: usize, limit: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sky fit aborted by host at iteration {iteration}")]
    Aborted { iteration: u32 },

    #[error("failed to access '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid sky model JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl SkyError {
    pub fn shape(what: &'static str, expected: impl ToString, actual: impl ToString) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Process exit code used by the binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            SkyError::InvalidConfig(_) | SkyError::Io { .. } | SkyError::Json(_) => 2,
            SkyError::NoSkyFibers => 3,
            SkyError::ShapeMismatch { .. }
            | SkyError::InvalidWavelengthGrid(_)
            | SkyError::GridMismatch
            | SkyError::SkyFiberIndexOutOfRange { .. } => 4,
            SkyError::Aborted { .. } => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_categories() {
        assert_eq!(SkyError::NoSkyFibers.exit_code(), 3);
        assert_eq!(SkyError::GridMismatch.exit_code(), 4);
        assert_eq!(SkyError::InvalidConfig("x".into()).exit_code(), 2);
        assert_eq!(SkyError::Aborted { iteration: 1 }.exit_code(), 5);
    }

    #[test]
    fn shape_helper_formats_message() {
        let err = SkyError::shape("ivar", "3x4", "3x5");
        assert_eq!(err.to_string(), "shape mismatch for ivar: expected 3x4, got 3x5");
    }
}
