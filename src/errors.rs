//! Configuration errors raised before any per-pixel work starts.

use thiserror::Error;

/// Structural failures of a TS map request.
///
/// Numerical failures inside a single pixel fit are never reported here; they
/// are carried by [`crate::FitStatus::Failed`] and NaN result values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TsMapError {
    #[error("not a valid method: '{0}' (expected 'root brentq', 'root newton' or 'leastsq iter')")]
    InvalidMethod(String),

    #[error("not a valid error method: '{0}' (expected 'covar' or 'conf')")]
    InvalidErrorMethod(String),

    #[error("not a valid output map: '{0}'")]
    InvalidOutput(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: String,
    },

    #[error("required input map '{0}' is missing")]
    MissingLayer(&'static str),

    #[error("shape mismatch for '{name}': expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("invalid kernel: {0}")]
    InvalidKernel(String),

    #[error("shell morphology requires a relative shell width")]
    MissingShellWidth,
}
