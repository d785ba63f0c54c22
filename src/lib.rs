//! TS map estimation for binned gamma-ray counts images.
//!
//! For every pixel of a counts image a single source amplitude is fitted by
//! maximising a Poisson (Cash) likelihood against a background model, using a
//! source template built from the exposure and a PSF/morphology kernel. The
//! improvement of the statistic over the background-only hypothesis gives the
//! test statistic (TS) of a source at that position.

pub mod errors;
pub mod estimator;
pub mod kernels;
pub mod multiscale;
pub mod processing;
pub mod types;

pub use errors::TsMapError;
pub use estimator::{ErrorMethod, FitMethod, TsMapConfig, TsMapEstimator};
pub use kernels::{GaussComponent, Morphology, MultiGaussPsf, Sampling};
pub use multiscale::{
    compute_maximum_ts_image, compute_ts_image_multiscale, Downsample, MaximumTsMaps,
    MultiScaleConfig, ScaleResult,
};
pub use types::{FitStatus, ImageStack, Kernel, Layer, PixelResult, ResultKind, ResultMaps};

/// Unit rescaling between the fitted amplitude and the reported flux.
/// Shared by bounds estimation, every solver and both error estimators.
pub const FLUX_FACTOR: f64 = 1e-12;

/// Iteration cap for every per-pixel root finder.
pub const MAX_NITER: usize = 20;

/// Default relative tolerance of the amplitude fit.
pub const RTOL: f64 = 1e-3;
