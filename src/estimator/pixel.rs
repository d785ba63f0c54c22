//! Single-pixel TS evaluation (Stewart 2009).

use ndarray::{s, Array2, ArrayView2};

use super::cash::FitWindow;
use super::solvers::{AmplitudeFit, FitMethod};
use super::uncertainty::ErrorMethod;
use crate::types::{FitStatus, Kernel, PixelResult};
use crate::{FLUX_FACTOR, MAX_NITER};

/// Read-only images shared by every pixel of one run.
pub struct PixelInputs<'a> {
    pub counts: &'a Array2<f64>,
    pub background: &'a Array2<f64>,
    pub exposure: &'a Array2<f64>,
    /// Per-pixel Cash statistic of the background-only model.
    pub null_statistic: &'a Array2<f64>,
    pub kernel: &'a Kernel,
    /// Matched-filter flux estimate; required by Newton and by the threshold.
    pub flux_default: Option<&'a Array2<f64>>,
}

/// Per-pixel fit settings, fixed for a whole run.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FitSettings {
    pub method: FitMethod,
    /// Error method and sigma level, `None` if no error map was requested.
    pub error: Option<(ErrorMethod, u32)>,
    /// Upper-limit method and sigma level, `None` if no upper-limit map was requested.
    pub upper_limit: Option<(ErrorMethod, u32)>,
    pub threshold: Option<f64>,
    pub rtol: f64,
}

/// Window of the kernel's shape centred on `(row, col)`, or `None` when the
/// window does not fit inside the image.
pub fn extract_window<'a>(
    array: &'a Array2<f64>,
    half_size: (usize, usize),
    position: (usize, usize),
) -> Option<ArrayView2<'a, f64>> {
    let (hy, hx) = half_size;
    let (y, x) = position;
    let (ny, nx) = array.dim();
    if y < hy || x < hx || y + hy >= ny || x + hx >= nx {
        return None;
    }
    Some(array.slice(s![y - hy..=y + hy, x - hx..=x + hx]))
}

/// `-1`, `0` or `1`; NaN stays NaN.
fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        value * 0.0
    }
}

fn failed(settings: &FitSettings) -> PixelResult {
    PixelResult {
        ts: f64::NAN,
        flux: f64::NAN,
        niter: MAX_NITER,
        flux_err: settings.error.map(|_| f64::NAN),
        flux_ul: settings.upper_limit.map(|_| f64::NAN),
        status: FitStatus::Failed,
    }
}

/// Fit the source amplitude at `position` and derive TS, flux, error and
/// upper limit.
///
/// TS carries the sign of the fitted amplitude, so flux deficits show up as
/// negative TS. Numerical failures yield [`FitStatus::Failed`] with NaN values.
pub fn evaluate(
    position: (usize, usize),
    inputs: &PixelInputs<'_>,
    settings: &FitSettings,
) -> PixelResult {
    let half = inputs.kernel.half_size();
    let windows = (
        extract_window(inputs.counts, half, position),
        extract_window(inputs.background, half, position),
        extract_window(inputs.exposure, half, position),
        extract_window(inputs.null_statistic, half, position),
    );
    let (Some(counts), Some(background), Some(exposure), Some(null_statistic)) = windows else {
        return failed(settings);
    };

    let template = &exposure * inputs.kernel.array();
    let window = FitWindow {
        counts,
        background,
        template: template.view(),
    };
    let c_0 = null_statistic.sum();

    let seed = inputs
        .flux_default
        .map_or(f64::NAN, |flux| flux[position] / FLUX_FACTOR);

    if let Some(threshold) = settings.threshold {
        let c_1 = window.statistic(seed);
        let improvement = c_0 - c_1;
        if !(improvement >= threshold) {
            return PixelResult {
                ts: clamp_improvement(improvement) * sign(seed),
                flux: seed * FLUX_FACTOR,
                niter: 0,
                flux_err: settings.error.map(|_| f64::NAN),
                flux_ul: settings.upper_limit.map(|_| f64::NAN),
                status: FitStatus::BelowThreshold,
            };
        }
    }

    let fit = settings.method.fit(&window, seed, settings.rtol);
    let status = match fit {
        AmplitudeFit::Fitted { .. } => FitStatus::Fitted,
        AmplitudeFit::NoCounts { .. } => FitStatus::NoCounts,
        AmplitudeFit::Failed => return failed(settings),
    };
    let amplitude = fit.amplitude();

    let c_1 = window.statistic(amplitude);
    let flux = amplitude * FLUX_FACTOR;

    PixelResult {
        ts: clamp_improvement(c_0 - c_1) * sign(amplitude),
        flux,
        niter: fit.niter(),
        flux_err: settings
            .error
            .map(|(method, sigma)| method.flux_delta(&window, amplitude, c_1, sigma)),
        flux_ul: settings
            .upper_limit
            .map(|(method, sigma)| flux + method.flux_delta(&window, amplitude, c_1, sigma)),
        status,
    }
}

/// A best fit never does worse than the null hypothesis; rounding residue
/// below zero is dropped. NaN passes through.
fn clamp_improvement(value: f64) -> f64 {
    if value < 0.0 {
        0.0
    } else {
        value
    }
}
