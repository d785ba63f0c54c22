//! Flux errors and upper limits: Fisher-information (covariance) or
//! likelihood-profile (confidence) estimates.

use std::fmt;
use std::str::FromStr;

use ndarray::Zip;

use super::cash::FitWindow;
use super::solvers::{brentq, XTOL};
use crate::errors::TsMapError;
use crate::{FLUX_FACTOR, MAX_NITER};

/// Width of the profile-likelihood search interval above the best fit (amplitude units).
const CONF_SEARCH_WIDTH: f64 = 1e4;
const CONF_RTOL: f64 = 1e-3;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum ErrorMethod {
    /// Inverse second derivative of the likelihood at the best fit.
    #[default]
    Covar,
    /// Root of the likelihood profile at `sigma^2` above the minimum.
    Conf,
}

impl ErrorMethod {
    pub fn name(self) -> &'static str {
        match self {
            ErrorMethod::Covar => "covar",
            ErrorMethod::Conf => "conf",
        }
    }

    /// One-sided `sigma`-level flux interval width (flux units).
    pub fn flux_delta(
        self,
        window: &FitWindow<'_>,
        amplitude: f64,
        statistic_at_best: f64,
        sigma: u32,
    ) -> f64 {
        match self {
            ErrorMethod::Covar => sigma as f64 * flux_err_covar(window, amplitude),
            ErrorMethod::Conf => {
                FLUX_FACTOR * amplitude_err_conf(window, amplitude, statistic_at_best, sigma)
            }
        }
    }
}

impl FromStr for ErrorMethod {
    type Err = TsMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "covar" => Ok(ErrorMethod::Covar),
            "conf" => Ok(ErrorMethod::Conf),
            other => Err(TsMapError::InvalidErrorMethod(other.to_string())),
        }
    }
}

impl fmt::Display for ErrorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 1-sigma flux error `sqrt(1 / sum(m^2 c / (b + x m)^2))` (flux units).
pub fn flux_err_covar(window: &FitWindow<'_>, amplitude: f64) -> f64 {
    let x = amplitude * FLUX_FACTOR;
    let stat = Zip::from(&window.counts)
        .and(&window.background)
        .and(&window.template)
        .fold(0.0, |acc, &c, &b, &m| {
            let total = b + x * m;
            acc + m * m * c / (total * total)
        });
    (1.0 / stat).sqrt()
}

/// Distance above `amplitude` where the statistic has risen by `sigma^2`
/// (amplitude units). NaN when the crossing is not found within
/// [`CONF_SEARCH_WIDTH`] of the best fit.
///
/// The bracket handed to Brent is first narrowed by doubling a step sized by
/// the covariance error, so the root search starts close to the crossing.
pub fn amplitude_err_conf(
    window: &FitWindow<'_>,
    amplitude: f64,
    statistic_at_best: f64,
    sigma: u32,
) -> f64 {
    if !amplitude.is_finite() || !statistic_at_best.is_finite() {
        return f64::NAN;
    }
    let target = statistic_at_best + (sigma as f64).powi(2);
    let profile = |a: f64| target - window.statistic(a);
    let limit = amplitude + CONF_SEARCH_WIDTH;

    let covar_step = sigma as f64 * flux_err_covar(window, amplitude) / FLUX_FACTOR;
    let mut step = if covar_step.is_finite() && covar_step > 0.0 {
        covar_step.min(CONF_SEARCH_WIDTH)
    } else {
        CONF_SEARCH_WIDTH
    };

    let mut lo = amplitude;
    let mut hi = amplitude + step;
    while profile(hi) > 0.0 && hi < limit {
        lo = hi;
        step *= 2.0;
        hi = (amplitude + step).min(limit);
    }

    match brentq(profile, lo, hi, XTOL, CONF_RTOL, MAX_NITER) {
        Ok((root, _)) => root - amplitude,
        Err(_) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::solvers::root_amplitude_brentq;
    use ndarray::{array, Array2};

    // Exposure of a realistic survey pixel keeps amplitudes near unity.
    const EXPOSURE: f64 = 1e12;

    struct Data {
        counts: Array2<f64>,
        background: Array2<f64>,
        template: Array2<f64>,
    }

    impl Data {
        fn new() -> Self {
            let kernel = array![[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]] / 16.0;
            Data {
                counts: array![[2.0, 3.0, 2.0], [5.0, 9.0, 4.0], [2.0, 3.0, 1.0]],
                background: Array2::from_elem((3, 3), 1.0),
                template: kernel * EXPOSURE,
            }
        }

        fn window(&self) -> FitWindow<'_> {
            FitWindow {
                counts: self.counts.view(),
                background: self.background.view(),
                template: self.template.view(),
            }
        }
    }

    #[test]
    fn test_parse_error_method() {
        assert_eq!("conf".parse::<ErrorMethod>().unwrap(), ErrorMethod::Conf);
        assert_eq!(
            "hessian".parse::<ErrorMethod>(),
            Err(TsMapError::InvalidErrorMethod("hessian".into()))
        );
    }

    #[test]
    fn test_covar_and_conf_agree_roughly() {
        let data = Data::new();
        let window = data.window();
        let amplitude = root_amplitude_brentq(&window, 1e-6).amplitude();
        let c1 = window.statistic(amplitude);

        let covar = ErrorMethod::Covar.flux_delta(&window, amplitude, c1, 1);
        let conf = ErrorMethod::Conf.flux_delta(&window, amplitude, c1, 1);
        assert!(covar > 0.0 && conf > 0.0, "covar {} conf {}", covar, conf);
        // Poisson likelihood is skewed, but both describe the same curvature
        let ratio = conf / covar;
        assert!(ratio > 0.5 && ratio < 2.0, "ratio {}", ratio);
    }

    #[test]
    fn test_covar_scales_with_sigma() {
        let data = Data::new();
        let window = data.window();
        let amplitude = root_amplitude_brentq(&window, 1e-6).amplitude();
        let one = ErrorMethod::Covar.flux_delta(&window, amplitude, 0.0, 1);
        let two = ErrorMethod::Covar.flux_delta(&window, amplitude, 0.0, 2);
        assert!((two - 2.0 * one).abs() < 1e-12 * one.abs().max(1e-30));
    }

    #[test]
    fn test_conf_grows_with_sigma() {
        let data = Data::new();
        let window = data.window();
        let amplitude = root_amplitude_brentq(&window, 1e-6).amplitude();
        let c1 = window.statistic(amplitude);
        let one = amplitude_err_conf(&window, amplitude, c1, 1);
        let two = amplitude_err_conf(&window, amplitude, c1, 2);
        assert!(two > one, "one {} two {}", one, two);
    }

    #[test]
    fn test_conf_out_of_range_is_nan() {
        let mut data = Data::new();
        // Tiny exposure: the statistic barely moves within the search width
        data.template /= EXPOSURE;
        let window = data.window();
        let c1 = window.statistic(0.0);
        assert!(amplitude_err_conf(&window, 0.0, c1, 1).is_nan());
        assert!(amplitude_err_conf(&window, f64::NAN, c1, 1).is_nan());
    }
}
