//! Amplitude solvers: bracketed root (Brent), Newton root and iteratively
//! reweighted least squares. All work on the derivative of the Cash statistic
//! and never fail loudly: non-convergence is reported as [`AmplitudeFit::Failed`].

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, Zip};

use super::cash::FitWindow;
use crate::errors::TsMapError;
use crate::{FLUX_FACTOR, MAX_NITER};

/// Absolute tolerance of the bracketed root finder (amplitude units).
pub(crate) const XTOL: f64 = 2e-12;

/// Amplitude fitting strategy.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum FitMethod {
    /// Brent root finding of the statistic derivative inside the amplitude bounds.
    #[default]
    RootBrentq,
    /// Newton iteration on the statistic derivative, seeded by the default flux.
    RootNewton,
    /// Iteratively reweighted linear least squares.
    LeastsqIter,
}

impl FitMethod {
    pub fn name(self) -> &'static str {
        match self {
            FitMethod::RootBrentq => "root brentq",
            FitMethod::RootNewton => "root newton",
            FitMethod::LeastsqIter => "leastsq iter",
        }
    }

    /// Whether the solver needs the default flux map as a starting value.
    pub fn needs_seed(self) -> bool {
        matches!(self, FitMethod::RootNewton)
    }

    /// Fit the amplitude of one window. `seed` is only read by Newton.
    pub fn fit(self, window: &FitWindow<'_>, seed: f64, rtol: f64) -> AmplitudeFit {
        match self {
            FitMethod::RootBrentq => root_amplitude_brentq(window, rtol),
            FitMethod::RootNewton => root_amplitude_newton(window, seed, rtol),
            FitMethod::LeastsqIter => leastsq_iter_amplitude(window, rtol),
        }
    }
}

impl FromStr for FitMethod {
    type Err = TsMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root brentq" => Ok(FitMethod::RootBrentq),
            "root newton" => Ok(FitMethod::RootNewton),
            "leastsq iter" => Ok(FitMethod::LeastsqIter),
            other => Err(TsMapError::InvalidMethod(other.to_string())),
        }
    }
}

impl fmt::Display for FitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one amplitude fit.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum AmplitudeFit {
    /// Fitted amplitude, floored at the lowest physical value.
    Fitted { amplitude: f64, niter: usize },
    /// The window holds no counts; nothing to fit.
    NoCounts { amplitude: f64 },
    /// No root found within the iteration budget or bracket.
    Failed,
}

impl AmplitudeFit {
    /// Amplitude, NaN for a failed fit.
    pub fn amplitude(&self) -> f64 {
        match *self {
            AmplitudeFit::Fitted { amplitude, .. } | AmplitudeFit::NoCounts { amplitude } => {
                amplitude
            }
            AmplitudeFit::Failed => f64::NAN,
        }
    }

    pub fn niter(&self) -> usize {
        match *self {
            AmplitudeFit::Fitted { niter, .. } => niter,
            AmplitudeFit::NoCounts { .. } => 0,
            AmplitudeFit::Failed => MAX_NITER,
        }
    }
}

/// Why a bracketed root search gave up.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum RootError {
    /// Function values at the interval ends are not of opposite sign.
    InvalidBracket,
    NotConverged,
}

/// Brent's method on `[xa, xb]`.
///
/// Returns the root and the number of iterations. Requires `f(xa)` and
/// `f(xb)` to be finite and of opposite sign (or zero).
pub(crate) fn brentq(
    mut f: impl FnMut(f64) -> f64,
    xa: f64,
    xb: f64,
    xtol: f64,
    rtol: f64,
    maxiter: usize,
) -> Result<(f64, usize), RootError> {
    let mut xpre = xa;
    let mut xcur = xb;
    let mut fpre = f(xpre);
    let mut fcur = f(xcur);

    if !(fpre.is_finite() && fcur.is_finite()) || fpre * fcur > 0.0 {
        return Err(RootError::InvalidBracket);
    }
    if fpre == 0.0 {
        return Ok((xpre, 0));
    }
    if fcur == 0.0 {
        return Ok((xcur, 0));
    }

    let (mut xblk, mut fblk) = (0.0, 0.0);
    let (mut spre, mut scur) = (0.0_f64, 0.0_f64);

    for iter in 1..=maxiter {
        if fpre != 0.0 && fcur != 0.0 && fpre.is_sign_negative() != fcur.is_sign_negative() {
            xblk = xpre;
            fblk = fpre;
            spre = xcur - xpre;
            scur = spre;
        }
        if fblk.abs() < fcur.abs() {
            xpre = xcur;
            xcur = xblk;
            xblk = xpre;
            fpre = fcur;
            fcur = fblk;
            fblk = fpre;
        }

        let delta = (xtol + rtol * xcur.abs()) / 2.0;
        let sbis = (xblk - xcur) / 2.0;
        if fcur == 0.0 || sbis.abs() < delta {
            return Ok((xcur, iter));
        }

        if spre.abs() > delta && fcur.abs() < fpre.abs() {
            let stry = if xpre == xblk {
                // secant
                -fcur * (xcur - xpre) / (fcur - fpre)
            } else {
                // inverse quadratic
                let dpre = (fpre - fcur) / (xpre - xcur);
                let dblk = (fblk - fcur) / (xblk - xcur);
                -fcur * (fblk * dblk - fpre * dpre) / (dblk * dpre * (fblk - fpre))
            };
            if 2.0 * stry.abs() < spre.abs().min(3.0 * sbis.abs() - delta) {
                spre = scur;
                scur = stry;
            } else {
                spre = sbis;
                scur = sbis;
            }
        } else {
            spre = sbis;
            scur = sbis;
        }

        xpre = xcur;
        fpre = fcur;
        if scur.abs() > delta {
            xcur += scur;
        } else {
            xcur += if sbis > 0.0 { delta } else { -delta };
        }
        fcur = f(xcur);
        if !fcur.is_finite() {
            return Err(RootError::NotConverged);
        }
    }

    Err(RootError::NotConverged)
}

/// Root of the statistic derivative between the amplitude bounds.
pub fn root_amplitude_brentq(window: &FitWindow<'_>, rtol: f64) -> AmplitudeFit {
    let bounds = window.bounds();
    if !(window.total_counts() > 0.0) {
        return AmplitudeFit::NoCounts {
            amplitude: bounds.min_total,
        };
    }

    match brentq(
        |a| window.derivative(a),
        bounds.min,
        bounds.max,
        XTOL,
        rtol,
        MAX_NITER,
    ) {
        Ok((root, niter)) => AmplitudeFit::Fitted {
            amplitude: root.max(bounds.min_total),
            niter,
        },
        Err(_) => AmplitudeFit::Failed,
    }
}

/// Newton iteration on the statistic derivative starting at `seed`.
///
/// Iterates are kept strictly above the lowest physical amplitude by halving
/// the distance to it whenever a step would cross it.
pub fn root_amplitude_newton(window: &FitWindow<'_>, seed: f64, rtol: f64) -> AmplitudeFit {
    let bounds = window.bounds();
    if !(window.total_counts() > 0.0) {
        return AmplitudeFit::NoCounts {
            amplitude: bounds.min_total,
        };
    }
    if !bounds.min_total.is_finite() {
        return AmplitudeFit::Failed;
    }

    let mut x = if seed.is_finite() && seed > bounds.min_total {
        seed
    } else {
        bounds.max
    };

    for iter in 1..=MAX_NITER {
        let f = window.derivative(x);
        let slope = window.derivative_slope(x);
        if !f.is_finite() || !slope.is_finite() || slope <= 0.0 {
            return AmplitudeFit::Failed;
        }

        let mut x_new = x - f / slope;
        if x_new <= bounds.min_total {
            x_new = 0.5 * (x + bounds.min_total);
        }

        if (x_new - x).abs() <= XTOL + rtol * x_new.abs() {
            return AmplitudeFit::Fitted {
                amplitude: x_new.max(bounds.min_total),
                niter: iter,
            };
        }
        x = x_new;
    }

    AmplitudeFit::Failed
}

/// Weighted least-squares flux estimate (flux units, not amplitude).
fn x_best_leastsq(window: &FitWindow<'_>, weights: &Array2<f64>) -> f64 {
    let (sum, norm) = Zip::from(&window.counts)
        .and(&window.background)
        .and(&window.template)
        .and(weights)
        .fold((0.0, 0.0), |(sum, norm), &c, &b, &m, &w| {
            if m > 0.0 && w > 0.0 {
                (sum + (c - b) * m / w, norm + m * m / w)
            } else {
                (sum, norm)
            }
        });
    sum / norm
}

/// Iteratively reweighted least squares. Weights start at one and are then
/// set to the predicted counts of the previous iterate.
pub fn leastsq_iter_amplitude(window: &FitWindow<'_>, rtol: f64) -> AmplitudeFit {
    let bounds = window.bounds();
    if !(window.total_counts() > 0.0) {
        return AmplitudeFit::NoCounts {
            amplitude: bounds.min_total,
        };
    }

    let mut weights = Array2::<f64>::ones(window.template.dim());
    let mut x_old = 0.0;
    let mut x = 0.0;

    for iter in 1..=MAX_NITER {
        x = x_best_leastsq(window, &weights);
        if !x.is_finite() {
            return AmplitudeFit::Failed;
        }
        if ((x - x_old) / x).abs() < rtol {
            return AmplitudeFit::Fitted {
                amplitude: (x / FLUX_FACTOR).max(bounds.min_total),
                niter: iter,
            };
        }
        Zip::from(&mut weights)
            .and(&window.template)
            .and(&window.background)
            .for_each(|w, &m, &b| *w = x * m + b);
        x_old = x;
    }

    AmplitudeFit::Fitted {
        amplitude: (x / FLUX_FACTOR).max(bounds.min_total),
        niter: MAX_NITER,
    }
}
