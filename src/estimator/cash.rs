//! Cash statistic, its amplitude derivative and the amplitude search bounds.
//! All in f64; amplitudes are in units of [`FLUX_FACTOR`].

use ndarray::{Array2, ArrayView2, Zip};

use crate::FLUX_FACTOR;

/// Per-pixel Cash statistic `2 * (model - counts * ln(model))`, zero where
/// the model is not positive.
pub fn cash(counts: ArrayView2<f64>, model: ArrayView2<f64>) -> Array2<f64> {
    Zip::from(&counts).and(&model).map_collect(|&c, &m| {
        if m > 0.0 {
            2.0 * (m - c * m.ln())
        } else {
            0.0
        }
    })
}

/// Summed Cash statistic over matching arrays.
pub fn cash_sum(counts: ArrayView2<f64>, model: ArrayView2<f64>) -> f64 {
    2.0 * Zip::from(&counts).and(&model).fold(0.0, |acc, &c, &m| {
        if m > 0.0 {
            acc + m - c * m.ln()
        } else {
            acc
        }
    })
}

/// Cash statistic of `background + amplitude * FLUX_FACTOR * template`.
pub fn f_cash(
    amplitude: f64,
    counts: ArrayView2<f64>,
    background: ArrayView2<f64>,
    template: ArrayView2<f64>,
) -> f64 {
    let x = amplitude * FLUX_FACTOR;
    2.0 * Zip::from(&counts)
        .and(&background)
        .and(&template)
        .fold(0.0, |acc, &c, &b, &m| {
            let total = b + x * m;
            if total > 0.0 {
                acc + total - c * total.ln()
            } else {
                acc
            }
        })
}

/// Derivative of the Cash statistic with respect to the amplitude, up to a
/// positive factor. Monotonically increasing; its root is the best fit.
pub fn f_cash_root(
    amplitude: f64,
    counts: ArrayView2<f64>,
    background: ArrayView2<f64>,
    template: ArrayView2<f64>,
) -> f64 {
    let x = amplitude * FLUX_FACTOR;
    Zip::from(&counts)
        .and(&background)
        .and(&template)
        .fold(0.0, |acc, &c, &b, &m| {
            if m <= 0.0 {
                acc
            } else if c > 0.0 {
                acc + m * (1.0 - c / (x * m + b))
            } else {
                acc + m
            }
        })
}

/// Slope of [`f_cash_root`] with respect to the amplitude.
pub fn f_cash_root_slope(
    amplitude: f64,
    counts: ArrayView2<f64>,
    background: ArrayView2<f64>,
    template: ArrayView2<f64>,
) -> f64 {
    let x = amplitude * FLUX_FACTOR;
    FLUX_FACTOR
        * Zip::from(&counts)
            .and(&background)
            .and(&template)
            .fold(0.0, |acc, &c, &b, &m| {
                if m > 0.0 && c > 0.0 {
                    let total = x * m + b;
                    acc + c * m * m / (total * total)
                } else {
                    acc
                }
            })
}

/// Search interval for the amplitude fit of one window.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AmplitudeBounds {
    /// Lower end of the bracket around the derivative root.
    pub min: f64,
    /// Upper end of the bracket around the derivative root.
    pub max: f64,
    /// Lowest amplitude keeping `background + amplitude * template >= 0` everywhere.
    pub min_total: f64,
}

/// Amplitude bounds following Stewart (2009), appendix A.
///
/// With `sn = background / template`, the root lies between
/// `c_min / sum(template) - sn_min` and `sum(counts) / sum(template) - sn_min`,
/// where `sn_min` is taken over pixels with counts and `c_min` are the counts
/// at that pixel.
pub fn amplitude_bounds(
    counts: ArrayView2<f64>,
    background: ArrayView2<f64>,
    template: ArrayView2<f64>,
) -> AmplitudeBounds {
    let mut s_model = 0.0;
    let mut s_counts = 0.0;
    let mut sn_min = f64::INFINITY;
    let mut c_min = 1.0;
    let mut sn_min_total = f64::INFINITY;

    Zip::from(&counts)
        .and(&background)
        .and(&template)
        .for_each(|&c, &b, &m| {
            s_model += m;
            if m <= 0.0 {
                return;
            }
            let sn = b / m;
            if c > 0.0 {
                s_counts += c;
                if sn < sn_min {
                    sn_min = sn;
                    c_min = c;
                }
            }
            if sn < sn_min_total {
                sn_min_total = sn;
            }
        });

    if s_model <= 0.0 || !sn_min_total.is_finite() {
        return AmplitudeBounds {
            min: f64::NAN,
            max: f64::NAN,
            min_total: f64::NAN,
        };
    }

    // No counts: the bracket is meaningless, callers short-circuit on min_total.
    let sn_min = if sn_min.is_finite() { sn_min } else { sn_min_total };

    AmplitudeBounds {
        min: (c_min / s_model - sn_min) / FLUX_FACTOR,
        max: (s_counts / s_model - sn_min) / FLUX_FACTOR,
        min_total: -sn_min_total / FLUX_FACTOR,
    }
}

/// Data of one kernel-sized window around the pixel being fitted.
#[derive(Copy, Clone, Debug)]
pub struct FitWindow<'a> {
    pub counts: ArrayView2<'a, f64>,
    pub background: ArrayView2<'a, f64>,
    /// Exposure times kernel.
    pub template: ArrayView2<'a, f64>,
}

impl<'a> FitWindow<'a> {
    pub fn statistic(&self, amplitude: f64) -> f64 {
        f_cash(amplitude, self.counts, self.background, self.template)
    }

    pub fn derivative(&self, amplitude: f64) -> f64 {
        f_cash_root(amplitude, self.counts, self.background, self.template)
    }

    pub fn derivative_slope(&self, amplitude: f64) -> f64 {
        f_cash_root_slope(amplitude, self.counts, self.background, self.template)
    }

    pub fn bounds(&self) -> AmplitudeBounds {
        amplitude_bounds(self.counts, self.background, self.template)
    }

    pub fn total_counts(&self) -> f64 {
        self.counts.sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn window() -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let counts = array![[2.0, 3.0, 2.0], [5.0, 9.0, 4.0], [2.0, 3.0, 1.0]];
        let background = Array2::from_elem((3, 3), 1.0);
        let template = Array2::from_elem((3, 3), 100.0 / 9.0);
        (counts, background, template)
    }

    #[test]
    fn test_cash_zero_model_ignored() {
        let counts = array![[1.0, 2.0]];
        let model = array![[0.0, 2.0]];
        let c = cash(counts.view(), model.view());
        assert_eq!(c[[0, 0]], 0.0);
        assert!((c[[0, 1]] - 2.0 * (2.0 - 2.0 * 2f64.ln())).abs() < 1e-12);
        assert!((cash_sum(counts.view(), model.view()) - c.sum()).abs() < 1e-12);
    }

    #[test]
    fn test_f_cash_at_zero_is_null_statistic() {
        let (counts, background, template) = window();
        let c0 = cash_sum(counts.view(), background.view());
        let c = f_cash(0.0, counts.view(), background.view(), template.view());
        assert!((c - c0).abs() < 1e-12);
    }

    #[test]
    fn test_root_is_stationary_point() {
        let (counts, background, template) = window();
        // Flat template: the root is at sum(c) = sum(b + x m)
        let x_true = (counts.sum() - background.sum()) / template.sum();
        let amplitude = x_true / FLUX_FACTOR;
        let r = f_cash_root(amplitude, counts.view(), background.view(), template.view());
        assert!(r.abs() < 1e-9, "root residual {}", r);
        let slope = f_cash_root_slope(amplitude, counts.view(), background.view(), template.view());
        assert!(slope > 0.0);
    }

    #[test]
    fn test_bounds_bracket_root() {
        let (counts, background, _) = window();
        let template = array![[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]] * (100.0 / 16.0);
        let bounds = amplitude_bounds(counts.view(), background.view(), template.view());
        let lo = f_cash_root(bounds.min, counts.view(), background.view(), template.view());
        let hi = f_cash_root(bounds.max, counts.view(), background.view(), template.view());
        assert!(lo < 0.0 && hi > 0.0, "lo {} hi {}", lo, hi);
        assert!(bounds.min_total < bounds.min);
        // The brightest template pixel reaches zero total model at min_total
        let total = 1.0 + bounds.min_total * FLUX_FACTOR * template[[1, 1]];
        assert!(total.abs() < 1e-9);
    }

    #[test]
    fn test_bounds_without_counts() {
        let counts = Array2::<f64>::zeros((3, 3));
        let background = Array2::from_elem((3, 3), 2.0);
        let template = Array2::from_elem((3, 3), 4.0);
        let bounds = amplitude_bounds(counts.view(), background.view(), template.view());
        assert!((bounds.min_total * FLUX_FACTOR + 0.5).abs() < 1e-12);
        assert!(bounds.min.is_finite() && bounds.max.is_finite());
    }
}
