//! Fit mask and matched-filter flux seed.

use ndarray::{Array2, Zip};

use crate::processing::fft::convolve_same;
use crate::types::Kernel;

/// Pixels where a fit is possible: the kernel window fits inside the image,
/// exposure is positive and background is non-zero.
pub fn mask_default(exposure: &Array2<f64>, background: &Array2<f64>, kernel: &Kernel) -> Array2<bool> {
    let (ny, nx) = exposure.dim();
    let (hy, hx) = kernel.half_size();
    let inside = |p: usize, h: usize, n: usize| p >= h && p + h < n;

    let mut mask = Array2::from_elem((ny, nx), false);
    Zip::indexed(&mut mask)
        .and(exposure)
        .and(background)
        .for_each(|(y, x), m, &e, &b| {
            *m = inside(y, hy, ny) && inside(x, hx, nx) && e > 0.0 && b != 0.0;
        });
    mask
}

/// Matched-filter flux estimate `((c - b) / e) * k / sum(k^2)`.
///
/// Only used to seed the Newton solver and to evaluate the threshold; never
/// reported as a result.
pub fn flux_default(
    counts: &Array2<f64>,
    background: &Array2<f64>,
    exposure: &Array2<f64>,
    kernel: &Kernel,
) -> Array2<f64> {
    let excess_flux = Zip::from(counts)
        .and(background)
        .and(exposure)
        .map_collect(|&c, &b, &e| {
            let f = (c - b) / e;
            if f.is_finite() {
                f
            } else {
                0.0
            }
        });
    let norm = kernel.sum_sq();
    convolve_same(&excess_flux, kernel.array()).mapv_into(|v| v / norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn box_kernel(size: usize) -> Kernel {
        Kernel::new(Array2::from_elem((size, size), 1.0)).unwrap().normalized().unwrap()
    }

    #[test]
    fn test_mask_excludes_edges() {
        let exposure = Array2::from_elem((6, 7), 1.0);
        let background = Array2::from_elem((6, 7), 1.0);
        let mask = mask_default(&exposure, &background, &box_kernel(3));
        assert_eq!(mask.iter().filter(|&&m| m).count(), 4 * 5);
        assert!(!mask[[0, 3]] && !mask[[5, 3]] && !mask[[3, 0]] && !mask[[3, 6]]);
        assert!(mask[[1, 1]] && mask[[4, 5]]);
    }

    #[test]
    fn test_mask_excludes_degenerate_pixels() {
        let mut exposure = Array2::from_elem((5, 5), 1.0);
        let mut background = Array2::from_elem((5, 5), 1.0);
        exposure[[2, 2]] = 0.0;
        exposure[[1, 1]] = -3.0;
        background[[3, 2]] = 0.0;
        let mask = mask_default(&exposure, &background, &box_kernel(3));
        assert!(!mask[[2, 2]] && !mask[[1, 1]] && !mask[[3, 2]]);
        assert!(mask[[1, 2]]);
    }

    #[test]
    fn test_kernel_larger_than_image_masks_everything() {
        let exposure = Array2::from_elem((4, 4), 1.0);
        let background = Array2::from_elem((4, 4), 1.0);
        let mask = mask_default(&exposure, &background, &box_kernel(5));
        assert!(mask.iter().all(|&m| !m));
    }

    #[test]
    fn test_flux_default_recovers_flat_excess() {
        let counts = Array2::from_elem((9, 9), 3.0);
        let background = Array2::from_elem((9, 9), 1.0);
        let exposure = Array2::from_elem((9, 9), 2.0);
        let kernel = box_kernel(3);
        let flux = flux_default(&counts, &background, &exposure, &kernel);
        // Interior: sum(k) / sum(k^2) = 9 for a normalized 3x3 box
        assert_abs_diff_eq!(flux[[4, 4]], 1.0 * 9.0, epsilon = 1e-9);
    }

    #[test]
    fn test_flux_default_ignores_zero_exposure() {
        let counts = Array2::from_elem((5, 5), 2.0);
        let background = Array2::from_elem((5, 5), 1.0);
        let exposure = Array2::zeros((5, 5));
        let flux = flux_default(&counts, &background, &exposure, &box_kernel(3));
        assert!(flux.iter().all(|v| v.abs() < 1e-12));
    }
}
