//! FFT-based 2D convolution.

use std::sync::Arc;

use ndarray::Array2;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Forward and inverse plans for one padded shape.
struct Plan2d {
    rows: usize,
    cols: usize,
    row_forward: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

impl Plan2d {
    fn new(rows: usize, cols: usize) -> Self {
        let mut planner = FftPlanner::new();
        Plan2d {
            rows,
            cols,
            row_forward: planner.plan_fft_forward(cols),
            col_forward: planner.plan_fft_forward(rows),
            row_inverse: planner.plan_fft_inverse(cols),
            col_inverse: planner.plan_fft_inverse(rows),
        }
    }

    /// Zero-pad `data` into the top-left corner of a `rows x cols` buffer.
    fn embed(&self, data: &Array2<f64>) -> Vec<Complex<f64>> {
        let mut buffer = vec![Complex::new(0.0, 0.0); self.rows * self.cols];
        for ((y, x), &v) in data.indexed_iter() {
            buffer[y * self.cols + x] = Complex::new(v, 0.0);
        }
        buffer
    }

    fn forward(&self, buffer: &mut Vec<Complex<f64>>) {
        // Row transforms, then column transforms on the transposed buffer
        self.row_forward.process(buffer);
        let mut transposed = transpose(buffer, self.rows, self.cols);
        self.col_forward.process(&mut transposed);
        *buffer = transpose(&transposed, self.cols, self.rows);
    }

    fn inverse(&self, buffer: &mut Vec<Complex<f64>>) {
        self.row_inverse.process(buffer);
        let mut transposed = transpose(buffer, self.rows, self.cols);
        self.col_inverse.process(&mut transposed);
        *buffer = transpose(&transposed, self.cols, self.rows);

        let norm = 1.0 / (self.rows * self.cols) as f64;
        for v in buffer.iter_mut() {
            *v *= norm;
        }
    }
}

fn transpose(data: &[Complex<f64>], rows: usize, cols: usize) -> Vec<Complex<f64>> {
    let mut out = vec![Complex::new(0.0, 0.0); rows * cols];
    for y in 0..rows {
        for x in 0..cols {
            out[x * rows + y] = data[y * cols + x];
        }
    }
    out
}

/// Convolve `image` with `kernel`, returning an array of the image's shape
/// centred on the kernel's middle pixel. Outside the image is treated as zero.
///
/// Both arrays are zero padded to power-of-two sizes large enough to hold the
/// full linear convolution, so there is no wrap-around.
pub fn convolve_same(image: &Array2<f64>, kernel: &Array2<f64>) -> Array2<f64> {
    let (ny, nx) = image.dim();
    let (ky, kx) = kernel.dim();
    if ny == 0 || nx == 0 || ky == 0 || kx == 0 {
        return Array2::zeros((ny, nx));
    }

    let rows = (ny + ky - 1).next_power_of_two();
    let cols = (nx + kx - 1).next_power_of_two();
    let plan = Plan2d::new(rows, cols);

    let mut spectrum = plan.embed(image);
    let mut kernel_spectrum = plan.embed(kernel);
    plan.forward(&mut spectrum);
    plan.forward(&mut kernel_spectrum);

    for (s, k) in spectrum.iter_mut().zip(&kernel_spectrum) {
        *s *= *k;
    }
    plan.inverse(&mut spectrum);

    let (oy, ox) = ((ky - 1) / 2, (kx - 1) / 2);
    Array2::from_shape_fn((ny, nx), |(y, x)| spectrum[(y + oy) * cols + (x + ox)].re)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn convolve_direct(image: &Array2<f64>, kernel: &Array2<f64>) -> Array2<f64> {
        let (ny, nx) = image.dim();
        let (ky, kx) = kernel.dim();
        let (hy, hx) = (((ky - 1) / 2) as isize, ((kx - 1) / 2) as isize);
        Array2::from_shape_fn((ny, nx), |(y, x)| {
            let mut acc = 0.0;
            for ((j, i), &k) in kernel.indexed_iter() {
                let sy = y as isize + hy - j as isize;
                let sx = x as isize + hx - i as isize;
                if sy >= 0 && sx >= 0 && (sy as usize) < ny && (sx as usize) < nx {
                    acc += k * image[[sy as usize, sx as usize]];
                }
            }
            acc
        })
    }

    #[test]
    fn test_delta_kernel_is_identity() {
        let image = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let kernel = array![[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        let out = convolve_same(&image, &kernel);
        for (a, b) in out.iter().zip(image.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_matches_direct_convolution() {
        let mut rng = StdRng::seed_from_u64(7);
        let image = Array2::from_shape_fn((13, 9), |_| rng.gen_range(-1.0..1.0));
        let kernel = Array2::from_shape_fn((5, 3), |_| rng.gen_range(0.0..1.0));
        let fast = convolve_same(&image, &kernel);
        let slow = convolve_direct(&image, &kernel);
        assert_eq!(fast.dim(), (13, 9));
        for (a, b) in fast.iter().zip(slow.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_shifted_delta_shifts_image() {
        let mut image = Array2::zeros((5, 5));
        image[[2, 2]] = 1.0;
        // Kernel weight one pixel right of centre moves flux one pixel right
        let kernel = array![[0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]];
        let out = convolve_same(&image, &kernel);
        assert_abs_diff_eq!(out[[2, 3]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.sum(), 1.0, epsilon = 1e-12);
    }
}
