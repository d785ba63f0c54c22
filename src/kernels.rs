//! Convolution kernels: multi-Gaussian PSF and extended source morphologies.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use ndarray::{s, Array2};

use crate::errors::TsMapError;
use crate::types::Kernel;

/// How a kernel pixel samples the continuous profile.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sampling {
    /// Profile value at the pixel centre.
    Center,
    /// Mean over an `n x n` sub-grid of the pixel.
    Oversample(usize),
}

impl Default for Sampling {
    fn default() -> Self {
        Sampling::Oversample(10)
    }
}

/// Smallest odd integer not below `x` (at least 1).
fn round_up_to_odd(x: f64) -> usize {
    let n = if x.is_finite() && x > 1.0 { x.ceil() as usize } else { 1 };
    n | 1
}

/// Sample `profile(dx, dy)` (offsets from the centre in pixels) on an odd grid.
fn sample_profile(size: (usize, usize), sampling: Sampling, profile: impl Fn(f64, f64) -> f64) -> Array2<f64> {
    let (cy, cx) = ((size.0 / 2) as f64, (size.1 / 2) as f64);
    match sampling {
        Sampling::Center => Array2::from_shape_fn(size, |(y, x)| profile(x as f64 - cx, y as f64 - cy)),
        Sampling::Oversample(n) => {
            let n = n.max(1);
            let offsets: Vec<f64> = (0..n).map(|k| (k as f64 + 0.5) / n as f64 - 0.5).collect();
            let norm = 1.0 / (n * n) as f64;
            Array2::from_shape_fn(size, |(y, x)| {
                let mut acc = 0.0;
                for &oy in &offsets {
                    for &ox in &offsets {
                        acc += profile(x as f64 - cx + ox, y as f64 - cy + oy);
                    }
                }
                acc * norm
            })
        }
    }
}

fn invalid(reason: impl Into<String>) -> anyhow::Error {
    TsMapError::InvalidKernel(reason.into()).into()
}

/// Unit-sum circular Gaussian of width `sigma` pixels, size odd and at least `8 * sigma`.
pub fn gaussian_kernel(sigma: f64, sampling: Sampling) -> Result<Kernel> {
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(invalid(format!("Gaussian sigma must be positive, got {}", sigma)));
    }
    let size = round_up_to_odd(8.0 * sigma);
    let two_var = 2.0 * sigma * sigma;
    let array = sample_profile((size, size), sampling, |dx, dy| (-(dx * dx + dy * dy) / two_var).exp());
    Kernel::new(array)?.normalized()
}

/// Unit-sum projection of a uniformly emitting spherical shell between
/// radii `r_inner` and `r_outer` (pixels) onto a `size x size` grid.
pub fn shell_kernel(r_inner: f64, r_outer: f64, size: usize, sampling: Sampling) -> Result<Kernel> {
    if !(r_inner.is_finite() && r_inner >= 0.0 && r_outer.is_finite() && r_outer > r_inner) {
        return Err(invalid(format!("invalid shell radii {} .. {}", r_inner, r_outer)));
    }
    let (ri2, ro2) = (r_inner * r_inner, r_outer * r_outer);
    let size = size | 1;
    let array = sample_profile((size, size), sampling, |dx, dy| {
        let r2 = dx * dx + dy * dy;
        if r2 < ri2 {
            (ro2 - r2).sqrt() - (ri2 - r2).sqrt()
        } else if r2 < ro2 {
            (ro2 - r2).sqrt()
        } else {
            0.0
        }
    });
    Kernel::new(array)?.normalized()
}

/// Full linear convolution; the output has shape `a + b - 1` per axis.
pub fn convolve_full(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let (ay, ax) = a.dim();
    let (by, bx) = b.dim();
    if ay == 0 || ax == 0 || by == 0 || bx == 0 {
        return Array2::zeros((0, 0));
    }
    let mut out = Array2::zeros((ay + by - 1, ax + bx - 1));
    for ((i, j), &va) in a.indexed_iter() {
        if va == 0.0 {
            continue;
        }
        for ((k, l), &vb) in b.indexed_iter() {
            out[[i + k, j + l]] += va * vb;
        }
    }
    out
}

/// Convolve `a` with `b`, keeping the shape of `a` with `b` centred on each
/// pixel. Values beyond the edge of `a` count as zero.
pub fn convolve_centred(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let full = convolve_full(a, b);
    if full.is_empty() {
        return Array2::zeros(a.dim());
    }
    let (oy, ox) = (b.nrows() / 2, b.ncols() / 2);
    full.slice(s![oy..oy + a.nrows(), ox..ox + a.ncols()]).to_owned()
}

/// One Gaussian of a multi-Gaussian PSF.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GaussComponent {
    /// Width (degrees).
    pub sigma: f64,
    /// Peak surface brightness; the component's integral is `2 pi sigma^2 amplitude`.
    pub amplitude: f64,
}

/// Instrument PSF described as a sum of concentric Gaussians.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiGaussPsf {
    components: Vec<GaussComponent>,
}

impl MultiGaussPsf {
    pub fn new(components: Vec<GaussComponent>) -> Result<Self> {
        if components.is_empty() {
            return Err(invalid("PSF needs at least one Gaussian component"));
        }
        for c in &components {
            if !(c.sigma.is_finite() && c.sigma > 0.0) || !(c.amplitude.is_finite() && c.amplitude >= 0.0) {
                return Err(invalid(format!("invalid PSF component {:?}", c)));
            }
        }
        if components.iter().all(|c| c.amplitude == 0.0) {
            return Err(invalid("all PSF component amplitudes are zero"));
        }
        Ok(MultiGaussPsf { components })
    }

    /// Single-Gaussian PSF of width `sigma` degrees.
    pub fn gaussian(sigma: f64) -> Result<Self> {
        Self::new(vec![GaussComponent { sigma, amplitude: 1.0 }])
    }

    pub fn components(&self) -> &[GaussComponent] {
        &self.components
    }

    /// Unit-sum kernel on a grid of `pixel_scale` degrees per pixel, sized
    /// to `8 sigma` of the widest component.
    pub fn kernel(&self, pixel_scale: f64, sampling: Sampling) -> Result<Kernel> {
        if !(pixel_scale.is_finite() && pixel_scale > 0.0) {
            return Err(invalid(format!("pixel scale must be positive, got {}", pixel_scale)));
        }
        let pixel: Vec<(f64, f64)> = self
            .components
            .iter()
            .map(|c| (c.sigma / pixel_scale, c.amplitude))
            .collect();
        let widest = pixel.iter().map(|&(s, _)| s).fold(0.0, f64::max);
        let size = round_up_to_odd(8.0 * widest);

        let array = sample_profile((size, size), sampling, |dx, dy| {
            let r2 = dx * dx + dy * dy;
            pixel
                .iter()
                .map(|&(s, a)| a * (-r2 / (2.0 * s * s)).exp())
                .sum()
        });
        Kernel::new(array)?.normalized()
    }
}

/// Assumed spatial shape of the source being searched for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Morphology {
    #[default]
    Gaussian2D,
    /// Projected shell with inner radius equal to the scale.
    Shell2D,
}

impl Morphology {
    pub fn name(self) -> &'static str {
        match self {
            Morphology::Gaussian2D => "Gaussian2D",
            Morphology::Shell2D => "Shell2D",
        }
    }

    /// Source kernel for `scale` pixels. For shells, `shell_width` is the
    /// outer radius excess relative to the inner radius and `psf_size` widens
    /// the grid so the PSF tails fit after convolution.
    pub fn source_kernel(
        self,
        scale: f64,
        shell_width: Option<f64>,
        psf_size: usize,
        sampling: Sampling,
    ) -> Result<Kernel> {
        match self {
            Morphology::Gaussian2D => gaussian_kernel(scale, sampling),
            Morphology::Shell2D => {
                let width = shell_width.ok_or(TsMapError::MissingShellWidth)?;
                let r_outer = (1.0 + width) * scale;
                let size = round_up_to_odd(2.0 * r_outer + psf_size as f64 / 2.0);
                shell_kernel(scale, r_outer, size, sampling)
            }
        }
    }
}

impl FromStr for Morphology {
    type Err = TsMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Gaussian2D" => Ok(Morphology::Gaussian2D),
            "Shell2D" => Ok(Morphology::Shell2D),
            other => Err(TsMapError::InvalidParameter {
                name: "morphology",
                reason: format!("unknown morphology '{}'", other),
            }),
        }
    }
}

impl fmt::Display for Morphology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
