use anyhow::Result;
use ndarray::{s, Array2};
use rayon::prelude::*;

use crate::errors::TsMapError;

/// Interpolation used when upsampling.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Interpolation {
    /// Order 0: each block repeats its source value.
    Nearest,
    /// Order 1: bilinear between source pixel centres, clamped at the edges.
    Bilinear,
}

/// Pad offsets applied before downsampling, needed to undo the padding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Padding {
    pub before: (usize, usize),
    pub original: (usize, usize),
}

fn check_factor(factor: usize) -> Result<()> {
    if factor == 0 {
        return Err(TsMapError::InvalidParameter {
            name: "factor",
            reason: "must be at least 1".into(),
        }
        .into());
    }
    Ok(())
}

/// Smallest shape divisible by `factor` that holds `shape`.
pub fn padded_shape(shape: (usize, usize), factor: usize) -> (usize, usize) {
    let factor = factor.max(1);
    let round = |n: usize| n.div_ceil(factor) * factor;
    (round(shape.0), round(shape.1))
}

/// Zero-pad `array` to the next shape divisible by `factor`, splitting the
/// pad evenly with the odd pixel after.
pub fn pad_to_multiple(array: &Array2<f64>, factor: usize) -> Result<(Array2<f64>, Padding)> {
    check_factor(factor)?;
    let original = array.dim();
    let (ny, nx) = padded_shape(original, factor);
    let before = ((ny - original.0) / 2, (nx - original.1) / 2);

    let mut padded = Array2::zeros((ny, nx));
    padded
        .slice_mut(s![
            before.0..before.0 + original.0,
            before.1..before.1 + original.1
        ])
        .assign(array);
    Ok((padded, Padding { before, original }))
}

/// Undo [`pad_to_multiple`].
pub fn crop(array: &Array2<f64>, padding: Padding) -> Result<Array2<f64>> {
    let (by, bx) = padding.before;
    let (ny, nx) = padding.original;
    let (ay, ax) = array.dim();
    if by + ny > ay || bx + nx > ax {
        return Err(TsMapError::ShapeMismatch {
            name: "cropped map",
            expected: (by + ny, bx + nx),
            found: (ay, ax),
        }
        .into());
    }
    Ok(array.slice(s![by..by + ny, bx..bx + nx]).to_owned())
}

/// Block-reduce by `factor`: block sums when `preserve_counts`, else block means.
pub fn downsample(array: &Array2<f64>, factor: usize, preserve_counts: bool) -> Result<Array2<f64>> {
    check_factor(factor)?;
    let (ny, nx) = array.dim();
    if ny % factor != 0 || nx % factor != 0 {
        return Err(TsMapError::InvalidParameter {
            name: "factor",
            reason: format!("shape ({}, {}) is not divisible by {}", ny, nx, factor),
        }
        .into());
    }
    let (out_h, out_w) = (ny / factor, nx / factor);
    let scale = if preserve_counts {
        1.0
    } else {
        1.0 / (factor * factor) as f64
    };

    let mut output = vec![0.0f64; out_h * out_w];
    if out_w > 0 {
        output
            .par_chunks_mut(out_w)
            .enumerate()
            .for_each(|(y, out_row)| {
                for (x, out) in out_row.iter_mut().enumerate() {
                    let block = array.slice(s![
                        y * factor..(y + 1) * factor,
                        x * factor..(x + 1) * factor
                    ]);
                    *out = block.sum() * scale;
                }
            });
    }
    Ok(Array2::from_shape_vec((out_h, out_w), output)?)
}

/// A downsampled pixel is valid only when its whole block is.
pub fn downsample_mask(mask: &Array2<bool>, factor: usize) -> Result<Array2<bool>> {
    check_factor(factor)?;
    let (ny, nx) = mask.dim();
    let (out_h, out_w) = (ny / factor, nx / factor);
    Ok(Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        mask.slice(s![
            y * factor..(y + 1) * factor,
            x * factor..(x + 1) * factor
        ])
        .iter()
        .all(|&v| v)
    }))
}

/// Enlarge by `factor`. With `preserve_counts` each output pixel gets
/// `1 / factor^2` of the interpolated value, keeping the total.
pub fn upsample(
    array: &Array2<f64>,
    factor: usize,
    interpolation: Interpolation,
    preserve_counts: bool,
) -> Result<Array2<f64>> {
    check_factor(factor)?;
    let (ny, nx) = array.dim();
    let (out_h, out_w) = (ny * factor, nx * factor);
    let scale = if preserve_counts {
        1.0 / (factor * factor) as f64
    } else {
        1.0
    };

    let mut output = vec![0.0f64; out_h * out_w];
    if out_w > 0 {
        output
            .par_chunks_mut(out_w)
            .enumerate()
            .for_each(|(y, out_row)| match interpolation {
                Interpolation::Nearest => {
                    for (x, out) in out_row.iter_mut().enumerate() {
                        *out = array[[y / factor, x / factor]] * scale;
                    }
                }
                Interpolation::Bilinear => {
                    let (y0, y1, wy) = source_coordinate(y, factor, ny);
                    for (x, out) in out_row.iter_mut().enumerate() {
                        let (x0, x1, wx) = source_coordinate(x, factor, nx);
                        let top = array[[y0, x0]] * (1.0 - wx) + array[[y0, x1]] * wx;
                        let bottom = array[[y1, x0]] * (1.0 - wx) + array[[y1, x1]] * wx;
                        *out = (top * (1.0 - wy) + bottom * wy) * scale;
                    }
                }
            });
    }
    Ok(Array2::from_shape_vec((out_h, out_w), output)?)
}

/// Neighbouring source pixels and weight of the second one for output pixel
/// `i`, aligning pixel centres. Outside the outermost centres the edge value
/// is held.
fn source_coordinate(i: usize, factor: usize, n: usize) -> (usize, usize, f64) {
    let pos = (i as f64 + 0.5) / factor as f64 - 0.5;
    if pos <= 0.0 {
        return (0, 0, 0.0);
    }
    let last = n - 1;
    if pos >= last as f64 {
        return (last, last, 0.0);
    }
    let i0 = pos.floor() as usize;
    (i0, i0 + 1, pos - i0 as f64)
}
