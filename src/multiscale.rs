//! Multi-scale TS maps: one run per assumed source size, each on a grid
//! coarse enough to keep the kernel small, plus a per-pixel maximum over scales.

use std::borrow::Cow;
use std::collections::BTreeMap;

use anyhow::Result;
use ndarray::{Array2, Zip};
use tracing::{debug, info};

use crate::errors::TsMapError;
use crate::estimator::TsMapEstimator;
use crate::kernels::{convolve_centred, Morphology, MultiGaussPsf, Sampling};
use crate::processing::resample::{self, Interpolation, Padding};
use crate::types::{mask_value, ImageStack, Kernel, Layer, ResultKind, ResultMaps};

/// Downsampling applied before each scale's run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Downsample {
    /// Pick the factor from the ratio of scale to pixel size.
    #[default]
    Auto,
    Factor(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MultiScaleConfig {
    /// Source sizes (degrees); 0 means point-like.
    pub scales: Vec<f64>,
    pub downsample: Downsample,
    /// Add the model layer to the background and search the residual.
    pub residual: bool,
    pub morphology: Morphology,
    /// Shell thickness relative to its inner radius; required for shells.
    pub shell_width: Option<f64>,
    pub sampling: Sampling,
}

impl Default for MultiScaleConfig {
    fn default() -> Self {
        MultiScaleConfig {
            scales: vec![0.0],
            downsample: Downsample::Auto,
            residual: false,
            morphology: Morphology::Gaussian2D,
            shell_width: None,
            sampling: Sampling::default(),
        }
    }
}

/// Result maps of one scale, at the input resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaleResult {
    pub scale: f64,
    pub morphology: Morphology,
    /// Downsampling factor the run used.
    pub factor: usize,
    pub maps: ResultMaps,
}

/// Per-pixel best scale.
#[derive(Clone, Debug, PartialEq)]
pub struct MaximumTsMaps {
    pub ts: Array2<f64>,
    /// Scale of the maximum TS (degrees).
    pub scale: Array2<f64>,
    pub niter: Array2<f64>,
    /// Flux at the maximum TS.
    pub amplitude: Array2<f64>,
    pub morphology: Morphology,
}

/// Coarser grids for larger sources, keeping about five pixels per scale.
pub fn auto_downsample_factor(scale: f64, pixel_scale: f64) -> usize {
    if scale < 5.0 * pixel_scale {
        1
    } else if scale < 10.0 * pixel_scale {
        2
    } else if scale < 40.0 * pixel_scale {
        4
    } else {
        8
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> anyhow::Error {
    TsMapError::InvalidParameter {
        name,
        reason: reason.into(),
    }
    .into()
}

/// Downsample every layer of `stack` by `factor` after zero padding to a
/// divisible shape. Counting layers are summed, rate layers averaged and the
/// mask keeps only fully valid blocks.
fn downsample_stack(stack: &ImageStack, factor: usize) -> Result<(ImageStack, Option<Padding>)> {
    let mut layers = BTreeMap::new();
    let mut padding = None;
    for (layer, data) in stack.layers() {
        let (padded, pad) = resample::pad_to_multiple(data, factor)?;
        padding = Some(pad);
        let reduced = match layer {
            Layer::Mask => {
                let mask = padded.mapv(mask_value);
                resample::downsample_mask(&mask, factor)?.mapv(|v| if v { 1.0 } else { 0.0 })
            }
            other => resample::downsample(&padded, factor, other.preserves_counts())?,
        };
        layers.insert(layer, reduced);
    }
    Ok((ImageStack::from_parts(stack.pixel_scale() * factor as f64, layers), padding))
}

/// Bring maps from a downsampled run back to the input grid.
fn upsample_maps(maps: ResultMaps, factor: usize, padding: Padding) -> Result<ResultMaps> {
    let mut out = ResultMaps::nan_filled(&[], padding.original);
    for (kind, map) in maps.into_iter() {
        let interpolation = match kind {
            ResultKind::Niter => Interpolation::Nearest,
            _ => Interpolation::Bilinear,
        };
        let up = resample::upsample(&map, factor, interpolation, false)?;
        out.insert(kind, resample::crop(&up, padding)?);
    }
    Ok(out)
}

/// PSF kernel at `pixel_scale`, convolved with the source morphology when
/// `scale` is positive. The combined kernel keeps the source kernel's shape.
fn scale_kernel(
    psf: &MultiGaussPsf,
    pixel_scale: f64,
    scale: f64,
    config: &MultiScaleConfig,
) -> Result<Kernel> {
    let psf_kernel = psf.kernel(pixel_scale, config.sampling)?;
    if scale <= 0.0 {
        return Ok(psf_kernel);
    }
    let source = config.morphology.source_kernel(
        scale / pixel_scale,
        config.shell_width,
        psf_kernel.shape().0,
        config.sampling,
    )?;
    Kernel::new(convolve_centred(source.array(), psf_kernel.array()))?.normalized()
}

/// Compute TS maps of `stack` for every scale in `config`, in order.
pub fn compute_ts_image_multiscale(
    stack: &ImageStack,
    psf: &MultiGaussPsf,
    config: &MultiScaleConfig,
    estimator: &TsMapEstimator,
) -> Result<Vec<ScaleResult>> {
    let pixel_scale = stack.pixel_scale();
    if !(pixel_scale.is_finite() && pixel_scale > 0.0) {
        return Err(invalid("pixel_scale", format!("must be finite and positive, got {}", pixel_scale)));
    }
    if config.scales.is_empty() {
        return Err(invalid("scales", "at least one scale is required"));
    }
    if let Some(&bad) = config.scales.iter().find(|s| !(s.is_finite() && **s >= 0.0)) {
        return Err(invalid("scales", format!("scale {} is not a finite non-negative size", bad)));
    }
    if let Downsample::Factor(0) = config.downsample {
        return Err(invalid("downsample", "factor must be at least 1"));
    }
    if config.morphology == Morphology::Shell2D
        && config.shell_width.is_none()
        && config.scales.iter().any(|&s| s > 0.0)
    {
        return Err(TsMapError::MissingShellWidth.into());
    }
    if config.residual {
        stack.require(Layer::Model)?;
    }
    stack.require(Layer::Counts)?;

    let mut results = Vec::with_capacity(config.scales.len());

    for &scale in &config.scales {
        info!(
            "Computing {}TS image for scale {:.3} deg and {} morphology",
            if config.residual { "residual " } else { "" },
            scale,
            config.morphology
        );

        let mut factor = match config.downsample {
            Downsample::Auto => auto_downsample_factor(scale, pixel_scale),
            Downsample::Factor(n) => n,
        };
        if factor > 1 && config.morphology == Morphology::Shell2D {
            factor = (factor / 2).max(1);
        }

        let (mut working, padding) = if factor > 1 {
            debug!("Using down sampling factor of {}", factor);
            let (reduced, padding) = downsample_stack(stack, factor)?;
            (Cow::Owned(reduced), padding)
        } else {
            debug!("No down sampling used");
            (Cow::Borrowed(stack), None)
        };

        let kernel = scale_kernel(psf, working.pixel_scale(), scale, config)?;
        debug!("Kernel shape {:?}", kernel.shape());

        if config.residual {
            let working = working.to_mut();
            let model = working.require(Layer::Model)?.clone();
            if let Some(background) = working.get_mut(Layer::Background) {
                *background += &model;
            }
        }

        let maps = estimator.run_all(&working, &kernel)?;
        let maps = match padding {
            Some(padding) => upsample_maps(maps, factor, padding)?,
            None => maps,
        };

        results.push(ScaleResult {
            scale,
            morphology: config.morphology,
            factor,
            maps,
        });
    }
    Ok(results)
}

fn required_map<'a>(result: &'a ScaleResult, kind: ResultKind) -> Result<&'a Array2<f64>> {
    result
        .maps
        .get(kind)
        .ok_or_else(|| invalid("ts_results", format!("scale {} has no '{}' map", result.scale, kind)))
}

/// Per-pixel maximum TS over scales, with the scale, iteration count and
/// flux of the winning scale. NaN TS values are ignored, the first scale wins
/// ties, and pixels without any finite TS are NaN in every output.
pub fn compute_maximum_ts_image(results: &[ScaleResult]) -> Result<MaximumTsMaps> {
    let first = results
        .first()
        .ok_or_else(|| invalid("ts_results", "no scale results given"))?;
    let shape = required_map(first, ResultKind::Ts)?.dim();

    let mut columns = Vec::with_capacity(results.len());
    for result in results {
        let ts = required_map(result, ResultKind::Ts)?;
        let niter = required_map(result, ResultKind::Niter)?;
        let flux = required_map(result, ResultKind::Flux)?;
        for map in [ts, niter, flux] {
            if map.dim() != shape {
                return Err(TsMapError::ShapeMismatch {
                    name: "ts_results",
                    expected: shape,
                    found: map.dim(),
                }
                .into());
            }
        }
        columns.push((result.scale, ts, niter, flux));
    }

    let mut out = MaximumTsMaps {
        ts: Array2::from_elem(shape, f64::NAN),
        scale: Array2::from_elem(shape, f64::NAN),
        niter: Array2::from_elem(shape, f64::NAN),
        amplitude: Array2::from_elem(shape, f64::NAN),
        morphology: first.morphology,
    };

    Zip::indexed(&mut out.ts)
        .and(&mut out.scale)
        .and(&mut out.niter)
        .and(&mut out.amplitude)
        .for_each(|p, ts, scale, niter, amplitude| {
            let mut best: Option<usize> = None;
            for (i, column) in columns.iter().enumerate() {
                let value = column.1[p];
                if value.is_nan() {
                    continue;
                }
                match best {
                    Some(b) if columns[b].1[p] >= value => {}
                    _ => best = Some(i),
                }
            }
            if let Some(b) = best {
                let (s, t, n, f) = columns[b];
                *ts = t[p];
                *scale = s;
                *niter = n[p];
                *amplitude = f[p];
            }
        });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn result(scale: f64, ts: Array2<f64>) -> ScaleResult {
        let shape = ts.dim();
        let mut maps = ResultMaps::nan_filled(&[], shape);
        maps.insert(ResultKind::Niter, Array2::from_elem(shape, scale * 10.0));
        maps.insert(ResultKind::Flux, ts.mapv(|t| t * 1e-12));
        maps.insert(ResultKind::Ts, ts);
        ScaleResult {
            scale,
            morphology: Morphology::Gaussian2D,
            factor: 1,
            maps,
        }
    }

    #[test]
    fn test_auto_factor_table() {
        let b = 0.02;
        assert_eq!(auto_downsample_factor(0.0, b), 1);
        assert_eq!(auto_downsample_factor(0.099, b), 1);
        assert_eq!(auto_downsample_factor(0.15, b), 2);
        assert_eq!(auto_downsample_factor(0.3, b), 4);
        assert_eq!(auto_downsample_factor(0.7, b), 4);
        assert_eq!(auto_downsample_factor(1.0, b), 8);
    }

    #[test]
    fn test_maximum_of_dominating_scale() {
        let low = result(0.1, array![[1.0, 2.0], [3.0, 4.0]]);
        let high = result(0.2, array![[5.0, 6.0], [7.0, 8.0]]);
        let max = compute_maximum_ts_image(&[low, high.clone()]).unwrap();
        assert_eq!(&max.ts, high.maps.get(ResultKind::Ts).unwrap());
        assert_eq!(&max.niter, high.maps.get(ResultKind::Niter).unwrap());
        assert_eq!(&max.amplitude, high.maps.get(ResultKind::Flux).unwrap());
        assert!(max.scale.iter().all(|&s| s == 0.2));
        assert_eq!(max.morphology, Morphology::Gaussian2D);
    }

    #[test]
    fn test_maximum_ignores_nan_and_prefers_first_on_ties() {
        let a = result(0.0, array![[f64::NAN, 2.0, f64::NAN]]);
        let b = result(0.5, array![[1.0, 2.0, f64::NAN]]);
        let max = compute_maximum_ts_image(&[a, b]).unwrap();
        assert_eq!(max.ts[[0, 0]], 1.0);
        assert_eq!(max.scale[[0, 0]], 0.5);
        assert_eq!(max.scale[[0, 1]], 0.0);
        assert!(max.ts[[0, 2]].is_nan());
        assert!(max.scale[[0, 2]].is_nan() && max.niter[[0, 2]].is_nan());
    }

    #[test]
    fn test_maximum_needs_results() {
        assert!(compute_maximum_ts_image(&[]).is_err());
        let mut missing = result(0.0, array![[1.0]]);
        missing.maps = ResultMaps::nan_filled(&[ResultKind::Ts], (1, 1));
        assert!(compute_maximum_ts_image(&[missing]).is_err());
    }

    #[test]
    fn test_maximum_rejects_shape_mismatch() {
        let a = result(0.0, array![[1.0, 2.0]]);
        let b = result(0.1, array![[1.0], [2.0]]);
        let err = compute_maximum_ts_image(&[a, b]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TsMapError>(),
            Some(TsMapError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_downsample_stack_layers() {
        let stack = ImageStack::new(0.02)
            .with_layer(Layer::Counts, Array2::from_elem((5, 6), 1.0))
            .unwrap()
            .with_layer(Layer::Exposure, Array2::from_elem((5, 6), 3.0))
            .unwrap()
            .with_layer(Layer::Mask, Array2::from_elem((5, 6), 1.0))
            .unwrap();
        let (reduced, padding) = downsample_stack(&stack, 2).unwrap();
        assert_eq!(reduced.shape(), Some((3, 3)));
        assert!((reduced.pixel_scale() - 0.04).abs() < 1e-15);
        let counts = reduced.get(Layer::Counts).unwrap();
        assert_eq!(counts.sum(), 30.0);
        // Zero padding row ends up in the last block row
        assert_eq!(reduced.get(Layer::Exposure).unwrap()[[0, 0]], 3.0);
        assert_eq!(reduced.get(Layer::Mask).unwrap()[[2, 0]], 0.0);
        assert_eq!(reduced.get(Layer::Mask).unwrap()[[1, 0]], 1.0);
        assert_eq!(padding.unwrap().original, (5, 6));
    }

    #[test]
    fn test_combined_kernel_keeps_source_shape() {
        let psf = MultiGaussPsf::gaussian(0.03).unwrap();
        let config = MultiScaleConfig {
            sampling: Sampling::Center,
            ..Default::default()
        };
        // 2.5 pixel Gaussian source -> 21 x 21, PSF of 0.75 pixels -> 7 x 7
        let source = config.morphology.source_kernel(2.5, None, 7, config.sampling).unwrap();
        let kernel = scale_kernel(&psf, 0.04, 0.1, &config).unwrap();
        assert_eq!(kernel.shape(), source.shape());
        assert_eq!(kernel.shape(), (21, 21));
        assert!((kernel.array().sum() - 1.0).abs() < 1e-12);

        let shell = MultiScaleConfig {
            morphology: Morphology::Shell2D,
            shell_width: Some(0.5),
            ..config
        };
        let psf_size = psf.kernel(0.02, Sampling::Center).unwrap().shape().0;
        let source = Morphology::Shell2D
            .source_kernel(2.0, Some(0.5), psf_size, Sampling::Center)
            .unwrap();
        let kernel = scale_kernel(&psf, 0.02, 0.04, &shell).unwrap();
        assert_eq!(kernel.shape(), source.shape());
    }

    #[test]
    fn test_point_scale_uses_psf_kernel() {
        let psf = MultiGaussPsf::gaussian(0.03).unwrap();
        let config = MultiScaleConfig::default();
        let kernel = scale_kernel(&psf, 0.02, 0.0, &config).unwrap();
        assert_eq!(kernel, psf.kernel(0.02, config.sampling).unwrap());
    }

    #[test]
    fn test_rejects_non_positive_pixel_scale() {
        let psf = MultiGaussPsf::gaussian(0.02).unwrap();
        let estimator = TsMapEstimator::new();
        for pixel_scale in [0.0, -0.02, f64::NAN] {
            let stack = ImageStack::new(pixel_scale)
                .with_layer(Layer::Counts, Array2::zeros((8, 8)))
                .unwrap();
            let err = compute_ts_image_multiscale(&stack, &psf, &MultiScaleConfig::default(), &estimator)
                .unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<TsMapError>(),
                    Some(TsMapError::InvalidParameter { name: "pixel_scale", .. })
                ),
                "pixel scale {} gave {}",
                pixel_scale,
                err
            );
        }
    }

    #[test]
    fn test_invalid_configuration_fails_fast() {
        let stack = ImageStack::new(0.02)
            .with_layer(Layer::Counts, Array2::zeros((8, 8)))
            .unwrap();
        let psf = MultiGaussPsf::gaussian(0.02).unwrap();
        let estimator = TsMapEstimator::new();

        let shell = MultiScaleConfig {
            scales: vec![0.1],
            morphology: Morphology::Shell2D,
            ..Default::default()
        };
        let err = compute_ts_image_multiscale(&stack, &psf, &shell, &estimator).unwrap_err();
        assert_eq!(err.downcast_ref::<TsMapError>(), Some(&TsMapError::MissingShellWidth));

        let residual = MultiScaleConfig {
            residual: true,
            ..Default::default()
        };
        let err = compute_ts_image_multiscale(&stack, &psf, &residual, &estimator).unwrap_err();
        assert_eq!(err.downcast_ref::<TsMapError>(), Some(&TsMapError::MissingLayer("model")));

        let no_scales = MultiScaleConfig {
            scales: vec![],
            ..Default::default()
        };
        assert!(compute_ts_image_multiscale(&stack, &psf, &no_scales, &estimator).is_err());
    }
}
