use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use ndarray::{s, Array2};

use crate::errors::TsMapError;

/// Role of an image inside an [`ImageStack`].
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Layer {
    Counts,
    Background,
    Exposure,
    /// Caller-supplied processing mask; non-zero values mark pixels to fit.
    Mask,
    /// Model counts added to the background when computing residual TS maps.
    Model,
}

impl Layer {
    pub fn name(self) -> &'static str {
        match self {
            Layer::Counts => "counts",
            Layer::Background => "background",
            Layer::Exposure => "exposure",
            Layer::Mask => "mask",
            Layer::Model => "model",
        }
    }

    /// Counting layers are summed when downsampled, rate layers are averaged.
    pub fn preserves_counts(self) -> bool {
        matches!(self, Layer::Counts | Layer::Background | Layer::Model)
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Named 2-D images sharing one pixel grid.
#[derive(Debug, Clone)]
pub struct ImageStack {
    /// Angular size of one pixel (degrees).
    pixel_scale: f64,
    layers: BTreeMap<Layer, Array2<f64>>,
}

impl ImageStack {
    pub fn new(pixel_scale: f64) -> Self {
        ImageStack {
            pixel_scale,
            layers: BTreeMap::new(),
        }
    }

    /// Builder form of [`ImageStack::insert`].
    pub fn with_layer(mut self, layer: Layer, data: Array2<f64>) -> Result<Self> {
        self.insert(layer, data)?;
        Ok(self)
    }

    /// Add or replace a layer. Every layer must match the shape of the others.
    pub fn insert(&mut self, layer: Layer, data: Array2<f64>) -> Result<()> {
        if let Some(expected) = self.shape_excluding(layer) {
            let found = data.dim();
            if found != expected {
                return Err(TsMapError::ShapeMismatch {
                    name: layer.name(),
                    expected,
                    found,
                }
                .into());
            }
        }
        self.layers.insert(layer, data);
        Ok(())
    }

    pub fn get(&self, layer: Layer) -> Option<&Array2<f64>> {
        self.layers.get(&layer)
    }

    pub fn get_mut(&mut self, layer: Layer) -> Option<&mut Array2<f64>> {
        self.layers.get_mut(&layer)
    }

    /// Like [`ImageStack::get`], but a missing layer is a configuration error.
    pub fn require(&self, layer: Layer) -> Result<&Array2<f64>> {
        self.layers
            .get(&layer)
            .ok_or_else(|| TsMapError::MissingLayer(layer.name()).into())
    }

    pub fn contains(&self, layer: Layer) -> bool {
        self.layers.contains_key(&layer)
    }

    pub fn pixel_scale(&self) -> f64 {
        self.pixel_scale
    }

    /// Shape `(rows, cols)` shared by all layers, `None` for an empty stack.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.layers.values().next().map(|a| a.dim())
    }

    pub fn layers(&self) -> impl Iterator<Item = (Layer, &Array2<f64>)> {
        self.layers.iter().map(|(&k, v)| (k, v))
    }

    /// Boolean view of the [`Layer::Mask`] layer, if present.
    pub fn mask(&self) -> Option<Array2<bool>> {
        self.layers.get(&Layer::Mask).map(|m| m.mapv(mask_value))
    }

    pub(crate) fn from_parts(pixel_scale: f64, layers: BTreeMap<Layer, Array2<f64>>) -> Self {
        ImageStack {
            pixel_scale,
            layers,
        }
    }

    fn shape_excluding(&self, layer: Layer) -> Option<(usize, usize)> {
        self.layers
            .iter()
            .find(|(&k, _)| k != layer)
            .map(|(_, a)| a.dim())
    }
}

/// Non-zero mask values select a pixel; NaN does not.
pub(crate) fn mask_value(v: f64) -> bool {
    v != 0.0 && !v.is_nan()
}

/// Convolution template of the assumed source shape.
///
/// Dimensions are always odd: even inputs get a trailing row/column of zeros
/// so that the kernel centre falls on a pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    array: Array2<f64>,
}

impl Kernel {
    pub fn new(array: Array2<f64>) -> Result<Self> {
        let (ny, nx) = array.dim();
        if ny == 0 || nx == 0 {
            return Err(TsMapError::InvalidKernel("kernel is empty".into()).into());
        }
        if array.iter().any(|v| !v.is_finite()) {
            return Err(TsMapError::InvalidKernel("kernel contains non-finite values".into()).into());
        }

        let array = if ny % 2 == 0 || nx % 2 == 0 {
            let mut padded = Array2::<f64>::zeros((ny | 1, nx | 1));
            padded.slice_mut(s![..ny, ..nx]).assign(&array);
            padded
        } else {
            array
        };

        Ok(Kernel { array })
    }

    /// Scale the kernel to unit sum.
    pub fn normalized(mut self) -> Result<Self> {
        let sum = self.array.sum();
        if sum == 0.0 || !sum.is_finite() {
            return Err(TsMapError::InvalidKernel(format!("cannot normalize kernel with sum {sum}")).into());
        }
        self.array /= sum;
        Ok(self)
    }

    pub fn array(&self) -> &Array2<f64> {
        &self.array
    }

    pub fn shape(&self) -> (usize, usize) {
        self.array.dim()
    }

    /// Half extent `(rows / 2, cols / 2)`.
    pub fn half_size(&self) -> (usize, usize) {
        let (ny, nx) = self.array.dim();
        (ny / 2, nx / 2)
    }

    pub fn sum_sq(&self) -> f64 {
        self.array.iter().map(|v| v * v).sum()
    }
}

/// Output quantities of a TS map run.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ResultKind {
    Ts,
    SqrtTs,
    Flux,
    FluxErr,
    FluxUl,
    Niter,
}

impl ResultKind {
    pub const ALL: [ResultKind; 6] = [
        ResultKind::Ts,
        ResultKind::SqrtTs,
        ResultKind::Flux,
        ResultKind::FluxErr,
        ResultKind::FluxUl,
        ResultKind::Niter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResultKind::Ts => "ts",
            ResultKind::SqrtTs => "sqrt_ts",
            ResultKind::Flux => "flux",
            ResultKind::FluxErr => "flux_err",
            ResultKind::FluxUl => "flux_ul",
            ResultKind::Niter => "niter",
        }
    }
}

impl FromStr for ResultKind {
    type Err = TsMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResultKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| TsMapError::InvalidOutput(s.to_string()))
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result images keyed by [`ResultKind`], NaN wherever no fit was made.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMaps {
    maps: BTreeMap<ResultKind, Array2<f64>>,
}

impl ResultMaps {
    /// NaN-filled maps of the given shape for each requested kind.
    pub fn nan_filled(kinds: &[ResultKind], shape: (usize, usize)) -> Self {
        let maps = kinds
            .iter()
            .map(|&k| (k, Array2::from_elem(shape, f64::NAN)))
            .collect();
        ResultMaps { maps }
    }

    pub fn get(&self, kind: ResultKind) -> Option<&Array2<f64>> {
        self.maps.get(&kind)
    }

    pub fn get_mut(&mut self, kind: ResultKind) -> Option<&mut Array2<f64>> {
        self.maps.get_mut(&kind)
    }

    pub fn insert(&mut self, kind: ResultKind, data: Array2<f64>) {
        self.maps.insert(kind, data);
    }

    pub fn contains(&self, kind: ResultKind) -> bool {
        self.maps.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ResultKind> + '_ {
        self.maps.keys().copied()
    }
}

impl IntoIterator for ResultMaps {
    type Item = (ResultKind, Array2<f64>);
    type IntoIter = std::collections::btree_map::IntoIter<ResultKind, Array2<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.maps.into_iter()
    }
}

/// How a single pixel fit ended.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FitStatus {
    /// The solver converged.
    Fitted,
    /// The window holds no counts; the amplitude is the lowest allowed value.
    NoCounts,
    /// The seed improvement was below the threshold; no fit was attempted.
    BelowThreshold,
    /// The solver did not converge; all derived values are NaN.
    Failed,
}

/// Fit outcome for one pixel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PixelResult {
    /// Signed test statistic: negative for a flux deficit.
    pub ts: f64,
    /// Fitted amplitude times [`crate::FLUX_FACTOR`].
    pub flux: f64,
    pub niter: usize,
    /// Only set when an error estimate was requested.
    pub flux_err: Option<f64>,
    /// Only set when an upper limit was requested.
    pub flux_ul: Option<f64>,
    pub status: FitStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_stack_rejects_mismatched_shapes() {
        let stack = ImageStack::new(0.02)
            .with_layer(Layer::Counts, Array2::zeros((4, 5)))
            .unwrap();
        let err = stack
            .with_layer(Layer::Exposure, Array2::zeros((5, 4)))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TsMapError>(),
            Some(TsMapError::ShapeMismatch { name: "exposure", .. })
        ));
    }

    #[test]
    fn test_stack_replaces_layer_of_new_shape_when_alone() {
        let mut stack = ImageStack::new(0.02);
        stack.insert(Layer::Counts, Array2::zeros((4, 4))).unwrap();
        stack.insert(Layer::Counts, Array2::zeros((6, 6))).unwrap();
        assert_eq!(stack.shape(), Some((6, 6)));
    }

    #[test]
    fn test_require_missing_layer() {
        let stack = ImageStack::new(0.02);
        let err = stack.require(Layer::Background).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TsMapError>(),
            Some(&TsMapError::MissingLayer("background"))
        );
    }

    #[test]
    fn test_mask_treats_nan_as_excluded() {
        let stack = ImageStack::new(0.02)
            .with_layer(Layer::Mask, array![[1.0, 0.0], [f64::NAN, -2.0]])
            .unwrap();
        assert_eq!(stack.mask().unwrap(), array![[true, false], [false, true]]);
    }

    #[test]
    fn test_kernel_even_dimensions_padded() {
        let k = Kernel::new(Array2::ones((4, 2))).unwrap();
        assert_eq!(k.shape(), (5, 3));
        assert_eq!(k.half_size(), (2, 1));
        assert_eq!(k.array().sum(), 8.0);
        assert_eq!(k.array()[[4, 2]], 0.0);
    }

    #[test]
    fn test_kernel_normalize() {
        let k = Kernel::new(array![[1.0, 2.0, 1.0]]).unwrap().normalized().unwrap();
        assert!((k.array().sum() - 1.0).abs() < 1e-12);
        assert!(Kernel::new(array![[1.0, -1.0, 0.0]]).unwrap().normalized().is_err());
        assert!(Kernel::new(array![[f64::NAN]]).is_err());
    }

    #[test]
    fn test_result_kind_parse() {
        assert_eq!("flux_ul".parse::<ResultKind>().unwrap(), ResultKind::FluxUl);
        assert_eq!(
            "amplitude".parse::<ResultKind>(),
            Err(TsMapError::InvalidOutput("amplitude".into()))
        );
    }

    #[test]
    fn test_result_maps_nan_filled() {
        let maps = ResultMaps::nan_filled(&[ResultKind::Ts, ResultKind::Niter], (3, 2));
        assert!(maps.get(ResultKind::Ts).unwrap().iter().all(|v| v.is_nan()));
        assert!(maps.get(ResultKind::Flux).is_none());
        assert_eq!(maps.kinds().count(), 2);
    }
}
