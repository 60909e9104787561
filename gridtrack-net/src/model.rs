use std::path::Path;

use ndarray::{s, Array, Array1, Array3, Array4, ArrayD, ArrayView3, ArrayViewD, Axis, Dimension};
use rand::Rng;

use crate::error::{NetError, Result};
use crate::weights;

/// Color channels carried by every input frame.
pub const RGB_CHANNELS: usize = 3;
/// Heads predicted per frame: confidence, x offset, y offset.
pub const HEADS: usize = 3;
/// Number of 2x2 pooling stages in the backbone.
pub const POOL_STAGES: usize = 4;
/// Spatial reduction between the input frames and the prediction grid.
pub const DOWNSAMPLE: usize = 1 << POOL_STAGES;

/// Frame count and resolution the network is built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub frames: usize,
    pub height: usize,
    pub width: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            frames: 5,
            height: 432,
            width: 768,
        }
    }
}

impl Geometry {
    pub fn new(frames: usize, height: usize, width: usize) -> Self {
        Self {
            frames,
            height,
            width,
        }
    }

    /// Channels of the stacked input, `[f1.R, f1.G, f1.B, f2.R, ...]`.
    pub fn input_channels(&self) -> usize {
        RGB_CHANNELS * self.frames
    }

    /// Channels of the raw core output, `HEADS` per frame in frame order.
    pub fn output_channels(&self) -> usize {
        HEADS * self.frames
    }

    pub fn grid_rows(&self) -> usize {
        self.height / DOWNSAMPLE
    }

    pub fn grid_cols(&self) -> usize {
        self.width / DOWNSAMPLE
    }

    pub fn validate(&self) -> Result<()> {
        if self.frames == 0 {
            return Err(NetError::InvalidArgs("frame count must be positive".into()));
        }
        for (label, value) in [("height", self.height), ("width", self.width)] {
            if value == 0 || value % DOWNSAMPLE != 0 {
                return Err(NetError::InvalidArgs(format!(
                    "{label} {value} must be a positive multiple of {DOWNSAMPLE}"
                )));
            }
        }
        Ok(())
    }
}

/// One backbone stage: `depth` conv blocks of `width` channels, then a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage {
    pub width: usize,
    pub depth: usize,
}

/// Configuration for the grid tracking network.
#[derive(Clone, Debug)]
pub struct NetArgs {
    /// Input frames and resolution.
    pub geometry: Geometry,
    /// Backbone stages, each followed by a 2x2 max pool.
    pub stages: Vec<Stage>,
}

impl Default for NetArgs {
    fn default() -> Self {
        Self {
            geometry: Geometry::default(),
            stages: vec![
                Stage { width: 64, depth: 2 },
                Stage { width: 128, depth: 2 },
                Stage { width: 256, depth: 3 },
                Stage { width: 512, depth: 3 },
            ],
        }
    }
}

impl NetArgs {
    /// Convenience constructor for the deployed configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_geometry(geometry: Geometry) -> Self {
        Self {
            geometry,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        if self.stages.len() != POOL_STAGES {
            return Err(NetError::InvalidArgs(format!(
                "expected {POOL_STAGES} stages, got {}",
                self.stages.len()
            )));
        }
        if self.stages.iter().any(|s| s.width == 0 || s.depth == 0) {
            return Err(NetError::InvalidArgs("stage width and depth must be positive".into()));
        }
        Ok(())
    }
}

/// Attribute attached to a layer record.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Ints(Vec<i64>),
    Float(f64),
}

/// Description of one layer, used by exporters to lower the network.
#[derive(Clone, Debug)]
pub struct LayerRecord<'a> {
    pub name: String,
    pub op: &'static str,
    pub attrs: Vec<(&'static str, AttrValue)>,
    pub params: Vec<(&'static str, ArrayViewD<'a, f32>)>,
}

impl<'a> LayerRecord<'a> {
    pub fn new(name: impl Into<String>, op: &'static str) -> Self {
        Self {
            name: name.into(),
            op,
            attrs: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: &'static str, value: AttrValue) -> Self {
        self.attrs.push((key, value));
        self
    }

    pub fn with_param(mut self, key: &'static str, value: ArrayViewD<'a, f32>) -> Self {
        self.params.push((key, value));
        self
    }
}

/// A channel-first network mapping `(3F, H, W)` to `(3F, H/16, W/16)`.
///
/// The wrapper treats implementors as an opaque callable unit; `layers`
/// exposes enough structure for a conversion toolkit to lower it.
pub trait CoreNetwork: Send + Sync {
    fn input_shape(&self) -> [usize; 3];
    fn output_shape(&self) -> [usize; 3];
    fn forward(&self, x: ArrayView3<'_, f32>) -> Result<Array3<f32>>;
    fn layers(&self) -> Vec<LayerRecord<'_>>;
}

/// 2D convolution with square kernel, stride 1 and same padding.
pub struct Conv2d {
    kernel: Array4<f32>, // out x in x k x k
    bias: Array1<f32>,
}

impl Conv2d {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        let mut rng = rand::thread_rng();
        let kernel = Array4::from_shape_fn(
            (out_channels, in_channels, kernel_size, kernel_size),
            |_| rng.gen_range(-0.1..0.1),
        );
        let bias = Array1::zeros(out_channels);
        Self { kernel, bias }
    }

    pub fn out_channels(&self) -> usize {
        self.kernel.dim().0
    }

    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (out, inp, k, _) = self.kernel.dim();
        let (channels, height, width) = x.dim();
        if channels != inp {
            return Err(NetError::ShapeMismatch {
                name: "conv input".into(),
                expected: vec![inp, height, width],
                actual: x.shape().to_vec(),
            });
        }
        let pad = k / 2;
        let mut padded = Array3::<f32>::zeros((channels, height + 2 * pad, width + 2 * pad));
        padded
            .slice_mut(s![.., pad..pad + height, pad..pad + width])
            .assign(x);

        // im2col: one row per (channel, ky, kx), one column per output pixel
        let mut cols = ndarray::Array2::<f32>::zeros((channels * k * k, height * width));
        for c in 0..channels {
            for ky in 0..k {
                for kx in 0..k {
                    let patch = padded.slice(s![c, ky..ky + height, kx..kx + width]);
                    let mut row = cols.row_mut((c * k + ky) * k + kx);
                    row.iter_mut().zip(patch.iter()).for_each(|(dst, src)| *dst = *src);
                }
            }
        }

        let weight = self.kernel.view().into_shape((out, inp * k * k))?;
        let mut y = weight.dot(&cols);
        y += &self.bias.view().insert_axis(Axis(1));
        Ok(y.into_shape((out, height, width))?)
    }

    fn set(&mut self, field: &str, name: &str, value: ArrayD<f32>) -> Result<()> {
        match field {
            "kernel" => self.kernel = conform(name, value, self.kernel.shape())?,
            "bias" => self.bias = conform(name, value, self.bias.shape())?,
            _ => return Err(NetError::MissingTensor(name.to_string())),
        }
        Ok(())
    }

    fn record(&self, name: String) -> LayerRecord<'_> {
        let k = self.kernel.dim().2 as i64;
        LayerRecord::new(name, "conv")
            .with_attr("kernel", AttrValue::Ints(vec![k, k]))
            .with_attr("strides", AttrValue::Ints(vec![1, 1]))
            .with_attr("pad", AttrValue::Ints(vec![k / 2; 4]))
            .with_param("weight", self.kernel.view().into_dyn())
            .with_param("bias", self.bias.view().into_dyn())
    }
}

/// Inference-mode batch normalization over the channel axis.
pub struct BatchNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    moving_mean: Array1<f32>,
    moving_variance: Array1<f32>,
    eps: f32,
}

impl BatchNorm {
    pub fn new(channels: usize) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            moving_mean: Array1::zeros(channels),
            moving_variance: Array1::ones(channels),
            eps: 1e-3,
        }
    }

    pub fn forward(&self, mut x: Array3<f32>) -> Array3<f32> {
        for (c, mut plane) in x.axis_iter_mut(Axis(0)).enumerate() {
            let scale = self.gamma[c] / (self.moving_variance[c] + self.eps).sqrt();
            let shift = self.beta[c] - self.moving_mean[c] * scale;
            plane.mapv_inplace(|v| v * scale + shift);
        }
        x
    }

    fn set(&mut self, field: &str, name: &str, value: ArrayD<f32>) -> Result<()> {
        let slot = match field {
            "gamma" => &mut self.gamma,
            "beta" => &mut self.beta,
            "moving_mean" => &mut self.moving_mean,
            "moving_variance" => &mut self.moving_variance,
            _ => return Err(NetError::MissingTensor(name.to_string())),
        };
        *slot = conform(name, value, slot.shape())?;
        Ok(())
    }

    fn record(&self, name: String) -> LayerRecord<'_> {
        LayerRecord::new(name, "batch_norm")
            .with_attr("epsilon", AttrValue::Float(self.eps as f64))
            .with_param("gamma", self.gamma.view().into_dyn())
            .with_param("beta", self.beta.view().into_dyn())
            .with_param("mean", self.moving_mean.view().into_dyn())
            .with_param("variance", self.moving_variance.view().into_dyn())
    }
}

fn conform<D: Dimension>(name: &str, value: ArrayD<f32>, expected: &[usize]) -> Result<Array<f32, D>> {
    if value.shape() != expected {
        return Err(NetError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: value.shape().to_vec(),
        });
    }
    Ok(value.as_standard_layout().into_owned().into_dimensionality::<D>()?)
}

fn relu(v: f32) -> f32 {
    v.max(0.0)
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

fn max_pool2(x: &Array3<f32>) -> Array3<f32> {
    let (channels, height, width) = x.dim();
    Array3::from_shape_fn((channels, height / 2, width / 2), |(c, y, col)| {
        let (y0, x0) = (2 * y, 2 * col);
        x[[c, y0, x0]]
            .max(x[[c, y0, x0 + 1]])
            .max(x[[c, y0 + 1, x0]])
            .max(x[[c, y0 + 1, x0 + 1]])
    })
}

/// Conv -> ReLU -> batch norm, optionally closing a stage with a pool.
struct ConvBlock {
    conv: Conv2d,
    norm: BatchNorm,
    pool_after: bool,
}

impl ConvBlock {
    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let h = self.conv.forward(x)?.mapv_into(relu);
        let h = self.norm.forward(h);
        Ok(if self.pool_after { max_pool2(&h) } else { h })
    }
}

/// Multi-frame grid tracking network.
///
/// Input is the channel-first stack of `F` RGB frames; output holds, per
/// grid cell, `(confidence, x offset, y offset)` for each frame in order.
pub struct GridTrackNet {
    pub args: NetArgs,
    blocks: Vec<ConvBlock>,
    head: Conv2d,
}

impl GridTrackNet {
    pub fn new(args: NetArgs) -> Result<Self> {
        args.validate()?;
        let mut blocks = Vec::new();
        let mut channels = args.geometry.input_channels();
        for stage in &args.stages {
            for i in 0..stage.depth {
                blocks.push(ConvBlock {
                    conv: Conv2d::new(channels, stage.width, 3),
                    norm: BatchNorm::new(stage.width),
                    pool_after: i + 1 == stage.depth,
                });
                channels = stage.width;
            }
        }
        let head = Conv2d::new(channels, args.geometry.output_channels(), 3);
        Ok(Self { args, blocks, head })
    }

    /// Build the network and load pretrained weights from `path`.
    pub fn load(args: NetArgs, path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(NetError::WeightsNotFound(path.to_path_buf()));
        }
        let mut net = Self::new(args)?;
        net.load_weights(path)?;
        Ok(net)
    }

    /// Replace every parameter with the tensors stored in `path`.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(NetError::WeightsNotFound(path.to_path_buf()));
        }
        let mut tensors = weights::read_weights(path)?;
        let names: Vec<String> = self.parameters().into_iter().map(|(n, _)| n).collect();
        for name in &names {
            let value = tensors
                .remove(name)
                .ok_or_else(|| NetError::MissingTensor(name.clone()))?;
            self.set_parameter(name, value)?;
        }
        if !tensors.is_empty() {
            tracing::warn!(unused = tensors.len(), "weights file holds tensors the network does not use");
        }
        tracing::info!(path = %path.display(), tensors = names.len(), "loaded core weights");
        Ok(())
    }

    pub fn save_weights(&self, path: &Path) -> Result<()> {
        weights::write_weights(path, &self.parameters())
    }

    /// Every parameter tensor with its weights-file name.
    pub fn parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut params = Vec::new();
        for (i, block) in self.blocks.iter().enumerate() {
            let n = i + 1;
            params.push((format!("conv{n}.kernel"), block.conv.kernel.view().into_dyn()));
            params.push((format!("conv{n}.bias"), block.conv.bias.view().into_dyn()));
            params.push((format!("bn{n}.gamma"), block.norm.gamma.view().into_dyn()));
            params.push((format!("bn{n}.beta"), block.norm.beta.view().into_dyn()));
            params.push((format!("bn{n}.moving_mean"), block.norm.moving_mean.view().into_dyn()));
            params.push((
                format!("bn{n}.moving_variance"),
                block.norm.moving_variance.view().into_dyn(),
            ));
        }
        params.push(("head.kernel".into(), self.head.kernel.view().into_dyn()));
        params.push(("head.bias".into(), self.head.bias.view().into_dyn()));
        params
    }

    pub fn set_parameter(&mut self, name: &str, value: ArrayD<f32>) -> Result<()> {
        let missing = || NetError::MissingTensor(name.to_string());
        let (layer, field) = name.split_once('.').ok_or_else(missing)?;
        if layer == "head" {
            return self.head.set(field, name, value);
        }
        let (index, is_conv) = if let Some(idx) = layer.strip_prefix("conv") {
            (idx, true)
        } else if let Some(idx) = layer.strip_prefix("bn") {
            (idx, false)
        } else {
            return Err(missing());
        };
        let index: usize = index.parse().map_err(|_| missing())?;
        let block = index
            .checked_sub(1)
            .and_then(|i| self.blocks.get_mut(i))
            .ok_or_else(missing)?;
        if is_conv {
            block.conv.set(field, name, value)
        } else {
            block.norm.set(field, name, value)
        }
    }
}

impl CoreNetwork for GridTrackNet {
    fn input_shape(&self) -> [usize; 3] {
        let g = &self.args.geometry;
        [g.input_channels(), g.height, g.width]
    }

    fn output_shape(&self) -> [usize; 3] {
        let g = &self.args.geometry;
        [self.head.out_channels(), g.grid_rows(), g.grid_cols()]
    }

    fn forward(&self, x: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let expected = self.input_shape();
        if x.shape() != expected.as_slice() {
            return Err(NetError::ShapeMismatch {
                name: "core input".into(),
                expected: expected.to_vec(),
                actual: x.shape().to_vec(),
            });
        }
        let mut h = x.to_owned();
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        Ok(self.head.forward(&h)?.mapv_into(sigmoid))
    }

    fn layers(&self) -> Vec<LayerRecord<'_>> {
        let mut records = Vec::new();
        let mut stage = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            let n = i + 1;
            records.push(block.conv.record(format!("conv{n}")));
            records.push(LayerRecord::new(format!("relu{n}"), "relu"));
            records.push(block.norm.record(format!("bn{n}")));
            if block.pool_after {
                stage += 1;
                records.push(
                    LayerRecord::new(format!("pool{stage}"), "max_pool")
                        .with_attr("kernel", AttrValue::Ints(vec![2, 2]))
                        .with_attr("strides", AttrValue::Ints(vec![2, 2])),
                );
            }
        }
        records.push(self.head.record("head".into()));
        records.push(LayerRecord::new("head_sigmoid", "sigmoid"));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_with_centre_tap_is_identity() {
        let mut conv = Conv2d::new(1, 1, 3);
        let mut kernel = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 1, 3, 3]));
        kernel[ndarray::IxDyn(&[0, 0, 1, 1])] = 1.0;
        conv.set("kernel", "kernel", kernel).unwrap();
        let x = Array3::from_shape_fn((1, 4, 5), |(_, y, x)| (y * 5 + x) as f32);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn conv_zero_pads_borders() {
        let mut conv = Conv2d::new(1, 1, 3);
        conv.set("kernel", "kernel", ArrayD::ones(ndarray::IxDyn(&[1, 1, 3, 3])))
            .unwrap();
        let x = Array3::<f32>::ones((1, 3, 3));
        let y = conv.forward(&x).unwrap();
        assert_eq!(y[[0, 0, 0]], 4.0);
        assert_eq!(y[[0, 0, 1]], 6.0);
        assert_eq!(y[[0, 1, 1]], 9.0);
    }

    #[test]
    fn max_pool_halves_each_axis() {
        let x = Array3::from_shape_fn((2, 4, 4), |(c, y, x)| (c * 16 + y * 4 + x) as f32);
        let y = max_pool2(&x);
        assert_eq!(y.dim(), (2, 2, 2));
        assert_eq!(y[[0, 0, 0]], 5.0);
        assert_eq!(y[[1, 1, 1]], 31.0);
    }

    #[test]
    fn geometry_rejects_unaligned_resolution() {
        assert!(Geometry::new(5, 430, 768).validate().is_err());
        assert!(Geometry::new(0, 432, 768).validate().is_err());
        let g = Geometry::default();
        assert_eq!((g.grid_rows(), g.grid_cols()), (27, 48));
    }

    #[test]
    fn unknown_parameter_names_are_rejected() {
        let args = NetArgs {
            geometry: Geometry::new(1, 16, 16),
            stages: vec![Stage { width: 2, depth: 1 }; 4],
        };
        let mut net = GridTrackNet::new(args).unwrap();
        let value = ArrayD::zeros(ndarray::IxDyn(&[2]));
        assert!(net.set_parameter("conv9.bias", value.clone()).is_err());
        assert!(net.set_parameter("dense.bias", value.clone()).is_err());
        assert!(net.set_parameter("conv1.bias", value).is_ok());
    }
}
