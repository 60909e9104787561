#![allow(dead_code)]

use std::cell::Cell;
use std::collections::BTreeMap;

use gridtrack_convert::package::{
    ComputeUnits, DeploymentTarget, FeatureDescription, FeatureType, ModelDescription, Program,
    ProgramOp, SPEC_VERSION, WEIGHT_FILE,
};
use gridtrack_convert::{
    ConversionOptions, ConversionToolkit, FeatureRenamer, Graph, ImageInputSpec, Package, PackageError,
    PackageSpec, ToolkitError, WeightStore,
};
use gridtrack_net::{CoreNetwork, Geometry, LayerRecord, NetArgs, NetError, Stage, DOWNSAMPLE};
use ndarray::{s, Array3, ArrayView3};

pub fn small_geometry() -> Geometry {
    Geometry::new(5, 32, 48)
}

/// Narrow stages so the real network runs quickly.
pub fn small_args() -> NetArgs {
    NetArgs {
        geometry: small_geometry(),
        stages: vec![
            Stage { width: 4, depth: 1 },
            Stage { width: 4, depth: 1 },
            Stage { width: 8, depth: 1 },
            Stage { width: 8, depth: 1 },
        ],
    }
}

/// Core that averages each input channel over 16x16 blocks, so output
/// channel `c` is a downsampled copy of input channel `c`.
pub struct PoolingCore {
    pub geometry: Geometry,
}

impl PoolingCore {
    pub fn new(geometry: Geometry) -> Self {
        Self { geometry }
    }
}

impl CoreNetwork for PoolingCore {
    fn input_shape(&self) -> [usize; 3] {
        let g = &self.geometry;
        [g.input_channels(), g.height, g.width]
    }

    fn output_shape(&self) -> [usize; 3] {
        let g = &self.geometry;
        [g.input_channels(), g.grid_rows(), g.grid_cols()]
    }

    fn forward(&self, x: ArrayView3<'_, f32>) -> gridtrack_net::Result<Array3<f32>> {
        if x.shape() != self.input_shape().as_slice() {
            return Err(NetError::ShapeMismatch {
                name: "pooling core input".into(),
                expected: self.input_shape().to_vec(),
                actual: x.shape().to_vec(),
            });
        }
        let [c, rows, cols] = self.output_shape();
        Ok(Array3::from_shape_fn((c, rows, cols), |(c, r, q)| {
            x.slice(s![c, r * DOWNSAMPLE..(r + 1) * DOWNSAMPLE, q * DOWNSAMPLE..(q + 1) * DOWNSAMPLE])
                .mean()
                .unwrap_or(0.0)
        }))
    }

    fn layers(&self) -> Vec<LayerRecord<'_>> {
        vec![LayerRecord::new("avg_pool", "avg_pool")
            .with_attr("kernel", gridtrack_net::AttrValue::Ints(vec![16, 16]))]
    }
}

/// Frame `k` (1-based) with every pixel set to `(0.1k, 0.1k + 0.01, 0.1k + 0.02)`.
pub fn marker_frame(geometry: &Geometry, k: usize) -> Array3<f32> {
    let base = 0.1 * k as f32;
    Array3::from_shape_fn((geometry.height, geometry.width, 3), |(_, _, c)| base + 0.01 * c as f32)
}

pub fn solid_frame(geometry: &Geometry, value: f32) -> Array3<f32> {
    Array3::from_elem((geometry.height, geometry.width, 3), value)
}

/// Toolkit that ignores the graph and reports the given output names.
pub struct StubToolkit {
    pub outputs: Vec<String>,
    pub with_store: bool,
}

impl StubToolkit {
    pub fn new(outputs: &[&str], with_store: bool) -> Self {
        Self {
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            with_store,
        }
    }
}

impl ConversionToolkit for StubToolkit {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn convert(
        &self,
        graph: &Graph,
        inputs: &[ImageInputSpec],
        options: &ConversionOptions,
    ) -> Result<Package, ToolkitError> {
        let inputs = inputs
            .iter()
            .map(|s| FeatureDescription {
                name: s.name.clone(),
                short_description: String::new(),
                ty: FeatureType::Image {
                    height: s.height,
                    width: s.width,
                    color_layout: s.color_layout,
                    scale: s.scale,
                    bias: s.bias,
                },
            })
            .collect();
        let outputs = self
            .outputs
            .iter()
            .map(|name| FeatureDescription {
                name: name.clone(),
                short_description: String::new(),
                ty: FeatureType::MultiArray {
                    shape: vec![1],
                    dtype: options.precision,
                },
            })
            .collect();
        let ops = self
            .outputs
            .iter()
            .map(|name| ProgramOp {
                name: name.clone(),
                op: "select".into(),
                inputs: vec!["core".into()],
                output: name.clone(),
                attrs: BTreeMap::new(),
                params: Vec::new(),
            })
            .collect();
        let spec = PackageSpec {
            spec_version: SPEC_VERSION,
            description: ModelDescription {
                name: graph.name().to_string(),
                inputs,
                outputs,
                ..ModelDescription::default()
            },
            precision: options.precision,
            minimum_deployment_target: DeploymentTarget::Ios16,
            compute_units: ComputeUnits::All,
            program: Program { ops },
        };
        let store = if self.with_store {
            let dir = tempfile::tempdir()?;
            std::fs::write(dir.path().join(WEIGHT_FILE), [0u8; 8])?;
            Some(WeightStore::staged(dir))
        } else {
            None
        };
        Ok(Package::new(spec, store))
    }
}

/// Renamer that counts calls and can be told to fail either strategy.
#[derive(Default)]
pub struct CountingRenamer {
    pub in_place_calls: Cell<usize>,
    pub spec_calls: Cell<usize>,
    pub fail_in_place: bool,
    pub fail_spec: bool,
}

impl CountingRenamer {
    pub fn failing(in_place: bool, spec: bool) -> Self {
        Self {
            fail_in_place: in_place,
            fail_spec: spec,
            ..Self::default()
        }
    }

    pub fn total_calls(&self) -> usize {
        self.in_place_calls.get() + self.spec_calls.get()
    }
}

impl FeatureRenamer for CountingRenamer {
    fn rename_in_package(&self, package: &mut Package, old: &str, new: &str) -> Result<(), PackageError> {
        self.in_place_calls.set(self.in_place_calls.get() + 1);
        if self.fail_in_place {
            return Err(PackageError::UnknownFeature(old.to_string()));
        }
        package.rename_feature(old, new)
    }

    fn rename_in_spec(&self, spec: &mut PackageSpec, old: &str, new: &str) -> Result<(), PackageError> {
        self.spec_calls.set(self.spec_calls.get() + 1);
        if self.fail_spec {
            return Err(PackageError::UnknownFeature(old.to_string()));
        }
        spec.rename_feature(old, new)
    }
}

