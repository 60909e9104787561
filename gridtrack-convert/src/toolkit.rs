use std::collections::BTreeMap;
use std::fs;

use gridtrack_net::{AttrValue, CoreNetwork, Geometry, RGB_CHANNELS};
use half::f16;
use ndarray::ArrayViewD;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::graph::{input_name, Graph, GraphError, Node, Op};
use crate::package::{
    ColorLayout, ComputeUnits, DeploymentTarget, FeatureDescription, FeatureType, ModelDescription, Package,
    PackageSpec, ParamRef, Precision, Program, ProgramOp, WeightStore, SPEC_VERSION, WEIGHT_FILE,
};

/// Pixel scale the runtime applies to 8-bit frames before the graph runs.
pub const PIXEL_SCALE: f32 = 1.0 / 255.0;

const PARAM_ALIGNMENT: usize = 64;

#[derive(Debug, Error)]
pub enum ToolkitError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("input specs do not match graph inputs: {0}")]
    InputMismatch(String),
    #[error("cannot lower node {node}: {reason}")]
    Unsupported { node: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Image input declaration handed to the toolkit.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageInputSpec {
    pub name: String,
    pub height: usize,
    pub width: usize,
    pub scale: f32,
    pub bias: [f32; 3],
    pub color_layout: ColorLayout,
}

impl ImageInputSpec {
    pub fn rgb(name: impl Into<String>, height: usize, width: usize) -> Self {
        Self {
            name: name.into(),
            height,
            width,
            scale: PIXEL_SCALE,
            bias: [0.0; 3],
            color_layout: ColorLayout::Rgb,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, RGB_CHANNELS]
    }
}

/// One RGB image input per frame, named `f1..fF`.
pub fn frame_inputs(geometry: &Geometry) -> Vec<ImageInputSpec> {
    (1..=geometry.frames)
        .map(|k| ImageInputSpec::rgb(input_name(k), geometry.height, geometry.width))
        .collect()
}

/// Settings passed explicitly on every conversion call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConversionOptions {
    pub precision: Precision,
    pub minimum_deployment_target: DeploymentTarget,
    pub compute_units: ComputeUnits,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            precision: Precision::Float16,
            minimum_deployment_target: DeploymentTarget::Ios16,
            compute_units: ComputeUnits::All,
        }
    }
}

/// Lowers a wrapped graph into a deployment package.
///
/// Implementations are not required to keep the graph's output names; the
/// resolver repairs them afterwards.
pub trait ConversionToolkit {
    fn name(&self) -> &'static str;
    fn convert(
        &self,
        graph: &Graph,
        inputs: &[ImageInputSpec],
        options: &ConversionOptions,
    ) -> Result<Package, ToolkitError>;
}

/// In-process toolkit writing the package program and a staged weight blob.
pub struct NativeToolkit;

impl NativeToolkit {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeToolkit {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionToolkit for NativeToolkit {
    fn name(&self) -> &'static str {
        "native"
    }

    fn convert(
        &self,
        graph: &Graph,
        inputs: &[ImageInputSpec],
        options: &ConversionOptions,
    ) -> Result<Package, ToolkitError> {
        let output_shapes = graph.output_shapes()?;
        check_inputs(graph, inputs)?;

        let mut blob = WeightBlob::new(options.precision);
        let mut ops = Vec::new();
        for node in graph.nodes() {
            let operands: Vec<String> = node.inputs.iter().map(|&i| graph.nodes()[i].name.clone()).collect();
            match &node.op {
                Op::Input { .. } => {}
                Op::Core => {
                    let input = operands.into_iter().next().ok_or_else(|| ToolkitError::Unsupported {
                        node: node.name.clone(),
                        reason: "core node has no operand".into(),
                    })?;
                    ops.extend(lower_core(graph.core(), &node.name, input, &mut blob)?);
                }
                op => ops.push(ProgramOp {
                    name: node.name.clone(),
                    op: op.kind().to_string(),
                    inputs: operands,
                    output: node.name.clone(),
                    attrs: graph_attrs(op),
                    params: Vec::new(),
                }),
            }
        }

        let staging = tempfile::Builder::new().prefix("gridtrack-weights").tempdir()?;
        fs::write(staging.path().join(WEIGHT_FILE), &blob.bytes)?;
        debug!(ops = ops.len(), weight_bytes = blob.bytes.len(), "lowered graph");

        let outputs = graph
            .output_nodes()
            .zip(output_shapes)
            .map(|(node, shape)| FeatureDescription {
                name: node.name.clone(),
                short_description: String::new(),
                ty: FeatureType::MultiArray {
                    shape,
                    dtype: options.precision,
                },
            })
            .collect();
        let inputs = graph
            .input_names()
            .into_iter()
            .filter_map(|name| inputs.iter().find(|s| s.name == name))
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

        let mut metadata = BTreeMap::new();
        metadata.insert("source_graph".to_string(), graph.name().to_string());
        metadata.insert("toolkit".to_string(), self.name().to_string());

        let spec = PackageSpec {
            spec_version: SPEC_VERSION,
            description: ModelDescription {
                name: graph.name().to_string(),
                short_description: String::new(),
                inputs,
                outputs,
                metadata,
            },
            precision: options.precision,
            minimum_deployment_target: options.minimum_deployment_target,
            compute_units: options.compute_units,
            program: Program { ops },
        };
        Ok(Package::new(spec, Some(WeightStore::staged(staging))))
    }
}

fn check_inputs(graph: &Graph, inputs: &[ImageInputSpec]) -> Result<(), ToolkitError> {
    let expected: Vec<&Node> = graph.input_nodes().collect();
    if expected.len() != inputs.len() {
        return Err(ToolkitError::InputMismatch(format!(
            "graph has {} inputs, {} specs given",
            expected.len(),
            inputs.len()
        )));
    }
    for node in expected {
        let spec = inputs
            .iter()
            .find(|s| s.name == node.name)
            .ok_or_else(|| ToolkitError::InputMismatch(format!("no spec for input {}", node.name)))?;
        if let Op::Input { shape } = &node.op {
            if shape.as_slice() != spec.shape().as_slice() {
                return Err(ToolkitError::InputMismatch(format!(
                    "input {} is {:?}, spec declares {:?}",
                    node.name,
                    shape,
                    spec.shape()
                )));
            }
        }
    }
    Ok(())
}

fn graph_attrs(op: &Op) -> BTreeMap<String, Value> {
    let mut attrs = BTreeMap::new();
    match op {
        Op::Transpose { perm } => {
            attrs.insert("perm".into(), json!(perm));
        }
        Op::Concat { axis } => {
            attrs.insert("axis".into(), json!(axis));
        }
        Op::Reshape { shape } => {
            attrs.insert("shape".into(), json!(shape));
        }
        Op::Select { axis, index } => {
            attrs.insert("axis".into(), json!(axis));
            attrs.insert("index".into(), json!(index));
        }
        Op::Input { .. } | Op::Core => {}
    }
    attrs
}

/// Expand the core into one program op per layer, chained in order. The
/// last layer writes the value named after the core node.
fn lower_core(
    core: &dyn CoreNetwork,
    node: &str,
    input: String,
    blob: &mut WeightBlob,
) -> Result<Vec<ProgramOp>, ToolkitError> {
    let layers = core.layers();
    if layers.is_empty() {
        return Err(ToolkitError::Unsupported {
            node: node.to_string(),
            reason: "core network exposes no layers".into(),
        });
    }
    let count = layers.len();
    let mut prev = input;
    let mut ops = Vec::with_capacity(count);
    for (i, layer) in layers.into_iter().enumerate() {
        let name = format!("{node}/{}", layer.name);
        let output = if i + 1 == count { node.to_string() } else { name.clone() };
        let params = layer
            .params
            .iter()
            .map(|(key, view)| blob.push(format!("{name}.{key}"), view))
            .collect();
        let attrs = layer
            .attrs
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    AttrValue::Ints(v) => json!(v),
                    AttrValue::Float(f) => json!(f),
                };
                (key.to_string(), value)
            })
            .collect();
        ops.push(ProgramOp {
            name,
            op: layer.op.to_string(),
            inputs: vec![prev],
            output: output.clone(),
            attrs,
            params,
        });
        prev = output;
    }
    Ok(ops)
}

struct WeightBlob {
    precision: Precision,
    bytes: Vec<u8>,
}

impl WeightBlob {
    fn new(precision: Precision) -> Self {
        Self {
            precision,
            bytes: Vec::new(),
        }
    }

    fn push(&mut self, name: String, view: &ArrayViewD<'_, f32>) -> ParamRef {
        let padding = (PARAM_ALIGNMENT - self.bytes.len() % PARAM_ALIGNMENT) % PARAM_ALIGNMENT;
        self.bytes.resize(self.bytes.len() + padding, 0);
        let offset = self.bytes.len() as u64;
        match self.precision {
            Precision::Float16 => {
                let halves: Vec<f16> = view.iter().map(|v| f16::from_f32(*v)).collect();
                self.bytes.extend_from_slice(bytemuck::cast_slice(&halves));
            }
            Precision::Float32 => {
                let floats: Vec<f32> = view.iter().copied().collect();
                self.bytes.extend_from_slice(bytemuck::cast_slice(&floats));
            }
        }
        ParamRef {
            name,
            shape: view.shape().to_vec(),
            offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    #[test]
    fn blob_aligns_and_halves_parameters() {
        let a = ArrayD::<f32>::from_elem(ndarray::IxDyn(&[3]), 1.5);
        let mut blob = WeightBlob::new(Precision::Float16);
        let first = blob.push("a".into(), &a.view());
        let second = blob.push("b".into(), &a.view());
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 64);
        assert_eq!(blob.bytes.len(), 64 + 6);
        assert_eq!(f16::from_le_bytes([blob.bytes[64], blob.bytes[65]]).to_f32(), 1.5);
    }

    fn tiny_graph() -> Graph {
        let args = gridtrack_net::NetArgs {
            geometry: Geometry::new(2, 16, 16),
            stages: vec![gridtrack_net::Stage { width: 2, depth: 1 }; 4],
        };
        let core = gridtrack_net::GridTrackNet::new(args).unwrap();
        crate::graph::wrap_core(std::sync::Arc::new(core), Geometry::new(2, 16, 16)).unwrap()
    }

    #[test]
    fn native_toolkit_rejects_mismatched_inputs() {
        let graph = tiny_graph();
        let mut inputs = frame_inputs(&Geometry::new(2, 16, 16));
        inputs[1].width = 32;
        let err = NativeToolkit::new()
            .convert(&graph, &inputs, &ConversionOptions::default())
            .unwrap_err();
        assert!(matches!(err, ToolkitError::InputMismatch(_)));
    }

    #[test]
    fn native_toolkit_expands_core_layers() {
        let graph = tiny_graph();
        let options = ConversionOptions {
            precision: Precision::Float32,
            ..ConversionOptions::default()
        };
        let package = NativeToolkit::new()
            .convert(&graph, &frame_inputs(&Geometry::new(2, 16, 16)), &options)
            .unwrap();
        let ops = &package.spec().program.ops;
        assert!(ops.iter().any(|op| op.name == "core/conv1" && op.inputs == vec!["stack_frames"]));
        let last_core = ops.iter().rfind(|op| op.name.starts_with("core/")).unwrap();
        assert_eq!(last_core.output, "core");
        assert_eq!(package.output_names(), vec!["conf", "x_off", "y_off"]);

        let store = package.weight_store().unwrap();
        let size = fs::metadata(store.weight_file()).unwrap().len();
        assert_eq!(size, package.spec().required_weight_bytes());
    }

    #[test]
    fn frame_inputs_are_named_in_order() {
        let specs = frame_inputs(&Geometry::default());
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["f1", "f2", "f3", "f4", "f5"]);
        assert_eq!(specs[0].shape(), [432, 768, 3]);
        assert!((specs[0].scale * 255.0 - 1.0).abs() < 1e-6);
    }
}
