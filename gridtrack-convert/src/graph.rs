//! Layout wrapper around the core network.
//!
//! The wrapper takes one channel-last RGB image per frame, stacks them into
//! the channel-first tensor the core was trained on, and splits the core's
//! interleaved output channels into one named tensor per head.

use std::sync::Arc;

use gridtrack_net::{CoreNetwork, Geometry, NetError, HEADS, RGB_CHANNELS};
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis, Ix3};
use thiserror::Error;

/// Output names in head order: index 0 confidence, 1 x offset, 2 y offset.
pub const OUTPUT_NAMES: [&str; HEADS] = ["conf", "x_off", "y_off"];

/// Graph input name for a 1-based frame ordinal.
pub fn input_name(frame: usize) -> String {
    format!("f{frame}")
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("core network error: {0}")]
    Core(#[from] NetError),
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("core shapes {input:?} -> {output:?} do not match geometry {expected_input:?} -> {expected_output:?}")]
    CoreMismatch {
        input: [usize; 3],
        output: [usize; 3],
        expected_input: [usize; 3],
        expected_output: [usize; 3],
    },
    #[error("missing graph input {0}")]
    MissingInput(String),
    #[error("input {name}: expected shape {expected:?}, got {actual:?}")]
    InputShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("node {node}: {reason}")]
    InvalidNode { node: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Input { shape: Vec<usize> },
    Transpose { perm: Vec<usize> },
    Concat { axis: usize },
    Core,
    Reshape { shape: Vec<usize> },
    Select { axis: usize, index: usize },
}

impl Op {
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Transpose { .. } => "transpose",
            Op::Concat { .. } => "concat",
            Op::Core => "core",
            Op::Reshape { .. } => "reshape",
            Op::Select { .. } => "select",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<usize>,
}

/// A small static graph: nodes are stored in execution order.
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    core: Arc<dyn CoreNetwork>,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn core(&self) -> &dyn CoreNetwork {
        self.core.as_ref()
    }

    pub fn input_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.inputs.iter().map(move |&i| &self.nodes[i])
    }

    pub fn output_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.outputs.iter().map(move |&i| &self.nodes[i])
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.input_nodes().map(|n| n.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.output_nodes().map(|n| n.name.as_str()).collect()
    }

    /// Static shape of every node, indexed like `nodes()`.
    pub fn shapes(&self) -> Result<Vec<Vec<usize>>, GraphError> {
        let mut shapes: Vec<Vec<usize>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let shape = self.node_shape(node, &shapes)?;
            shapes.push(shape);
        }
        Ok(shapes)
    }

    /// Static shapes of the graph outputs, in output order.
    pub fn output_shapes(&self) -> Result<Vec<Vec<usize>>, GraphError> {
        let shapes = self.shapes()?;
        Ok(self.outputs.iter().map(|&i| shapes[i].clone()).collect())
    }

    fn node_shape(&self, node: &Node, known: &[Vec<usize>]) -> Result<Vec<usize>, GraphError> {
        let invalid = |reason: String| GraphError::InvalidNode {
            node: node.name.clone(),
            reason,
        };
        let operands = node
            .inputs
            .iter()
            .map(|&idx| known.get(idx).map(Vec::as_slice))
            .collect::<Option<Vec<&[usize]>>>()
            .ok_or_else(|| invalid("operand refers to a later node".into()))?;
        let arity = match &node.op {
            Op::Input { .. } => 0,
            Op::Concat { .. } => operands.len().max(1),
            _ => 1,
        };
        if operands.len() != arity {
            return Err(invalid(format!("expected {arity} operands, got {}", operands.len())));
        }

        let shape = match &node.op {
            Op::Input { shape } => shape.clone(),
            Op::Transpose { perm } => {
                let src = operands[0];
                if !is_permutation(perm, src.len()) {
                    return Err(invalid(format!("bad permutation {perm:?} for rank {}", src.len())));
                }
                perm.iter().map(|&p| src[p]).collect()
            }
            Op::Concat { axis } => {
                let first = operands[0];
                if *axis >= first.len() {
                    return Err(invalid(format!("axis {axis} out of range")));
                }
                let mut out = first.to_vec();
                out[*axis] = 0;
                for s in &operands {
                    let agrees = s.len() == first.len()
                        && s.iter().zip(first).enumerate().all(|(d, (a, b))| d == *axis || a == b);
                    if !agrees {
                        return Err(invalid(format!("operand shape {s:?} incompatible with {first:?}")));
                    }
                    out[*axis] += s[*axis];
                }
                out
            }
            Op::Core => {
                let expected = self.core.input_shape();
                if operands[0] != expected.as_slice() {
                    return Err(invalid(format!("core expects {expected:?}, got {:?}", operands[0])));
                }
                self.core.output_shape().to_vec()
            }
            Op::Reshape { shape } => {
                let src = operands[0];
                if src.iter().product::<usize>() != shape.iter().product::<usize>() {
                    return Err(invalid(format!("cannot reshape {src:?} into {shape:?}")));
                }
                shape.clone()
            }
            Op::Select { axis, index } => {
                let src = operands[0];
                if *axis >= src.len() || *index >= src[*axis] {
                    return Err(invalid(format!("index {index} on axis {axis} out of range for {src:?}")));
                }
                let mut out = src.to_vec();
                out.remove(*axis);
                out
            }
        };
        Ok(shape)
    }

    /// Execute the graph on named inputs, returning the named outputs in order.
    pub fn run(&self, inputs: &[(&str, ArrayViewD<'_, f32>)]) -> Result<Vec<(String, ArrayD<f32>)>, GraphError> {
        self.shapes()?;
        let mut values: Vec<ArrayD<f32>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let value = match &node.op {
                Op::Input { shape } => {
                    let (_, view) = inputs
                        .iter()
                        .find(|(name, _)| *name == node.name)
                        .ok_or_else(|| GraphError::MissingInput(node.name.clone()))?;
                    if view.shape() != shape.as_slice() {
                        return Err(GraphError::InputShape {
                            name: node.name.clone(),
                            expected: shape.clone(),
                            actual: view.shape().to_vec(),
                        });
                    }
                    view.to_owned()
                }
                Op::Transpose { perm } => values[node.inputs[0]]
                    .view()
                    .permuted_axes(perm.as_slice())
                    .as_standard_layout()
                    .into_owned(),
                Op::Concat { axis } => {
                    let views: Vec<ArrayViewD<'_, f32>> =
                        node.inputs.iter().map(|&i| values[i].view()).collect();
                    concatenate(Axis(*axis), &views)?
                }
                Op::Core => {
                    let x = values[node.inputs[0]].view().into_dimensionality::<Ix3>()?;
                    self.core.forward(x)?.into_dyn()
                }
                Op::Reshape { shape } => values[node.inputs[0]]
                    .as_standard_layout()
                    .into_owned()
                    .into_shape(shape.as_slice())?,
                Op::Select { axis, index } => values[node.inputs[0]]
                    .index_axis(Axis(*axis), *index)
                    .to_owned(),
            };
            values.push(value);
        }
        Ok(self
            .outputs
            .iter()
            .map(|&i| (self.nodes[i].name.clone(), values[i].clone()))
            .collect())
    }
}

fn is_permutation(perm: &[usize], rank: usize) -> bool {
    let mut seen = vec![false; rank];
    perm.len() == rank
        && perm
            .iter()
            .all(|&p| p < rank && !std::mem::replace(&mut seen[p], true))
}

#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<Node>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

impl GraphBuilder {
    fn add(&mut self, name: impl Into<String>, op: Op, inputs: Vec<usize>) -> usize {
        self.nodes.push(Node {
            name: name.into(),
            op,
            inputs,
        });
        self.nodes.len() - 1
    }

    fn input(&mut self, name: String, shape: Vec<usize>) -> usize {
        let idx = self.add(name, Op::Input { shape }, Vec::new());
        self.inputs.push(idx);
        idx
    }

    fn output(&mut self, idx: usize) {
        self.outputs.push(idx);
    }

    fn finish(self, name: String, core: Arc<dyn CoreNetwork>) -> Graph {
        Graph {
            name,
            nodes: self.nodes,
            inputs: self.inputs,
            outputs: self.outputs,
            core,
        }
    }
}

/// Wrap `core` so it accepts one `(H, W, 3)` image per frame and yields
/// `conf`, `x_off`, `y_off`, each `(F, grid_cols, grid_rows)`.
pub fn wrap_core(core: Arc<dyn CoreNetwork>, geometry: Geometry) -> Result<Graph, GraphError> {
    geometry.validate()?;
    let frames = geometry.frames;
    let (rows, cols) = (geometry.grid_rows(), geometry.grid_cols());
    let expected_input = [geometry.input_channels(), geometry.height, geometry.width];
    let expected_output = [geometry.output_channels(), rows, cols];
    if core.input_shape() != expected_input || core.output_shape() != expected_output {
        return Err(GraphError::CoreMismatch {
            input: core.input_shape(),
            output: core.output_shape(),
            expected_input,
            expected_output,
        });
    }

    let mut b = GraphBuilder::default();
    let mut chw = Vec::with_capacity(frames);
    for k in 1..=frames {
        let input = b.input(input_name(k), vec![geometry.height, geometry.width, RGB_CHANNELS]);
        chw.push(b.add(format!("to_chw_{k}"), Op::Transpose { perm: vec![2, 0, 1] }, vec![input]));
    }
    let stacked = b.add("stack_frames", Op::Concat { axis: 0 }, chw);
    let core_out = b.add("core", Op::Core, vec![stacked]);

    // (3F, rows, cols) -> (cols, rows, 3F)
    let grid = b.add("to_grid_channels", Op::Transpose { perm: vec![2, 1, 0] }, vec![core_out]);
    // channel 3f + h: frames are contiguous groups, head varies fastest
    let split = b.add(
        "split_frame_heads",
        Op::Reshape {
            shape: vec![cols, rows, frames, HEADS],
        },
        vec![grid],
    );
    let frames_first = b.add("frames_first", Op::Transpose { perm: vec![2, 0, 1, 3] }, vec![split]);
    for (head, name) in OUTPUT_NAMES.iter().enumerate() {
        let out = b.add(*name, Op::Select { axis: 3, index: head }, vec![frames_first]);
        b.output(out);
    }

    Ok(b.finish(format!("GridTrackNet{frames}Wrapper"), core))
}
