//! A small reference interpreter for exported graphs.
//!
//! The session evaluates a [`Graph`] with plain `ndarray` kernels and shares nothing with the
//! framework that produced the graph, which makes it usable as an independent second opinion on
//! an exported artifact. Like the OpenCV DNN importer used by the inference server, it refuses
//! convolutions without an explicit `kernel_shape`.

use std::{collections::HashMap, path::Path};

use ndarray::{
    s, Array2, Array4, ArrayD, ArrayView1, ArrayView4, Axis, ErrorKind, Ix1, Ix4, IxDyn,
    ShapeError,
};

use crate::{
    artifact::ArtifactError,
    ir::{Graph, Node, NodeType, Shape, KERNEL_SHAPE},
};

/// Default `epsilon` of `BatchNormalization` when the attribute is absent.
const DEFAULT_EPSILON: f32 = 1e-5;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("the graph must declare exactly one input and one output, found {inputs} and {outputs}")]
    Interface { inputs: usize, outputs: usize },

    #[error("node '{node}' is not supported: {reason}")]
    Unsupported { node: String, reason: String },

    #[error("input shape {found:?} does not match the declared graph input {expected:?}")]
    InputShape { expected: Shape, found: Shape },

    #[error("node '{node}' reads '{value}', which has not been computed")]
    MissingValue { node: String, value: String },

    #[error("node '{node}' failed: {source}")]
    Shape {
        node: String,
        #[source]
        source: ShapeError,
    },

    #[error("graph output '{0}' was never computed")]
    MissingOutput(String),
}

/// Convolution hyper parameters read from node attributes.
#[derive(Debug, Clone, PartialEq)]
struct ConvParams {
    kernel: [usize; 2],
    strides: [usize; 2],
    dilations: [usize; 2],
    // [top, left, bottom, right]
    pads: [usize; 4],
}

/// An evaluator bound to a single graph.
#[derive(Debug)]
pub struct Session {
    graph: Graph,
    constants: HashMap<String, ArrayD<f32>>,
    conv_params: HashMap<String, ConvParams>,
}

impl Session {
    pub fn new(graph: Graph) -> Result<Self, RuntimeError> {
        if graph.inputs.len() != 1 || graph.outputs.len() != 1 {
            return Err(RuntimeError::Interface {
                inputs: graph.inputs.len(),
                outputs: graph.outputs.len(),
            });
        }

        let mut constants = HashMap::with_capacity(graph.initializers.len());
        for init in graph.initializers.iter() {
            let array = ArrayD::from_shape_vec(IxDyn(&init.shape), init.data.clone()).map_err(
                |source| RuntimeError::Shape {
                    node: init.name.clone(),
                    source,
                },
            )?;
            constants.insert(init.name.clone(), array);
        }

        let mut conv_params = HashMap::new();
        for node in graph.nodes.iter() {
            check_arity(node)?;
            if node.node_type == NodeType::Conv {
                conv_params.insert(node.name.clone(), conv_params_of(node)?);
            }
        }

        log::debug!(
            "Session ready: {} nodes, {} constants",
            graph.nodes.len(),
            constants.len()
        );

        Ok(Self {
            graph,
            constants,
            conv_params,
        })
    }

    /// Load an artifact from disk and prepare it for evaluation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        Self::new(Graph::load(path)?)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Shape of the single graph input.
    pub fn input_shape(&self) -> &[usize] {
        &self.graph.inputs[0].shape
    }

    /// Accept inputs of another batch size or spatial extent.
    ///
    /// Every supported operator works on any spatial size; the output of a residual denoiser
    /// has the shape of its input. The rank and the channel count cannot change.
    pub fn with_input_shape(mut self, shape: &[usize]) -> Result<Self, RuntimeError> {
        let declared = &self.graph.inputs[0].shape;
        if shape.len() != declared.len()
            || shape.get(1) != declared.get(1)
            || shape.contains(&0)
        {
            return Err(RuntimeError::InputShape {
                expected: declared.clone(),
                found: shape.to_vec(),
            });
        }
        self.graph.inputs[0].shape = shape.to_vec();
        self.graph.outputs[0].shape = shape.to_vec();
        Ok(self)
    }

    /// Evaluate the graph on `input` and return the single graph output.
    pub fn run(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>, RuntimeError> {
        let declared = &self.graph.inputs[0];
        if input.shape() != declared.shape.as_slice() {
            return Err(RuntimeError::InputShape {
                expected: declared.shape.clone(),
                found: input.shape().to_vec(),
            });
        }

        let mut values: HashMap<String, ArrayD<f32>> = HashMap::new();
        values.insert(declared.name.clone(), input);

        for node in self.graph.nodes.iter() {
            let output = self.eval(node, &values)?;
            values.insert(node.outputs[0].clone(), output);
        }

        let output = &self.graph.outputs[0].name;
        values
            .remove(output)
            .ok_or_else(|| RuntimeError::MissingOutput(output.clone()))
    }

    fn eval(
        &self,
        node: &Node,
        values: &HashMap<String, ArrayD<f32>>,
    ) -> Result<ArrayD<f32>, RuntimeError> {
        let inputs = node
            .inputs
            .iter()
            .map(|name| {
                values
                    .get(name)
                    .or_else(|| self.constants.get(name))
                    .ok_or_else(|| RuntimeError::MissingValue {
                        node: node.name.clone(),
                        value: name.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let result = match node.node_type {
            NodeType::Conv => {
                let params = &self.conv_params[&node.name];
                conv2d(inputs[0], inputs[1], inputs.get(2).copied(), params)
            }
            NodeType::BatchNormalization => {
                let epsilon = node
                    .attr("epsilon")
                    .and_then(|value| value.as_f32())
                    .unwrap_or(DEFAULT_EPSILON);
                batch_norm(inputs[0], &inputs[1..5], epsilon)
            }
            NodeType::Relu => Ok(inputs[0].mapv(|value| value.max(0.0))),
            NodeType::Sub => sub(inputs[0], inputs[1]),
        };

        result.map_err(|source| RuntimeError::Shape {
            node: node.name.clone(),
            source,
        })
    }
}

fn check_arity(node: &Node) -> Result<(), RuntimeError> {
    let inputs = node.inputs.len();
    let valid = match node.node_type {
        NodeType::Conv => (2..=3).contains(&inputs),
        NodeType::BatchNormalization => inputs == 5,
        NodeType::Relu => inputs == 1,
        NodeType::Sub => inputs == 2,
    };
    if valid && node.outputs.len() == 1 {
        return Ok(());
    }
    Err(RuntimeError::Unsupported {
        node: node.name.clone(),
        reason: format!(
            "{} with {} inputs and {} outputs",
            node.node_type,
            inputs,
            node.outputs.len()
        ),
    })
}

fn conv_params_of(node: &Node) -> Result<ConvParams, RuntimeError> {
    let unsupported = |reason: String| RuntimeError::Unsupported {
        node: node.name.clone(),
        reason,
    };

    let group = node.attr("group").and_then(|v| v.as_i64()).unwrap_or(1);
    if group != 1 {
        return Err(unsupported(format!("group {group} is not supported")));
    }

    let kernel = node
        .attr(KERNEL_SHAPE)
        .and_then(|v| v.as_i64s())
        .ok_or_else(|| unsupported(format!("missing attribute '{KERNEL_SHAPE}'")))?;

    let ints = |name: &str, default: &[i64], len: usize| -> Result<Vec<usize>, RuntimeError> {
        let values = node
            .attr(name)
            .and_then(|v| v.as_i64s())
            .unwrap_or(default);
        if values.len() != len {
            return Err(unsupported(format!(
                "attribute '{name}' must hold {len} values, found {}",
                values.len()
            )));
        }
        values
            .iter()
            .map(|value| {
                usize::try_from(*value)
                    .map_err(|_| unsupported(format!("attribute '{name}' has negative values")))
            })
            .collect()
    };

    let kernel = ints_from(kernel, 2).ok_or_else(|| {
        unsupported(format!("'{KERNEL_SHAPE}' must hold 2 non-negative values"))
    })?;
    let strides = ints("strides", &[1, 1], 2)?;
    let dilations = ints("dilations", &[1, 1], 2)?;
    let pads = ints("pads", &[0, 0, 0, 0], 4)?;

    Ok(ConvParams {
        kernel: [kernel[0], kernel[1]],
        strides: [strides[0], strides[1]],
        dilations: [dilations[0], dilations[1]],
        pads: [pads[0], pads[1], pads[2], pads[3]],
    })
}

fn ints_from(values: &[i64], len: usize) -> Option<Vec<usize>> {
    if values.len() != len {
        return None;
    }
    values.iter().map(|v| usize::try_from(*v).ok()).collect()
}

fn incompatible() -> ShapeError {
    ShapeError::from_kind(ErrorKind::IncompatibleShape)
}

fn view4(array: &ArrayD<f32>) -> Result<ArrayView4<'_, f32>, ShapeError> {
    array.view().into_dimensionality::<Ix4>()
}

fn view1(array: &ArrayD<f32>) -> Result<ArrayView1<'_, f32>, ShapeError> {
    array.view().into_dimensionality::<Ix1>()
}

/// 2-d convolution by lowering each image to a column matrix and multiplying it with the
/// flattened kernels.
fn conv2d(
    x: &ArrayD<f32>,
    weight: &ArrayD<f32>,
    bias: Option<&ArrayD<f32>>,
    params: &ConvParams,
) -> Result<ArrayD<f32>, ShapeError> {
    let x = view4(x)?;
    let weight = view4(weight)?;
    let [batch_size, channels_in, in_height, in_width] =
        x.shape().try_into().map_err(|_| incompatible())?;
    let [channels_out, weight_channels, kernel_height, kernel_width] =
        weight.shape().try_into().map_err(|_| incompatible())?;

    if weight_channels != channels_in
        || params.kernel != [kernel_height, kernel_width]
        || kernel_height == 0
        || kernel_width == 0
    {
        return Err(incompatible());
    }

    let [stride_height, stride_width] = params.strides;
    let [dilation_height, dilation_width] = params.dilations;
    let [pad_top, pad_left, pad_bottom, pad_right] = params.pads;

    let span_height = dilation_height * (kernel_height - 1) + 1;
    let span_width = dilation_width * (kernel_width - 1) + 1;
    let padded_height = in_height + pad_top + pad_bottom;
    let padded_width = in_width + pad_left + pad_right;
    if padded_height < span_height
        || padded_width < span_width
        || stride_height == 0
        || stride_width == 0
    {
        return Err(incompatible());
    }
    let out_height = (padded_height - span_height) / stride_height + 1;
    let out_width = (padded_width - span_width) / stride_width + 1;

    let patch_len = channels_in * kernel_height * kernel_width;
    let kernels = Array2::from_shape_vec(
        (channels_out, patch_len),
        weight.iter().copied().collect(),
    )?;
    let bias = match bias {
        Some(bias) => {
            let bias = view1(bias)?;
            if bias.len() != channels_out {
                return Err(incompatible());
            }
            Some(bias)
        }
        None => None,
    };

    let mut output = Array4::<f32>::zeros((batch_size, channels_out, out_height, out_width));
    let mut columns = Array2::<f32>::zeros((patch_len, out_height * out_width));

    for b in 0..batch_size {
        columns.fill(0.0);
        for c in 0..channels_in {
            for kh in 0..kernel_height {
                for kw in 0..kernel_width {
                    let row = (c * kernel_height + kh) * kernel_width + kw;
                    for oh in 0..out_height {
                        let ih = oh * stride_height + kh * dilation_height;
                        if ih < pad_top || ih - pad_top >= in_height {
                            continue;
                        }
                        for ow in 0..out_width {
                            let iw = ow * stride_width + kw * dilation_width;
                            if iw < pad_left || iw - pad_left >= in_width {
                                continue;
                            }
                            columns[[row, oh * out_width + ow]] =
                                x[[b, c, ih - pad_top, iw - pad_left]];
                        }
                    }
                }
            }
        }

        let mut result = kernels.dot(&columns);
        if let Some(bias) = bias.as_ref() {
            for (mut row, value) in result.axis_iter_mut(Axis(0)).zip(bias.iter()) {
                row += *value;
            }
        }
        let result = result.into_shape_with_order((channels_out, out_height, out_width))?;
        output.slice_mut(s![b, .., .., ..]).assign(&result);
    }

    Ok(output.into_dyn())
}

/// Inference-mode batch normalisation over the channel axis.
fn batch_norm(
    x: &ArrayD<f32>,
    stats: &[&ArrayD<f32>],
    epsilon: f32,
) -> Result<ArrayD<f32>, ShapeError> {
    let [scale, bias, mean, var] = [stats[0], stats[1], stats[2], stats[3]].map(view1);
    let (scale, bias, mean, var) = (scale?, bias?, mean?, var?);

    let channels = x.shape().get(1).copied().ok_or_else(incompatible)?;
    if [scale.len(), bias.len(), mean.len(), var.len()] != [channels; 4] {
        return Err(incompatible());
    }

    let mut output = x.clone();
    for (c, mut plane) in output.axis_iter_mut(Axis(1)).enumerate() {
        let factor = scale[c] / (var[c] + epsilon).sqrt();
        let shift = bias[c] - mean[c] * factor;
        plane.mapv_inplace(|value| value * factor + shift);
    }
    Ok(output)
}

fn sub(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> Result<ArrayD<f32>, ShapeError> {
    if lhs.shape() != rhs.shape() {
        return Err(incompatible());
    }
    Ok(lhs - rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AttributeValue, Initializer, ValueInfo};
    use crate::patch::patch;

    fn conv_node(name: &str, inputs: &[&str], output: &str) -> Node {
        Node::new(
            NodeType::Conv,
            name.into(),
            inputs.iter().map(|s| s.to_string()).collect(),
            vec![output.into()],
            vec![],
        )
        .with_attr("dilations", AttributeValue::Int64s(vec![1, 1]))
        .with_attr("group", AttributeValue::Int64(1))
        .with_attr("pads", AttributeValue::Int64s(vec![1, 1, 1, 1]))
        .with_attr("strides", AttributeValue::Int64s(vec![1, 1]))
    }

    /// input - conv(input) where the kernel is a scaled identity.
    fn identity_residual(scale: f32) -> Graph {
        let mut kernel = vec![0.0; 9];
        kernel[4] = scale;

        let mut graph = Graph::new("identity", 12);
        graph.inputs.push(ValueInfo::new("input".into(), vec![1, 1, 4, 4]));
        graph.outputs.push(ValueInfo::new("output".into(), vec![1, 1, 4, 4]));
        graph
            .initializers
            .push(Initializer::new("w".into(), vec![1, 1, 3, 3], kernel));
        graph
            .nodes
            .push(conv_node("conv", &["input", "w"], "noise"));
        graph.nodes.push(Node::new(
            NodeType::Sub,
            "residual".into(),
            vec!["input".into(), "noise".into()],
            vec!["output".into()],
            vec![],
        ));
        patch(&graph).graph
    }

    fn ramp(shape: &[usize]) -> ArrayD<f32> {
        let len = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..len).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn conv_without_kernel_shape_is_refused() {
        let mut graph = identity_residual(1.0);
        graph.nodes[0].attrs.retain(|attr| attr.name != KERNEL_SHAPE);

        assert!(matches!(
            Session::new(graph),
            Err(RuntimeError::Unsupported { .. })
        ));
    }

    #[test]
    fn residual_of_half_identity_halves_the_input() {
        let session = Session::new(identity_residual(0.5)).unwrap();
        let input = ramp(&[1, 1, 4, 4]);

        let output = session.run(input.clone()).unwrap();

        let expected = input.mapv(|v| v * 0.5);
        assert_eq!(output, expected);
    }

    #[test]
    fn padded_conv_sums_neighbourhoods() {
        let mut graph = Graph::new("box", 12);
        graph.inputs.push(ValueInfo::new("input".into(), vec![1, 1, 3, 3]));
        graph.outputs.push(ValueInfo::new("output".into(), vec![1, 2, 3, 3]));
        graph.initializers.push(Initializer::new(
            "w".into(),
            vec![2, 1, 3, 3],
            [vec![1.0; 9], vec![0.0; 9]].concat(),
        ));
        graph
            .initializers
            .push(Initializer::new("b".into(), vec![2], vec![0.0, 7.0]));
        graph
            .nodes
            .push(conv_node("conv", &["input", "w", "b"], "output"));
        let session = Session::new(patch(&graph).graph).unwrap();

        let output = session.run(ArrayD::ones(IxDyn(&[1, 1, 3, 3]))).unwrap();

        let box_sums = [4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0];
        let expected: Vec<f32> = box_sums.into_iter().chain([7.0; 9]).collect();
        assert_eq!(output.iter().copied().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn batch_norm_uses_running_statistics() {
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1, 2]), vec![1.0, 3.0, 10.0, 20.0]).unwrap();
        let scale = ArrayD::from_shape_vec(IxDyn(&[2]), vec![2.0, 1.0]).unwrap();
        let bias = ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.0, 1.0]).unwrap();
        let mean = ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, 10.0]).unwrap();
        let var = ArrayD::from_shape_vec(IxDyn(&[2]), vec![4.0, 100.0]).unwrap();

        let output = batch_norm(&x, &[&scale, &bias, &mean, &var], 0.0).unwrap();

        assert_eq!(
            output.iter().copied().collect::<Vec<_>>(),
            vec![0.0, 2.0, 1.0, 2.0]
        );
    }

    #[test]
    fn input_shape_is_checked() {
        let session = Session::new(identity_residual(1.0)).unwrap();

        let err = session.run(ArrayD::zeros(IxDyn(&[1, 1, 5, 5]))).unwrap_err();

        assert!(matches!(err, RuntimeError::InputShape { .. }));
    }

    #[test]
    fn input_shape_can_be_resized() {
        let session = Session::new(identity_residual(0.5))
            .unwrap()
            .with_input_shape(&[2, 1, 6, 3])
            .unwrap();
        let input = ramp(&[2, 1, 6, 3]);

        let output = session.run(input.clone()).unwrap();

        assert_eq!(output, input.mapv(|v| v * 0.5));
        assert!(Session::new(identity_residual(0.5))
            .unwrap()
            .with_input_shape(&[1, 3, 4, 4])
            .is_err());
    }

    #[test]
    fn session_loads_persisted_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.onnx");
        identity_residual(1.0).save(&path).unwrap();

        let session = Session::from_file(&path).unwrap();
        let output = session.run(ramp(&[1, 1, 4, 4])).unwrap();

        assert!(output.iter().all(|v| *v == 0.0));
    }
}
