//! Traces a bound [`DnCnn`] into a portable [`Graph`].
//!
//! The trace is symbolic: every layer emits its node and initializers and propagates the running
//! tensor shape, so the exported graph carries the same static shapes the framework would see
//! on an input of the requested size.

use burn::{nn::conv::Conv2d, tensor::backend::Backend};
use dncnn_ir::{
    AttributeValue, Graph, Initializer, Node, NodeType, Shape, ValueInfo, KERNEL_SHAPE,
    MAX_OPSET_VERSION, MIN_OPSET_VERSION,
};

use crate::model::{ConvBlock, DnCnn, SlotError};

pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "output";
pub const GRAPH_NAME: &str = "main_graph";

/// First opset for which convolutions are exported with an explicit `kernel_shape`.
pub const KERNEL_SHAPE_OPSET: i64 = 13;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExportError {
    #[error("opset {0} is not supported, expected 9..=18")]
    UnsupportedOpset(i64),

    #[error("input shape {found:?} is not a [batch, {channels}, height, width] image batch")]
    InputShape { channels: usize, found: Vec<usize> },

    #[error("layer '{layer}' expects {expected:?}, the traced tensor is {found:?}")]
    ShapeMismatch {
        layer: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("parameter '{0}' is not part of the network")]
    MissingParameter(String),

    #[error(transparent)]
    Parameter(SlotError),
}

/// Export `model` for inputs of `input_shape` (`[batch, channels, height, width]`).
pub fn export<B: Backend>(
    model: &DnCnn<B>,
    input_shape: &[usize],
    opset_version: i64,
) -> Result<Graph, ExportError> {
    if !(MIN_OPSET_VERSION..=MAX_OPSET_VERSION).contains(&opset_version) {
        return Err(ExportError::UnsupportedOpset(opset_version));
    }
    let channels = model.image_channels();
    let shape: [usize; 4] = match input_shape {
        &[batch, c, height, width] if c == channels && ![batch, height, width].contains(&0) => {
            [batch, c, height, width]
        }
        _ => {
            return Err(ExportError::InputShape {
                channels,
                found: input_shape.to_vec(),
            })
        }
    };

    let mut tracer = Tracer::new(model, opset_version, shape);
    tracer.conv(0, &model.head)?;
    tracer.relu(1);
    for (i, block) in model.body.iter().enumerate() {
        tracer.block(i, block)?;
    }
    tracer.conv(model.tail_index(), &model.tail)?;
    let graph = tracer.residual()?;

    log::info!(
        "Exported graph with {} nodes and {} initializers ({} values) at opset {}",
        graph.nodes.len(),
        graph.initializers.len(),
        graph.num_params(),
        opset_version
    );
    Ok(graph)
}

struct Tracer<'a, B: Backend> {
    model: &'a DnCnn<B>,
    graph: Graph,
    current: String,
    shape: [usize; 4],
}

impl<'a, B: Backend> Tracer<'a, B> {
    fn new(model: &'a DnCnn<B>, opset_version: i64, shape: [usize; 4]) -> Self {
        let mut graph = Graph::new(GRAPH_NAME, opset_version);
        graph
            .inputs
            .push(ValueInfo::new(INPUT_NAME.to_string(), shape.to_vec()));
        Self {
            model,
            graph,
            current: INPUT_NAME.to_string(),
            shape,
        }
    }

    fn block(&mut self, i: usize, block: &ConvBlock<B>) -> Result<(), ExportError> {
        self.conv(3 * i + 2, &block.conv)?;
        self.batch_norm(3 * i + 3)?;
        self.relu(3 * i + 4);
        Ok(())
    }

    fn conv(&mut self, index: usize, conv: &Conv2d<B>) -> Result<(), ExportError> {
        let layer = self.model.layer_name(index);
        let weight = self.initializer(index, "weight")?;
        let [_, in_channels, height, width] = self.shape;

        let (out_channels, kernel) = match weight.shape.as_slice() {
            &[out, input, kh, kw] if input * conv.groups == in_channels => (out, [kh, kw]),
            _ => {
                return Err(ExportError::ShapeMismatch {
                    layer,
                    expected: weight.shape.clone(),
                    found: self.shape.to_vec(),
                })
            }
        };

        let padding = self.model.padding;
        let out_dim = |size: usize, axis: usize| {
            let span = conv.dilation[axis] * (kernel[axis] - 1) + 1;
            size.checked_add(2 * padding)?
                .checked_sub(span)
                .map(|rest| rest / conv.stride[axis] + 1)
        };
        let (Some(out_height), Some(out_width)) = (out_dim(height, 0), out_dim(width, 1)) else {
            return Err(ExportError::ShapeMismatch {
                layer,
                expected: weight.shape.clone(),
                found: self.shape.to_vec(),
            });
        };

        let mut inputs = vec![self.current.clone(), weight.name.clone()];
        self.graph.initializers.push(weight);
        if conv.bias.is_some() {
            let bias = self.initializer(index, "bias")?;
            inputs.push(bias.name.clone());
            self.graph.initializers.push(bias);
        }

        let mut node = Node::new(
            NodeType::Conv,
            format!("/{}/{layer}/Conv", self.model.container),
            inputs,
            vec![format!("/{}/{layer}/Conv_output_0", self.model.container)],
            vec![],
        )
        .with_attr("dilations", ints(&conv.dilation))
        .with_attr("group", AttributeValue::Int64(conv.groups as i64))
        .with_attr("pads", ints(&[padding; 4]))
        .with_attr("strides", ints(&conv.stride));
        if self.graph.opset_version >= KERNEL_SHAPE_OPSET {
            node = node.with_attr(KERNEL_SHAPE, ints(&kernel));
        }

        self.push(node, [self.shape[0], out_channels, out_height, out_width]);
        Ok(())
    }

    fn batch_norm(&mut self, index: usize) -> Result<(), ExportError> {
        let layer = self.model.layer_name(index);
        let mut inputs = vec![self.current.clone()];
        for field in ["weight", "bias", "running_mean", "running_var"] {
            let tensor = self.initializer(index, field)?;
            if tensor.shape != [self.shape[1]] {
                return Err(ExportError::ShapeMismatch {
                    layer,
                    expected: tensor.shape,
                    found: self.shape.to_vec(),
                });
            }
            inputs.push(tensor.name.clone());
            self.graph.initializers.push(tensor);
        }

        let node = Node::new(
            NodeType::BatchNormalization,
            format!("/{}/{layer}/BatchNormalization", self.model.container),
            inputs,
            vec![format!(
                "/{}/{layer}/BatchNormalization_output_0",
                self.model.container
            )],
            vec![],
        )
        .with_attr("epsilon", AttributeValue::Float32(self.model.epsilon as f32))
        .with_attr(
            "momentum",
            AttributeValue::Float32(1.0 - self.model.momentum as f32),
        );
        self.push(node, self.shape);
        Ok(())
    }

    fn relu(&mut self, index: usize) {
        let layer = self.model.layer_name(index);
        let node = Node::new(
            NodeType::Relu,
            format!("/{}/{layer}/Relu", self.model.container),
            vec![self.current.clone()],
            vec![format!("/{}/{layer}/Relu_output_0", self.model.container)],
            vec![],
        );
        self.push(node, self.shape);
    }

    fn residual(mut self) -> Result<Graph, ExportError> {
        let input = self.graph.inputs[0].shape.clone();
        if input != self.shape {
            return Err(ExportError::ShapeMismatch {
                layer: "residual".to_string(),
                expected: input,
                found: self.shape.to_vec(),
            });
        }
        let node = Node::new(
            NodeType::Sub,
            "/Sub".to_string(),
            vec![INPUT_NAME.to_string(), self.current.clone()],
            vec![OUTPUT_NAME.to_string()],
            vec![],
        );
        self.graph.nodes.push(node);
        self.graph
            .outputs
            .push(ValueInfo::new(OUTPUT_NAME.to_string(), input));
        Ok(self.graph)
    }

    fn push(&mut self, node: Node, shape: [usize; 4]) {
        log::trace!("{} -> {:?}", node.name, shape);
        self.current = node.outputs[0].clone();
        self.shape = shape;
        self.graph.nodes.push(node);
    }

    fn initializer(&self, index: usize, field: &str) -> Result<Initializer, ExportError> {
        let name = format!("{}.{field}", self.model.layer_name(index));
        let tensor = self.model.slot(&name).map_err(|err| match err {
            SlotError::Unknown(name) => ExportError::MissingParameter(name),
            other => ExportError::Parameter(other),
        })?;
        Ok(Initializer::new(name, tensor.shape, tensor.values))
    }
}

fn ints(values: &[usize]) -> AttributeValue {
    AttributeValue::Int64s(values.iter().map(|v| *v as i64).collect())
}

/// Declared shape of the graph output.
pub fn output_shape(graph: &Graph) -> Option<&Shape> {
    graph.outputs.first().map(|output| &output.shape)
}
