//! Structural checks on an exported graph.
//!
//! Validation never executes the graph; it only confirms that the graph is internally
//! consistent and that it honours the contract of the downstream inference server (one input,
//! one output, same spatial shape).

use std::collections::HashSet;

use crate::ir::{Graph, Node, NodeType, KERNEL_SHAPE, MAX_OPSET_VERSION, MIN_OPSET_VERSION};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StructuralError {
    #[error("opset version {0} is outside the supported range 9..=18")]
    UnsupportedOpset(i64),

    #[error("graph interface: {0}")]
    Interface(String),

    #[error("name '{0}' is defined more than once")]
    DuplicateName(String),

    #[error("initializer '{name}' holds {found} values but its shape needs {expected}")]
    InitializerSize {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("node '{node}' reads '{input}', which is neither a graph input, an initializer nor an earlier node output")]
    DanglingInput { node: String, input: String },

    #[error("node '{node}' ({op}) expects {expected} inputs, found {found}")]
    InputArity {
        node: String,
        op: NodeType,
        expected: &'static str,
        found: usize,
    },

    #[error("node '{node}' is missing required attribute '{attribute}'")]
    MissingAttribute { node: String, attribute: String },

    #[error("node '{node}' attribute '{attribute}' must hold {expected} values, found {found}")]
    AttributeArity {
        node: String,
        attribute: String,
        expected: usize,
        found: usize,
    },

    #[error("node '{node}' kernel_shape {kernel:?} does not match weight spatial dims {weight:?}")]
    KernelMismatch {
        node: String,
        kernel: Vec<i64>,
        weight: Vec<usize>,
    },

    #[error("graph output '{0}' is not produced by any node")]
    UnproducedOutput(String),
}

/// Check the graph for internal structural consistency.
pub fn validate(graph: &Graph) -> Result<(), StructuralError> {
    if !(MIN_OPSET_VERSION..=MAX_OPSET_VERSION).contains(&graph.opset_version) {
        return Err(StructuralError::UnsupportedOpset(graph.opset_version));
    }
    check_interface(graph)?;

    let mut known: HashSet<&str> = HashSet::new();
    for input in graph.inputs.iter() {
        if !known.insert(input.name.as_str()) {
            return Err(StructuralError::DuplicateName(input.name.clone()));
        }
    }
    for init in graph.initializers.iter() {
        if !known.insert(init.name.as_str()) {
            return Err(StructuralError::DuplicateName(init.name.clone()));
        }
        if init.data.len() != init.num_elements() {
            return Err(StructuralError::InitializerSize {
                name: init.name.clone(),
                expected: init.num_elements(),
                found: init.data.len(),
            });
        }
    }

    for node in graph.nodes.iter() {
        check_input_arity(node)?;
        for input in node.inputs.iter() {
            if !known.contains(input.as_str()) {
                return Err(StructuralError::DanglingInput {
                    node: node.name.clone(),
                    input: input.clone(),
                });
            }
        }
        check_attributes(graph, node)?;
        for output in node.outputs.iter() {
            if !known.insert(output.as_str()) {
                return Err(StructuralError::DuplicateName(output.clone()));
            }
        }
    }

    for output in graph.outputs.iter() {
        let produced = graph
            .nodes
            .iter()
            .any(|node| node.outputs.iter().any(|name| name == &output.name));
        if !produced {
            return Err(StructuralError::UnproducedOutput(output.name.clone()));
        }
    }

    Ok(())
}

fn check_interface(graph: &Graph) -> Result<(), StructuralError> {
    let (input, output) = match (graph.inputs.as_slice(), graph.outputs.as_slice()) {
        ([input], [output]) => (input, output),
        (inputs, outputs) => {
            return Err(StructuralError::Interface(format!(
                "expected exactly one input and one output, found {} and {}",
                inputs.len(),
                outputs.len()
            )))
        }
    };

    if input.shape.len() != 4 || output.shape.len() != 4 {
        return Err(StructuralError::Interface(format!(
            "input {:?} and output {:?} must both be [batch, channels, height, width]",
            input.shape, output.shape
        )));
    }
    if input.shape[2..] != output.shape[2..] {
        return Err(StructuralError::Interface(format!(
            "input spatial shape {:?} differs from output spatial shape {:?}",
            &input.shape[2..],
            &output.shape[2..]
        )));
    }
    Ok(())
}

fn check_input_arity(node: &Node) -> Result<(), StructuralError> {
    let (valid, expected) = match node.node_type {
        NodeType::Conv => ((2..=3).contains(&node.inputs.len()), "2 or 3"),
        NodeType::BatchNormalization => (node.inputs.len() == 5, "5"),
        NodeType::Relu => (node.inputs.len() == 1, "1"),
        NodeType::Sub => (node.inputs.len() == 2, "2"),
    };
    if valid && node.outputs.len() == 1 {
        return Ok(());
    }
    Err(StructuralError::InputArity {
        node: node.name.clone(),
        op: node.node_type,
        expected,
        found: node.inputs.len(),
    })
}

fn check_attributes(graph: &Graph, node: &Node) -> Result<(), StructuralError> {
    if node.node_type != NodeType::Conv {
        return Ok(());
    }

    let kernel = node
        .attr(KERNEL_SHAPE)
        .ok_or_else(|| StructuralError::MissingAttribute {
            node: node.name.clone(),
            attribute: KERNEL_SHAPE.to_string(),
        })?;
    let kernel = kernel
        .as_i64s()
        .ok_or_else(|| StructuralError::AttributeArity {
            node: node.name.clone(),
            attribute: KERNEL_SHAPE.to_string(),
            expected: 2,
            found: kernel.arity(),
        })?;

    // The weight may come from a node output; only initializers have a known shape.
    let Some(weight) = graph.initializer(&node.inputs[1]) else {
        if kernel.len() != 2 {
            return Err(StructuralError::AttributeArity {
                node: node.name.clone(),
                attribute: KERNEL_SHAPE.to_string(),
                expected: 2,
                found: kernel.len(),
            });
        }
        return Ok(());
    };

    let spatial_rank = weight.shape.len().saturating_sub(2);
    if kernel.len() != spatial_rank {
        return Err(StructuralError::AttributeArity {
            node: node.name.clone(),
            attribute: KERNEL_SHAPE.to_string(),
            expected: spatial_rank,
            found: kernel.len(),
        });
    }
    let matches = kernel
        .iter()
        .zip(weight.shape[2..].iter())
        .all(|(k, w)| *k >= 0 && *k as usize == *w);
    if !matches {
        return Err(StructuralError::KernelMismatch {
            node: node.name.clone(),
            kernel: kernel.to_vec(),
            weight: weight.shape[2..].to_vec(),
        });
    }

    for name in ["strides", "dilations"] {
        if let Some(value) = node.attr(name) {
            if value.arity() != spatial_rank {
                return Err(StructuralError::AttributeArity {
                    node: node.name.clone(),
                    attribute: name.to_string(),
                    expected: spatial_rank,
                    found: value.arity(),
                });
            }
        }
    }
    if let Some(pads) = node.attr("pads") {
        if pads.arity() != 2 * spatial_rank {
            return Err(StructuralError::AttributeArity {
                node: node.name.clone(),
                attribute: "pads".to_string(),
                expected: 2 * spatial_rank,
                found: pads.arity(),
            });
        }
    }

    Ok(())
}
