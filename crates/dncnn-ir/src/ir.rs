use core::fmt;
use std::fmt::Formatter;

use strum::{Display, EnumString};

pub type Shape = Vec<usize>;

/// Lowest operator-set version the exporter and the validator accept.
pub const MIN_OPSET_VERSION: i64 = 9;

/// Highest operator-set version the exporter and the validator accept.
pub const MAX_OPSET_VERSION: i64 = 18;

/// Name of the spatial kernel attribute of convolution nodes.
pub const KERNEL_SHAPE: &str = "kernel_shape";

/// The operators a converted denoising network is made of.
#[derive(Debug, Hash, Eq, PartialEq, EnumString, Clone, Copy, Display)]
pub enum NodeType {
    BatchNormalization,
    Conv,
    Relu,
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Float32(f32),
    Int64(i64),
    String(String),
    Float32s(Vec<f32>),
    Int64s(Vec<i64>),
}

impl AttributeValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            AttributeValue::Float32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64s(&self) -> Option<&[i64]> {
        match self {
            AttributeValue::Int64s(values) => Some(values),
            _ => None,
        }
    }

    /// Number of scalar values carried by the attribute.
    pub fn arity(&self) -> usize {
        match self {
            AttributeValue::Float32(_) | AttributeValue::Int64(_) | AttributeValue::String(_) => 1,
            AttributeValue::Float32s(values) => values.len(),
            AttributeValue::Int64s(values) => values.len(),
        }
    }
}

/// A named attribute attached to a node. Attributes keep their insertion order.
#[derive(new, Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

#[derive(new, Debug, Clone, PartialEq)]
pub struct Node {
    pub node_type: NodeType,
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attrs: Vec<Attribute>,
}

impl Node {
    pub fn attr(&self, name: &str) -> Option<&AttributeValue> {
        self.attrs
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| &attr.value)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn with_attr(mut self, name: &str, value: AttributeValue) -> Self {
        self.attrs.push(Attribute::new(name.to_string(), value));
        self
    }
}

/// A named constant tensor embedded in the graph.
#[derive(new, Clone, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub shape: Shape,
    pub data: Vec<f32>,
}

impl Initializer {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

// Initializers hold whole weight tensors; only print their metadata.
impl fmt::Debug for Initializer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Initializer")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A graph input or output: a float tensor with a static shape.
#[derive(new, Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub name: String,
    pub shape: Shape,
}

/// An exported computation graph.
///
/// Nodes are stored in execution order: every node input refers to a graph input, an
/// initializer or the output of an earlier node.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub name: String,
    pub opset_version: i64,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
    pub nodes: Vec<Node>,
    pub initializers: Vec<Initializer>,
}

impl Graph {
    pub fn new(name: impl Into<String>, opset_version: i64) -> Self {
        Self {
            name: name.into(),
            opset_version,
            inputs: Vec::new(),
            outputs: Vec::new(),
            nodes: Vec::new(),
            initializers: Vec::new(),
        }
    }

    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.iter().find(|init| init.name == name)
    }

    /// Total number of weight values carried by the initializers.
    pub fn num_params(&self) -> usize {
        self.initializers.iter().map(|init| init.data.len()).sum()
    }

    pub fn count_nodes(&self, node_type: NodeType) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.node_type == node_type)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn node_type_round_trips_through_op_names() {
        for node_type in [
            NodeType::BatchNormalization,
            NodeType::Conv,
            NodeType::Relu,
            NodeType::Sub,
        ] {
            let name = node_type.to_string();
            assert_eq!(NodeType::from_str(&name).unwrap(), node_type);
        }
        assert!(NodeType::from_str("Gemm").is_err());
    }

    #[test]
    fn attributes_keep_insertion_order() {
        let node = Node::new(
            NodeType::Conv,
            "conv".into(),
            vec!["x".into(), "w".into()],
            vec!["y".into()],
            vec![],
        )
        .with_attr("strides", AttributeValue::Int64s(vec![1, 1]))
        .with_attr("group", AttributeValue::Int64(1));

        let names: Vec<_> = node.attrs.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["strides", "group"]);
        assert_eq!(node.attr("group").and_then(|v| v.as_i64()), Some(1));
        assert!(!node.has_attr(KERNEL_SHAPE));
    }
}
