//! Reading and writing graph artifacts.
//!
//! An artifact is an ONNX `ModelProto`: a length-delimited protobuf message holding the node
//! list, the initializers (as little-endian `raw_data`) and the declared operator-set version.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use protobuf::{Enum, Message, MessageField};

use crate::ir::{Attribute, AttributeValue, Graph, Initializer, Node, NodeType, Shape, ValueInfo};
use crate::protos::{
    attribute_proto::AttributeType, tensor_proto::DataType as DT, tensor_shape_proto,
    tensor_shape_proto::dimension::Value as DimValue, type_proto, AttributeProto, GraphProto,
    ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeProto, TypeProto,
    ValueInfoProto,
};

/// Name written into `ModelProto.producer_name`.
pub const PRODUCER_NAME: &str = "dncnn-import";

/// Errors raised while encoding or decoding an artifact.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed protobuf: {0}")]
    Decode(#[from] protobuf::Error),

    #[error("unsupported artifact content: {0}")]
    Unsupported(String),
}

/// ONNX IR version matching the release that introduced the given opset.
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        i64::MIN..=8 => 3,
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        _ => 9,
    }
}

impl Graph {
    /// Encode the graph as an ONNX model.
    pub fn to_model_proto(&self) -> ModelProto {
        let mut graph = GraphProto::new();
        graph.name = self.name.clone();
        graph.node = self.nodes.iter().map(node_to_proto).collect();
        graph.initializer = self.initializers.iter().map(initializer_to_proto).collect();
        graph.input = self.inputs.iter().map(value_info_to_proto).collect();
        graph.output = self.outputs.iter().map(value_info_to_proto).collect();

        let mut opset = OperatorSetIdProto::new();
        opset.domain = String::new();
        opset.version = self.opset_version;

        let mut model = ModelProto::new();
        model.ir_version = ir_version_for_opset(self.opset_version);
        model.producer_name = PRODUCER_NAME.to_string();
        model.producer_version = env!("CARGO_PKG_VERSION").to_string();
        model.opset_import = vec![opset];
        model.graph = MessageField::some(graph);
        model
    }

    /// Decode a graph from an ONNX model.
    pub fn from_model_proto(model: &ModelProto) -> Result<Self, ArtifactError> {
        let opset_version = model
            .opset_import
            .iter()
            .find(|opset| opset.domain.is_empty() || opset.domain == "ai.onnx")
            .map(|opset| opset.version)
            .ok_or_else(|| {
                ArtifactError::Unsupported("no opset import for the default domain".to_string())
            })?;

        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| ArtifactError::Unsupported("model has no graph".to_string()))?;

        let nodes = graph
            .node
            .iter()
            .map(node_from_proto)
            .collect::<Result<Vec<_>, _>>()?;
        let initializers = graph
            .initializer
            .iter()
            .map(initializer_from_proto)
            .collect::<Result<Vec<_>, _>>()?;

        // ONNX allows initializers to be listed as graph inputs; only real inputs are kept.
        let inputs = graph
            .input
            .iter()
            .filter(|input| !initializers.iter().any(|init| init.name == input.name))
            .map(value_info_from_proto)
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = graph
            .output
            .iter()
            .map(value_info_from_proto)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Graph {
            name: graph.name.clone(),
            opset_version,
            inputs,
            outputs,
            nodes,
            initializers,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        Ok(self.to_model_proto().write_to_bytes()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let model = ModelProto::parse_from_bytes(bytes)?;
        Self::from_model_proto(&model)
    }

    /// Write the artifact, returning its size in bytes.
    ///
    /// The whole message is encoded before the file is touched, so an encoding failure never
    /// leaves a truncated artifact behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<u64, ArtifactError> {
        let bytes = self.to_bytes()?;
        fs::write(path.as_ref(), &bytes)?;
        log::debug!(
            "Wrote {} bytes to {}",
            bytes.len(),
            path.as_ref().display()
        );
        Ok(bytes.len() as u64)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ArtifactError::NotFound(path.to_path_buf()));
        }
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

fn node_to_proto(node: &Node) -> NodeProto {
    let mut proto = NodeProto::new();
    proto.name = node.name.clone();
    proto.op_type = node.node_type.to_string();
    proto.input = node.inputs.clone();
    proto.output = node.outputs.clone();
    proto.attribute = node.attrs.iter().map(attribute_to_proto).collect();
    proto
}

fn node_from_proto(proto: &NodeProto) -> Result<Node, ArtifactError> {
    if !proto.domain.is_empty() && proto.domain != "ai.onnx" {
        return Err(ArtifactError::Unsupported(format!(
            "node '{}' uses operator domain '{}'",
            proto.name, proto.domain
        )));
    }
    let node_type = NodeType::from_str(&proto.op_type).map_err(|_| {
        ArtifactError::Unsupported(format!(
            "operator '{}' (node '{}')",
            proto.op_type, proto.name
        ))
    })?;
    let attrs = proto
        .attribute
        .iter()
        .map(attribute_from_proto)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Node::new(
        node_type,
        proto.name.clone(),
        proto.input.clone(),
        proto.output.clone(),
        attrs,
    ))
}

fn attribute_to_proto(attr: &Attribute) -> AttributeProto {
    let mut proto = AttributeProto::new();
    proto.name = attr.name.clone();
    match &attr.value {
        AttributeValue::Float32(value) => {
            proto.type_ = AttributeType::FLOAT.into();
            proto.f = *value;
        }
        AttributeValue::Int64(value) => {
            proto.type_ = AttributeType::INT.into();
            proto.i = *value;
        }
        AttributeValue::String(value) => {
            proto.type_ = AttributeType::STRING.into();
            proto.s = value.as_bytes().to_vec();
        }
        AttributeValue::Float32s(values) => {
            proto.type_ = AttributeType::FLOATS.into();
            proto.floats = values.clone();
        }
        AttributeValue::Int64s(values) => {
            proto.type_ = AttributeType::INTS.into();
            proto.ints = values.clone();
        }
    }
    proto
}

fn attribute_from_proto(proto: &AttributeProto) -> Result<Attribute, ArtifactError> {
    let ty = proto.type_.enum_value().map_err(|value| {
        ArtifactError::Unsupported(format!(
            "attribute '{}' has unknown type {value}",
            proto.name
        ))
    })?;
    let value = match ty {
        AttributeType::FLOAT => AttributeValue::Float32(proto.f),
        AttributeType::INT => AttributeValue::Int64(proto.i),
        AttributeType::STRING => AttributeValue::String(
            String::from_utf8(proto.s.clone()).map_err(|_| {
                ArtifactError::Unsupported(format!("attribute '{}' is not utf-8", proto.name))
            })?,
        ),
        AttributeType::FLOATS => AttributeValue::Float32s(proto.floats.clone()),
        AttributeType::INTS => AttributeValue::Int64s(proto.ints.clone()),
        other => {
            return Err(ArtifactError::Unsupported(format!(
                "attribute '{}' of type {other:?}",
                proto.name
            )))
        }
    };
    Ok(Attribute::new(proto.name.clone(), value))
}

fn initializer_to_proto(init: &Initializer) -> TensorProto {
    let mut proto = TensorProto::new();
    proto.name = init.name.clone();
    proto.dims = init.shape.iter().map(|dim| *dim as i64).collect();
    proto.data_type = DT::FLOAT.value();
    proto.raw_data = init.data.iter().flat_map(|v| v.to_le_bytes()).collect();
    proto
}

fn initializer_from_proto(proto: &TensorProto) -> Result<Initializer, ArtifactError> {
    if proto.data_type != DT::FLOAT.value() {
        return Err(ArtifactError::Unsupported(format!(
            "initializer '{}' has data type {}, only FLOAT is supported",
            proto.name, proto.data_type
        )));
    }
    let shape = dims_to_shape(&proto.name, &proto.dims)?;

    let data = if !proto.raw_data.is_empty() {
        if proto.raw_data.len() % 4 != 0 {
            return Err(ArtifactError::Unsupported(format!(
                "initializer '{}' raw data is not a multiple of 4 bytes",
                proto.name
            )));
        }
        proto
            .raw_data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    } else {
        proto.float_data.clone()
    };

    Ok(Initializer::new(proto.name.clone(), shape, data))
}

fn value_info_to_proto(info: &ValueInfo) -> ValueInfoProto {
    let mut shape = TensorShapeProto::new();
    shape.dim = info
        .shape
        .iter()
        .map(|dim| {
            let mut dimension = tensor_shape_proto::Dimension::new();
            dimension.value = Some(DimValue::DimValue(*dim as i64));
            dimension
        })
        .collect();

    let mut tensor = type_proto::Tensor::new();
    tensor.elem_type = DT::FLOAT.value();
    tensor.shape = MessageField::some(shape);

    let mut ty = TypeProto::new();
    ty.value = Some(type_proto::Value::TensorType(tensor));

    let mut proto = ValueInfoProto::new();
    proto.name = info.name.clone();
    proto.type_ = MessageField::some(ty);
    proto
}

fn value_info_from_proto(proto: &ValueInfoProto) -> Result<ValueInfo, ArtifactError> {
    let tensor = match proto.type_.as_ref().and_then(|ty| ty.value.as_ref()) {
        Some(type_proto::Value::TensorType(tensor)) => tensor,
        _ => {
            return Err(ArtifactError::Unsupported(format!(
                "value '{}' is not a tensor",
                proto.name
            )))
        }
    };
    if tensor.elem_type != DT::FLOAT.value() {
        return Err(ArtifactError::Unsupported(format!(
            "value '{}' has element type {}, only FLOAT is supported",
            proto.name, tensor.elem_type
        )));
    }

    let dims = match tensor.shape.as_ref() {
        Some(shape) => shape
            .dim
            .iter()
            .map(|dim| match &dim.value {
                Some(DimValue::DimValue(value)) => Ok(*value),
                Some(DimValue::DimParam(param)) => Err(ArtifactError::Unsupported(format!(
                    "value '{}' has symbolic dimension '{param}'",
                    proto.name
                ))),
                None => Err(ArtifactError::Unsupported(format!(
                    "value '{}' has an unknown dimension",
                    proto.name
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    Ok(ValueInfo::new(
        proto.name.clone(),
        dims_to_shape(&proto.name, &dims)?,
    ))
}

fn dims_to_shape(name: &str, dims: &[i64]) -> Result<Shape, ArtifactError> {
    dims.iter()
        .map(|dim| {
            usize::try_from(*dim).map_err(|_| {
                ArtifactError::Unsupported(format!("'{name}' has negative dimension {dim}"))
            })
        })
        .collect()
}
