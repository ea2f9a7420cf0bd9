//! Reading (and writing) PyTorch checkpoints.
//!
//! `torch.save` is used in three different ways for a trained denoiser: the whole `nn.Module`
//! is pickled, its `state_dict()` is wrapped in a training dictionary, or the bare
//! `state_dict()` is saved. [`load`] accepts all three and reports which one it found.

mod archive;
mod pickle;
mod writer;

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub use archive::TorchArchive;
pub use pickle::{Object, PickleError};
pub use writer::save;

/// Key under which training scripts store the state dict of a wrapped checkpoint.
pub const STATE_DICT_KEY: &str = "state_dict";

const MODULE_STATE_KEYS: [&str; 3] = ["_parameters", "_buffers", "_modules"];

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unknown checkpoint format: {0}")]
    UnknownFormat(String),

    #[error("unsupported checkpoint encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("failed to unpickle checkpoint: {0}")]
    Pickle(#[from] PickleError),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A dense tensor with its values converted to `f32`.
#[derive(new, Debug, Clone, PartialEq)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParamTensor {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self::new(shape, vec![0.0; len])
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Parameter names mapped to tensors, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterMap {
    entries: Vec<(String, ParamTensor)>,
    index: HashMap<String, usize>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor; an existing key keeps its position and gets the new tensor.
    pub fn insert(&mut self, key: impl Into<String>, tensor: ParamTensor) -> Option<ParamTensor> {
        let key = key.into();
        match self.index.get(&key) {
            Some(&position) => Some(std::mem::replace(&mut self.entries[position].1, tensor)),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, tensor));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamTensor> {
        self.index.get(key).map(|&position| &self.entries[position].1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamTensor)> {
        self.entries.iter().map(|(key, tensor)| (key.as_str(), tensor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of scalar values over all tensors.
    pub fn num_values(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, tensor)| tensor.values.len())
            .sum()
    }
}

impl<K: Into<String>> FromIterator<(K, ParamTensor)> for ParameterMap {
    fn from_iter<T: IntoIterator<Item = (K, ParamTensor)>>(iter: T) -> Self {
        let mut map = ParameterMap::new();
        for (key, tensor) in iter {
            map.insert(key, tensor);
        }
        map
    }
}

impl IntoIterator for ParameterMap {
    type Item = (String, ParamTensor);
    type IntoIter = std::vec::IntoIter<(String, ParamTensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// How the parameters were laid out in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointLayout {
    /// A pickled `nn.Module` instance.
    FullInstance { class: String },
    /// A dictionary holding the state dict under `key`.
    WrappedMapping { key: String },
    /// The state dict itself.
    BareMapping,
}

impl fmt::Display for CheckpointLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointLayout::FullInstance { class } => write!(f, "full instance of {class}"),
            CheckpointLayout::WrappedMapping { key } => write!(f, "mapping wrapped under '{key}'"),
            CheckpointLayout::BareMapping => write!(f, "bare mapping"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub layout: CheckpointLayout,
    pub params: ParameterMap,
}

/// Load a checkpoint file and extract its parameter map.
pub fn load(path: impl AsRef<Path>) -> Result<Checkpoint, CheckpointError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }

    let archive = TorchArchive::open(path)?;
    let object = pickle::read_pickle(&mut Cursor::new(&archive.pickle), &archive.storages)?;
    let (layout, params) = classify(object)?;

    log::info!(
        "Loaded {} ({}): {} tensors, {} values",
        path.display(),
        layout,
        params.len(),
        params.num_values()
    );
    log::debug!(
        "First keys: {:?}",
        params.keys().take(5).collect::<Vec<_>>()
    );

    Ok(Checkpoint { layout, params })
}

/// Decide which layout `object` uses and extract its parameters.
///
/// The order of the checks matters: an object instance carrying module state always wins, then a
/// mapping that wraps a state dict, then a mapping of tensors. Everything else is rejected.
pub fn classify(object: Object) -> Result<(CheckpointLayout, ParameterMap), CheckpointError> {
    if let Object::Instance { class, state } = &object {
        if has_module_state(state) {
            let mut params = ParameterMap::new();
            collect_module(state, "", &mut params);
            let layout = CheckpointLayout::FullInstance {
                class: class.clone(),
            };
            return Ok((layout, params));
        }
        return Err(CheckpointError::UnknownFormat(format!(
            "{} without module state",
            object.kind()
        )));
    }

    let entries = match object {
        Object::Dict(entries) => entries,
        other => return Err(CheckpointError::UnknownFormat(other.kind())),
    };

    if let Some((_, Object::Dict(nested))) = entries.iter().find(|(key, _)| key == STATE_DICT_KEY)
    {
        let params = tensor_mapping(nested)?;
        let layout = CheckpointLayout::WrappedMapping {
            key: STATE_DICT_KEY.to_string(),
        };
        return Ok((layout, params));
    }

    Ok((CheckpointLayout::BareMapping, tensor_mapping(&entries)?))
}

fn has_module_state(state: &Object) -> bool {
    MODULE_STATE_KEYS
        .iter()
        .any(|key| state.get(key).is_some())
}

fn tensor_mapping(entries: &[(String, Object)]) -> Result<ParameterMap, CheckpointError> {
    let mut params = ParameterMap::new();
    for (key, value) in entries {
        match value {
            Object::Tensor(tensor) => {
                params.insert(key.clone(), tensor.clone());
            }
            other => {
                return Err(CheckpointError::UnknownFormat(format!(
                    "mapping with non-tensor entry '{key}' ({})",
                    other.kind()
                )))
            }
        }
    }
    Ok(params)
}

/// Walk a pickled module like `state_dict()` does: parameters, buffers, then children.
fn collect_module(state: &Object, prefix: &str, params: &mut ParameterMap) {
    for group in ["_parameters", "_buffers"] {
        if let Some(Object::Dict(entries)) = state.get(group) {
            for (name, value) in entries {
                if let Object::Tensor(tensor) = value {
                    params.insert(format!("{prefix}{name}"), tensor.clone());
                }
            }
        }
    }

    if let Some(Object::Dict(children)) = state.get("_modules") {
        for (name, child) in children {
            if let Object::Instance { state, .. } = child {
                collect_module(state, &format!("{prefix}{name}."), params);
            }
        }
    }
}
