//! Writes parameter maps in the zip layout of `torch.save`, so that every layout the loader
//! understands can be produced without a Python installation.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use super::{CheckpointError, CheckpointLayout, ParamTensor, ParameterMap};

const ARCHIVE_ROOT: &str = "archive";
const BUFFER_NAMES: [&str; 3] = ["running_mean", "running_var", "num_batches_tracked"];
const ROOT_CLASS: (&str, &str) = ("__main__", "DnCNN");
const CHILD_CLASS: (&str, &str) = ("torch.nn.modules.module", "Module");

/// Save `params` as a checkpoint with the requested layout.
///
/// Entries whose name ends in `num_batches_tracked` are stored as 64-bit integers, everything
/// else as 32-bit floats. Returns the number of bytes written.
pub fn save(
    path: impl AsRef<Path>,
    params: &ParameterMap,
    layout: &CheckpointLayout,
) -> Result<u64, CheckpointError> {
    let mut pickler = Pickler::default();
    pickler.proto();
    match layout {
        CheckpointLayout::BareMapping => pickler.state_dict(params),
        CheckpointLayout::WrappedMapping { key } => {
            pickler.empty_dict();
            pickler.mark();
            pickler.unicode("epoch");
            pickler.int(0);
            pickler.unicode(key);
            pickler.state_dict(params);
            pickler.op(b'u');
        }
        CheckpointLayout::FullInstance { class } => {
            let (module, name) = class.rsplit_once('.').unwrap_or(ROOT_CLASS);
            let tree = ModuleTree::from_params(params);
            pickler.module(&tree, (module, name));
        }
    }
    pickler.op(b'.');

    let path = path.as_ref();
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);

    zip.start_file(format!("{ARCHIVE_ROOT}/data.pkl"), stored())?;
    zip.write_all(&pickler.buffer)?;
    zip.start_file(format!("{ARCHIVE_ROOT}/byteorder"), stored())?;
    zip.write_all(b"little")?;
    for (key, bytes) in pickler.storages.iter() {
        zip.start_file(format!("{ARCHIVE_ROOT}/data/{key}"), stored())?;
        zip.write_all(bytes)?;
    }
    zip.start_file(format!("{ARCHIVE_ROOT}/version"), stored())?;
    zip.write_all(b"3\n")?;
    zip.finish()?;

    let size = std::fs::metadata(path)?.len();
    log::debug!(
        "Wrote {} tensors ({}) to {} ({} bytes)",
        params.len(),
        layout,
        path.display(),
        size
    );
    Ok(size)
}

// torch.save does not compress records.
fn stored() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
}

fn is_integer_buffer(key: &str) -> bool {
    key.ends_with("num_batches_tracked")
}

/// Parameters grouped into the module hierarchy implied by their dotted names.
#[derive(Debug, Default)]
struct ModuleTree<'a> {
    parameters: Vec<(&'a str, &'a str, &'a ParamTensor)>,
    buffers: Vec<(&'a str, &'a str, &'a ParamTensor)>,
    children: Vec<(&'a str, ModuleTree<'a>)>,
}

impl<'a> ModuleTree<'a> {
    fn from_params(params: &'a ParameterMap) -> Self {
        let mut root = ModuleTree::default();
        for (key, tensor) in params.iter() {
            let mut node = &mut root;
            let mut segments: Vec<&str> = key.split('.').collect();
            let name = segments.pop().unwrap_or(key);
            for segment in segments {
                node = node.child(segment);
            }
            if BUFFER_NAMES.contains(&name) {
                node.buffers.push((name, key, tensor));
            } else {
                node.parameters.push((name, key, tensor));
            }
        }
        root
    }

    fn child(&mut self, name: &'a str) -> &mut ModuleTree<'a> {
        let position = match self.children.iter().position(|(child, _)| *child == name) {
            Some(position) => position,
            None => {
                self.children.push((name, ModuleTree::default()));
                self.children.len() - 1
            }
        };
        &mut self.children[position].1
    }
}

/// A minimal protocol 2 pickler. Nothing is memoized, every object is written in full.
#[derive(Default)]
struct Pickler {
    buffer: Vec<u8>,
    storages: Vec<(String, Vec<u8>)>,
}

impl Pickler {
    fn op(&mut self, op: u8) {
        self.buffer.push(op);
    }

    fn proto(&mut self) {
        self.buffer.extend_from_slice(&[0x80, 2]);
    }

    fn mark(&mut self) {
        self.op(b'(');
    }

    fn empty_dict(&mut self) {
        self.op(b'}');
    }

    fn global(&mut self, module: &str, name: &str) {
        self.op(b'c');
        self.buffer.extend_from_slice(module.as_bytes());
        self.buffer.push(b'\n');
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.push(b'\n');
    }

    fn unicode(&mut self, value: &str) {
        self.op(b'X');
        self.buffer
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buffer.extend_from_slice(value.as_bytes());
    }

    fn int(&mut self, value: i64) {
        match value {
            0..=0xff => {
                self.op(b'K');
                self.buffer.push(value as u8);
            }
            v if i32::try_from(v).is_ok() => {
                self.op(b'J');
                self.buffer.extend_from_slice(&(value as i32).to_le_bytes());
            }
            _ => {
                self.op(0x8a);
                self.buffer.push(8);
                self.buffer.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    fn int_tuple(&mut self, values: &[usize]) {
        self.mark();
        for value in values {
            self.int(*value as i64);
        }
        self.op(b't');
    }

    fn ordered_dict(&mut self) {
        self.global("collections", "OrderedDict");
        self.op(b')');
        self.op(b'R');
    }

    fn tensor(&mut self, key: &str, tensor: &ParamTensor) {
        let storage_key = self.storages.len().to_string();
        let integer = is_integer_buffer(key);
        let bytes = encode_storage(tensor, integer);
        self.storages.push((storage_key.clone(), bytes));

        let mut stride = vec![1usize; tensor.shape.len()];
        for dim in (0..tensor.shape.len().saturating_sub(1)).rev() {
            stride[dim] = stride[dim + 1] * tensor.shape[dim + 1];
        }

        self.global("torch._utils", "_rebuild_tensor_v2");
        self.mark();
        // ('storage', storage_type, key, location, numel)
        self.mark();
        self.unicode("storage");
        self.global(
            "torch",
            if integer { "LongStorage" } else { "FloatStorage" },
        );
        self.unicode(&storage_key);
        self.unicode("cpu");
        self.int(tensor.values.len() as i64);
        self.op(b't');
        self.op(b'Q');
        self.int(0);
        self.int_tuple(&tensor.shape);
        self.int_tuple(&stride);
        self.op(0x89);
        self.ordered_dict();
        self.op(b't');
        self.op(b'R');
    }

    fn parameter(&mut self, key: &str, tensor: &ParamTensor) {
        self.global("torch._utils", "_rebuild_parameter");
        self.mark();
        self.tensor(key, tensor);
        self.op(0x88);
        self.ordered_dict();
        self.op(b't');
        self.op(b'R');
    }

    fn state_dict(&mut self, params: &ParameterMap) {
        self.ordered_dict();
        self.mark();
        for (key, tensor) in params.iter() {
            self.unicode(key);
            self.tensor(key, tensor);
        }
        self.op(b'u');

        // `state_dict()` stores the version of every module in the `_metadata` attribute.
        self.empty_dict();
        self.unicode("_metadata");
        self.ordered_dict();
        self.mark();
        for (prefix, version) in module_versions(params) {
            self.unicode(&prefix);
            self.empty_dict();
            self.unicode("version");
            self.int(version);
            self.op(b's');
        }
        self.op(b'u');
        self.op(b's');
        self.op(b'b');
    }

    fn module(&mut self, tree: &ModuleTree<'_>, (module, name): (&str, &str)) {
        self.global(module, name);
        self.op(b')');
        self.op(0x81);

        self.empty_dict();
        self.mark();
        self.unicode("training");
        self.op(0x89);

        self.unicode("_parameters");
        self.ordered_dict();
        self.mark();
        for (name, key, tensor) in tree.parameters.iter() {
            self.unicode(name);
            self.parameter(key, tensor);
        }
        self.op(b'u');

        self.unicode("_buffers");
        self.ordered_dict();
        self.mark();
        for (name, key, tensor) in tree.buffers.iter() {
            self.unicode(name);
            self.tensor(key, tensor);
        }
        self.op(b'u');

        self.unicode("_modules");
        self.ordered_dict();
        self.mark();
        for (name, child) in tree.children.iter() {
            self.unicode(name);
            self.module(child, CHILD_CLASS);
        }
        self.op(b'u');

        self.op(b'u');
        self.op(b'b');
    }
}

/// Every module prefix implied by the parameter names, with its `_version`.
fn module_versions(params: &ParameterMap) -> Vec<(String, i64)> {
    let mut versions = vec![(String::new(), 1)];
    for key in params.keys() {
        let Some((module, field)) = key.rsplit_once('.') else {
            continue;
        };
        let mut prefix = String::new();
        for segment in module.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);
            if !versions.iter().any(|(name, _)| *name == prefix) {
                versions.push((prefix.clone(), 1));
            }
        }
        // Batch norm modules are at version 2.
        if BUFFER_NAMES.contains(&field) {
            if let Some(entry) = versions.iter_mut().find(|(name, _)| name == module) {
                entry.1 = 2;
            }
        }
    }
    versions
}

fn encode_storage(tensor: &ParamTensor, integer: bool) -> Vec<u8> {
    let width = if integer { 8 } else { 4 };
    let mut bytes = Vec::with_capacity(tensor.values.len() * width);
    for value in tensor.values.iter() {
        if integer {
            bytes.extend_from_slice(&(*value as i64).to_le_bytes());
        } else {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::load;

    fn sample() -> ParameterMap {
        [
            ("dncnn.0.weight", ParamTensor::new(vec![2, 1, 1, 1], vec![0.5, -1.5])),
            ("dncnn.0.bias", ParamTensor::new(vec![2], vec![0.25, 0.0])),
            ("dncnn.1.running_mean", ParamTensor::new(vec![2], vec![1.0, 2.0])),
            ("dncnn.1.num_batches_tracked", ParamTensor::new(vec![], vec![300.0])),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn every_layout_loads_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let layouts = [
            CheckpointLayout::BareMapping,
            CheckpointLayout::WrappedMapping {
                key: "state_dict".into(),
            },
            CheckpointLayout::FullInstance {
                class: "__main__.DnCNN".into(),
            },
        ];

        for (i, layout) in layouts.into_iter().enumerate() {
            let path = dir.path().join(format!("{i}.pth"));
            save(&path, &sample(), &layout).unwrap();

            let checkpoint = load(&path).unwrap();

            assert_eq!(checkpoint.layout, layout);
            assert_eq!(checkpoint.params, sample());
        }
    }

    #[test]
    fn module_tree_follows_dotted_names() {
        let params = sample();
        let tree = ModuleTree::from_params(&params);

        assert!(tree.parameters.is_empty());
        let (name, dncnn) = &tree.children[0];
        assert_eq!(*name, "dncnn");
        let names: Vec<_> = dncnn.children.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, ["0", "1"]);
        assert_eq!(dncnn.children[1].1.buffers.len(), 2);
    }

    #[test]
    fn state_dicts_carry_module_metadata() {
        let versions = module_versions(&sample());

        assert_eq!(
            versions,
            [
                (String::new(), 1),
                ("dncnn".to_string(), 1),
                ("dncnn.0".to_string(), 1),
                ("dncnn.1".to_string(), 2),
            ]
        );

        let mut pickler = Pickler::default();
        pickler.state_dict(&sample());
        assert!(pickler.buffer.windows(9).any(|window| window == b"_metadata"));
        assert_eq!(pickler.buffer.last(), Some(&b'b'));
    }

    #[test]
    fn large_ints_use_wider_opcodes() {
        let mut pickler = Pickler::default();
        pickler.int(7);
        pickler.int(70_000);
        pickler.int(1 << 40);

        assert_eq!(pickler.buffer[0], b'K');
        assert_eq!(pickler.buffer[2], b'J');
        assert_eq!(pickler.buffer[7], 0x8a);
    }
}
