//! Just enough pickle support to read what `torch.save` writes.
//!
//! Tensors are rebuilt eagerly while unpickling: `torch._utils._rebuild_tensor_v2` calls are
//! resolved against the raw storages of the archive and converted to `f32`. Any other class
//! reference becomes an [`Object::Instance`] whose state is filled in by `BUILD`, which is how a
//! pickled `nn.Module` keeps its `_parameters`, `_buffers` and `_modules`.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufRead};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use half::{bf16, f16};

use super::ParamTensor;

#[derive(Debug, thiserror::Error)]
pub enum PickleError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid pickle opcode 0x{0:02x}")]
    InvalidOpCode(u8),

    #[error("unsupported pickle protocol {0}, supported versions are 2-5")]
    InvalidProtocol(u8),

    #[error("unexpected opcode {0:?} in current context")]
    UnexpectedOpCode(OpCode),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("pickle stack underflow")]
    StackUnderflow,

    #[error("memo reference {0} not found")]
    MemoNotFound(u32),

    #[error("storage '{0}' is not present in the archive")]
    MissingStorage(String),

    #[error("unsupported storage type '{0}'")]
    UnsupportedStorage(String),
}

type Result<T> = std::result::Result<T, PickleError>;

// https://github.com/python/cpython/blob/main/Lib/pickletools.py
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum OpCode {
    Proto = 0x80,
    Frame = 0x95,
    Stop = b'.',
    Mark = b'(',
    Pop = b'0',
    PopMark = b'1',
    Dup = b'2',
    Global = b'c',
    StackGlobal = 0x93,
    EmptyDict = b'}',
    EmptyList = b']',
    EmptyTuple = b')',
    Tuple = b't',
    Tuple1 = 0x85,
    Tuple2 = 0x86,
    Tuple3 = 0x87,
    List = b'l',
    Dict = b'd',
    Append = b'a',
    Appends = b'e',
    SetItem = b's',
    SetItems = b'u',
    BinInt = b'J',
    BinInt1 = b'K',
    BinInt2 = b'M',
    Long1 = 0x8a,
    None = b'N',
    NewTrue = 0x88,
    NewFalse = 0x89,
    BinFloat = b'G',
    BinUnicode = b'X',
    ShortBinUnicode = 0x8c,
    BinString = b'T',
    ShortBinString = b'U',
    BinPut = b'q',
    LongBinPut = b'r',
    BinGet = b'h',
    LongBinGet = b'j',
    Memoize = 0x94,
    Reduce = b'R',
    Build = b'b',
    NewObj = 0x81,
    BinPersId = b'Q',
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        let op = match value {
            0x80 => Self::Proto,
            0x95 => Self::Frame,
            b'.' => Self::Stop,
            b'(' => Self::Mark,
            b'0' => Self::Pop,
            b'1' => Self::PopMark,
            b'2' => Self::Dup,
            b'c' => Self::Global,
            0x93 => Self::StackGlobal,
            b'}' => Self::EmptyDict,
            b']' => Self::EmptyList,
            b')' => Self::EmptyTuple,
            b't' => Self::Tuple,
            0x85 => Self::Tuple1,
            0x86 => Self::Tuple2,
            0x87 => Self::Tuple3,
            b'l' => Self::List,
            b'd' => Self::Dict,
            b'a' => Self::Append,
            b'e' => Self::Appends,
            b's' => Self::SetItem,
            b'u' => Self::SetItems,
            b'J' => Self::BinInt,
            b'K' => Self::BinInt1,
            b'M' => Self::BinInt2,
            0x8a => Self::Long1,
            b'N' => Self::None,
            0x88 => Self::NewTrue,
            0x89 => Self::NewFalse,
            b'G' => Self::BinFloat,
            b'X' => Self::BinUnicode,
            0x8c => Self::ShortBinUnicode,
            b'T' => Self::BinString,
            b'U' => Self::ShortBinString,
            b'q' => Self::BinPut,
            b'r' => Self::LongBinPut,
            b'h' => Self::BinGet,
            b'j' => Self::LongBinGet,
            0x94 => Self::Memoize,
            b'R' => Self::Reduce,
            b'b' => Self::Build,
            0x81 => Self::NewObj,
            b'Q' => Self::BinPersId,
            value => return Err(value),
        };
        Ok(op)
    }
}

/// A Python value as far as checkpoints are concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Mark,
    Class {
        module_name: String,
        name: String,
    },
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    Tuple(Vec<Object>),
    List(Vec<Object>),
    /// Keys are kept in insertion order, like a Python dict.
    Dict(Vec<(String, Object)>),
    Persistent(Vec<Object>),
    Tensor(ParamTensor),
    Instance {
        class: String,
        state: Box<Object>,
    },
}

impl Object {
    /// Short description of the value's kind, used in diagnostics.
    pub fn kind(&self) -> String {
        match self {
            Object::Mark => "mark".to_string(),
            Object::Class { module_name, name } => format!("class {module_name}.{name}"),
            Object::String(_) => "str".to_string(),
            Object::Int(_) => "int".to_string(),
            Object::Float(_) => "float".to_string(),
            Object::Bool(_) => "bool".to_string(),
            Object::None => "None".to_string(),
            Object::Tuple(_) => "tuple".to_string(),
            Object::List(_) => "list".to_string(),
            Object::Dict(_) => "mapping".to_string(),
            Object::Persistent(_) => "persistent id".to_string(),
            Object::Tensor(_) => "tensor".to_string(),
            Object::Instance { class, .. } => format!("instance of {class}"),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Object> {
        match self {
            Object::Dict(entries) => entries
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value),
            _ => None,
        }
    }
}

fn dict_insert(entries: &mut Vec<(String, Object)>, key: Object, value: Object) -> Result<()> {
    let key = match key {
        Object::String(key) => key,
        Object::Int(key) => key.to_string(),
        other => {
            return Err(PickleError::InvalidData(format!(
                "dict keys must be strings or ints, got {}",
                other.kind()
            )))
        }
    };
    match entries.iter_mut().find(|(name, _)| *name == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key, value)),
    }
    Ok(())
}

/// Element types of `torch.*Storage` classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

impl StorageType {
    fn from_class(name: &str) -> Option<Self> {
        let storage_type = match name {
            "DoubleStorage" => Self::F64,
            "FloatStorage" => Self::F32,
            "HalfStorage" => Self::F16,
            "BFloat16Storage" => Self::BF16,
            "LongStorage" => Self::I64,
            "IntStorage" => Self::I32,
            "ShortStorage" => Self::I16,
            "CharStorage" => Self::I8,
            "ByteStorage" => Self::U8,
            "BoolStorage" => Self::Bool,
            _ => return None,
        };
        Some(storage_type)
    }

    fn size(&self) -> usize {
        match self {
            Self::F64 | Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 | Self::I16 => 2,
            Self::I8 | Self::U8 | Self::Bool => 1,
        }
    }

    fn read(&self, mut bytes: &[u8]) -> io::Result<f32> {
        let value = match self {
            Self::F64 => bytes.read_f64::<LittleEndian>()? as f32,
            Self::F32 => bytes.read_f32::<LittleEndian>()?,
            Self::F16 => f16::from_bits(bytes.read_u16::<LittleEndian>()?).to_f32(),
            Self::BF16 => bf16::from_bits(bytes.read_u16::<LittleEndian>()?).to_f32(),
            Self::I64 => bytes.read_i64::<LittleEndian>()? as f32,
            Self::I32 => bytes.read_i32::<LittleEndian>()? as f32,
            Self::I16 => bytes.read_i16::<LittleEndian>()? as f32,
            Self::I8 => bytes.read_i8()? as f32,
            Self::U8 => bytes.read_u8()? as f32,
            Self::Bool => (bytes.read_u8()? != 0) as u8 as f32,
        };
        Ok(value)
    }
}

fn as_usize(object: &Object, what: &str) -> Result<usize> {
    match object {
        Object::Int(value) if *value >= 0 => Ok(*value as usize),
        other => Err(PickleError::InvalidData(format!(
            "{what} must be a non-negative int, got {other:?}"
        ))),
    }
}

fn as_usizes(object: &Object, what: &str) -> Result<Vec<usize>> {
    match object {
        Object::Tuple(values) | Object::List(values) => {
            values.iter().map(|value| as_usize(value, what)).collect()
        }
        other => Err(PickleError::InvalidData(format!(
            "{what} must be a tuple, got {}",
            other.kind()
        ))),
    }
}

/// `torch._utils._rebuild_tensor_v2(storage, offset, size, stride, requires_grad, hooks, ...)`
fn rebuild_tensor_v2(args: Vec<Object>, storages: &HashMap<String, Vec<u8>>) -> Result<Object> {
    if args.len() < 4 {
        return Err(PickleError::InvalidData(format!(
            "rebuild_tensor_v2: expected at least 4 args, got {}",
            args.len()
        )));
    }

    // ('storage', storage_type, key, location, numel)
    let pid = match &args[0] {
        Object::Persistent(pid) if pid.len() >= 3 => pid,
        other => {
            return Err(PickleError::InvalidData(format!(
                "rebuild_tensor_v2: expected a storage persistent id, got {other:?}"
            )))
        }
    };
    let storage_class = match &pid[1] {
        Object::Class { name, .. } => name.as_str(),
        Object::String(name) => name.as_str(),
        other => {
            return Err(PickleError::InvalidData(format!(
                "rebuild_tensor_v2: invalid storage type {other:?}"
            )))
        }
    };
    let storage_type = StorageType::from_class(storage_class)
        .ok_or_else(|| PickleError::UnsupportedStorage(storage_class.to_string()))?;
    let key = match &pid[2] {
        Object::String(key) => key.clone(),
        other => {
            return Err(PickleError::InvalidData(format!(
                "rebuild_tensor_v2: invalid storage key {other:?}"
            )))
        }
    };
    let storage = storages
        .get(&key)
        .ok_or_else(|| PickleError::MissingStorage(key.clone()))?;

    let offset = as_usize(&args[1], "storage offset")?;
    let shape = as_usizes(&args[2], "tensor size")?;
    let stride = as_usizes(&args[3], "tensor stride")?;
    if stride.len() != shape.len() {
        return Err(PickleError::InvalidData(format!(
            "rebuild_tensor_v2: size {shape:?} and stride {stride:?} differ in rank"
        )));
    }

    let num_elements: usize = shape.iter().product();
    let element_size = storage_type.size();
    let mut values = Vec::with_capacity(num_elements);
    let mut index = vec![0usize; shape.len()];

    for _ in 0..num_elements {
        let position = offset
            + index
                .iter()
                .zip(stride.iter())
                .map(|(i, s)| i * s)
                .sum::<usize>();
        let start = position * element_size;
        let bytes = storage.get(start..start + element_size).ok_or_else(|| {
            PickleError::InvalidData(format!(
                "storage '{key}' is too small for a tensor of size {shape:?}"
            ))
        })?;
        values.push(storage_type.read(bytes)?);

        // Row-major increment of the multi-index.
        for dim in (0..shape.len()).rev() {
            index[dim] += 1;
            if index[dim] < shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }

    Ok(Object::Tensor(ParamTensor::new(shape, values)))
}

fn reduce(
    callable: Object,
    args: Object,
    storages: &HashMap<String, Vec<u8>>,
) -> Result<Object> {
    let Object::Class { module_name, name } = callable else {
        return Err(PickleError::InvalidData(format!(
            "reduce: expected a class, got {}",
            callable.kind()
        )));
    };
    let args = match args {
        Object::Tuple(args) => args,
        other => {
            return Err(PickleError::InvalidData(format!(
                "reduce {module_name}.{name}: expected tuple args, got {}",
                other.kind()
            )))
        }
    };

    match (module_name.as_str(), name.as_str()) {
        ("collections", "OrderedDict") => Ok(Object::Dict(Vec::new())),
        ("torch._utils", "_rebuild_tensor_v2") => rebuild_tensor_v2(args, storages),
        ("torch._utils", "_rebuild_parameter")
        | ("torch._utils", "_rebuild_parameter_with_state") => {
            match args.into_iter().next() {
                Some(tensor @ Object::Tensor(_)) => Ok(tensor),
                other => Err(PickleError::InvalidData(format!(
                    "rebuild_parameter: expected a tensor, got {other:?}"
                ))),
            }
        }
        // copyreg._reconstructor(cls, base, state) for classic objects.
        ("copyreg", "_reconstructor") => match args.into_iter().next() {
            Some(Object::Class { module_name, name }) => Ok(Object::Instance {
                class: format!("{module_name}.{name}"),
                state: Box::new(Object::None),
            }),
            other => Err(PickleError::InvalidData(format!(
                "reconstructor: expected a class, got {other:?}"
            ))),
        },
        _ => Ok(Object::Instance {
            class: format!("{module_name}.{name}"),
            state: Box::new(Object::Tuple(args)),
        }),
    }
}

/// A memo entry either still lives on the stack, where later `SETITEMS`, `APPENDS` or `BUILD`
/// may fill it in, or holds the value it had when it left the stack.
#[derive(Debug)]
enum Memo {
    Live(usize),
    Value(Object),
}

struct Stack<'a> {
    stack: Vec<Object>,
    memo: HashMap<u32, Memo>,
    /// Memo indices of objects that are still on the stack, by stack position.
    live: BTreeMap<usize, Vec<u32>>,
    storages: &'a HashMap<String, Vec<u8>>,
}

impl<'a> Stack<'a> {
    fn new(storages: &'a HashMap<String, Vec<u8>>) -> Self {
        Self {
            stack: Vec::new(),
            memo: HashMap::new(),
            live: BTreeMap::new(),
            storages,
        }
    }

    fn push(&mut self, o: Object) {
        self.stack.push(o)
    }

    fn pop(&mut self) -> Result<Object> {
        let len = self.stack.len();
        if len == 0 {
            return Err(PickleError::StackUnderflow);
        }
        self.release(len - 1);
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn top(&self) -> Result<Object> {
        self.stack.last().cloned().ok_or(PickleError::StackUnderflow)
    }

    fn last_mut(&mut self) -> Result<&mut Object> {
        self.stack.last_mut().ok_or(PickleError::StackUnderflow)
    }

    fn pop_to_marker(&mut self) -> Result<Vec<Object>> {
        let marker_pos = self
            .stack
            .iter()
            .rposition(|o| matches!(o, Object::Mark))
            .ok_or_else(|| PickleError::InvalidData("marker not found".to_string()))?;
        self.release(marker_pos);
        let result = self.stack.split_off(marker_pos + 1);
        self.stack.pop();
        Ok(result)
    }

    /// Freeze the memo entries of every stack position from `from` on, before they are popped.
    ///
    /// A memoized container that is mutated through a memo reference after it left the stack
    /// is not tracked: `torch.save` never produces that.
    fn release(&mut self, from: usize) {
        let released = self.live.split_off(&from);
        for (position, indices) in released {
            let Some(object) = self.stack.get(position) else {
                continue;
            };
            for idx in indices {
                self.memo.insert(idx, Memo::Value(object.clone()));
            }
        }
    }

    fn memo_get(&self, idx: u32) -> Result<Object> {
        let object = match self.memo.get(&idx) {
            Some(Memo::Live(position)) => self.stack.get(*position).cloned(),
            Some(Memo::Value(object)) => Some(object.clone()),
            None => None,
        };
        object.ok_or(PickleError::MemoNotFound(idx))
    }

    fn memo_put(&mut self, idx: u32) -> Result<()> {
        let position = self
            .stack
            .len()
            .checked_sub(1)
            .ok_or(PickleError::StackUnderflow)?;
        if let Some(Memo::Live(previous)) = self.memo.insert(idx, Memo::Live(position)) {
            if let Some(indices) = self.live.get_mut(&previous) {
                indices.retain(|i| *i != idx);
            }
        }
        self.live.entry(position).or_default().push(idx);
        Ok(())
    }

    fn set_items(&mut self, items: Vec<Object>, op_code: OpCode) -> Result<()> {
        if items.len() % 2 != 0 {
            return Err(PickleError::InvalidData(
                "setitems requires an even number of objects".to_string(),
            ));
        }
        let Object::Dict(entries) = self.last_mut()? else {
            return Err(PickleError::UnexpectedOpCode(op_code));
        };
        let mut items = items.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            dict_insert(entries, key, value)?;
        }
        Ok(())
    }
}

fn read_to_newline<R: BufRead>(r: &mut R) -> Result<String> {
    let mut data: Vec<u8> = Vec::with_capacity(32);
    r.read_until(b'\n', &mut data)?;
    data.pop();
    if data.last() == Some(&b'\r') {
        data.pop();
    }
    buf_to_str(data)
}

fn buf_to_str(buf: Vec<u8>) -> Result<String> {
    String::from_utf8(buf).map_err(|e| PickleError::InvalidData(format!("invalid UTF-8: {e}")))
}

fn read_string<R: BufRead>(r: &mut R, len: usize) -> Result<Object> {
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(Object::String(buf_to_str(data)?))
}

fn read_long1<R: BufRead>(r: &mut R) -> Result<Object> {
    let len = r.read_u8()? as usize;
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    if len > 8 {
        return Err(PickleError::InvalidData(format!(
            "LONG1 of {len} bytes does not fit in 64 bits"
        )));
    }
    let mut value = 0i64;
    for (i, byte) in data.iter().enumerate() {
        value |= (*byte as i64) << (i * 8);
    }
    if len > 0 && len < 8 && data[len - 1] & 0x80 != 0 {
        value |= -1i64 << (len * 8);
    }
    Ok(Object::Int(value))
}

/// Unpickle `r`, resolving tensor storages against `storages` (keyed by storage name).
pub fn read_pickle<R: BufRead>(r: &mut R, storages: &HashMap<String, Vec<u8>>) -> Result<Object> {
    let mut stack = Stack::new(storages);

    loop {
        let op_code = r.read_u8()?;
        let op_code = OpCode::try_from(op_code).map_err(PickleError::InvalidOpCode)?;
        match op_code {
            OpCode::Proto => {
                let version = r.read_u8()?;
                if !(2..=5).contains(&version) {
                    return Err(PickleError::InvalidProtocol(version));
                }
            }
            OpCode::Frame => {
                // Frames only delimit the stream, their content is read as usual.
                r.read_u64::<LittleEndian>()?;
            }
            OpCode::Stop => break,
            OpCode::Mark => stack.push(Object::Mark),
            OpCode::Pop => {
                stack.pop()?;
            }
            OpCode::PopMark => {
                stack.pop_to_marker()?;
            }
            OpCode::Dup => {
                let top = stack.top()?;
                stack.push(top);
            }
            OpCode::Global => {
                let module_name = read_to_newline(r)?;
                let name = read_to_newline(r)?;
                stack.push(Object::Class { module_name, name });
            }
            OpCode::StackGlobal => {
                let name = stack.pop()?;
                let module_name = stack.pop()?;
                match (module_name, name) {
                    (Object::String(module_name), Object::String(name)) => {
                        stack.push(Object::Class { module_name, name })
                    }
                    _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                }
            }
            OpCode::EmptyDict => stack.push(Object::Dict(Vec::new())),
            OpCode::EmptyList => stack.push(Object::List(Vec::new())),
            OpCode::EmptyTuple => stack.push(Object::Tuple(Vec::new())),
            OpCode::Tuple => {
                let objs = stack.pop_to_marker()?;
                stack.push(Object::Tuple(objs));
            }
            OpCode::Tuple1 => {
                let obj = stack.pop()?;
                stack.push(Object::Tuple(vec![obj]));
            }
            OpCode::Tuple2 => {
                let obj2 = stack.pop()?;
                let obj1 = stack.pop()?;
                stack.push(Object::Tuple(vec![obj1, obj2]));
            }
            OpCode::Tuple3 => {
                let obj3 = stack.pop()?;
                let obj2 = stack.pop()?;
                let obj1 = stack.pop()?;
                stack.push(Object::Tuple(vec![obj1, obj2, obj3]));
            }
            OpCode::List => {
                let objs = stack.pop_to_marker()?;
                stack.push(Object::List(objs));
            }
            OpCode::Dict => {
                let objs = stack.pop_to_marker()?;
                stack.push(Object::Dict(Vec::new()));
                stack.set_items(objs, op_code)?;
            }
            OpCode::Append => {
                let value = stack.pop()?;
                match stack.last_mut()? {
                    Object::List(list) => list.push(value),
                    _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                }
            }
            OpCode::Appends => {
                let objs = stack.pop_to_marker()?;
                match stack.last_mut()? {
                    Object::List(list) => list.extend(objs),
                    _ => return Err(PickleError::UnexpectedOpCode(op_code)),
                }
            }
            OpCode::SetItem => {
                let value = stack.pop()?;
                let key = stack.pop()?;
                stack.set_items(vec![key, value], op_code)?;
            }
            OpCode::SetItems => {
                let objs = stack.pop_to_marker()?;
                stack.set_items(objs, op_code)?;
            }
            OpCode::BinInt => stack.push(Object::Int(r.read_i32::<LittleEndian>()? as i64)),
            OpCode::BinInt1 => stack.push(Object::Int(r.read_u8()? as i64)),
            OpCode::BinInt2 => stack.push(Object::Int(r.read_u16::<LittleEndian>()? as i64)),
            OpCode::Long1 => stack.push(read_long1(r)?),
            OpCode::None => stack.push(Object::None),
            OpCode::NewTrue => stack.push(Object::Bool(true)),
            OpCode::NewFalse => stack.push(Object::Bool(false)),
            // Python's BINFLOAT is big-endian.
            OpCode::BinFloat => stack.push(Object::Float(r.read_f64::<BigEndian>()?)),
            OpCode::BinUnicode | OpCode::BinString => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                stack.push(read_string(r, len)?);
            }
            OpCode::ShortBinUnicode | OpCode::ShortBinString => {
                let len = r.read_u8()? as usize;
                stack.push(read_string(r, len)?);
            }
            OpCode::BinPut => {
                let idx = r.read_u8()? as u32;
                stack.memo_put(idx)?;
            }
            OpCode::LongBinPut => {
                let idx = r.read_u32::<LittleEndian>()?;
                stack.memo_put(idx)?;
            }
            OpCode::Memoize => {
                let idx = stack.memo.len() as u32;
                stack.memo_put(idx)?;
            }
            OpCode::BinGet => {
                let idx = r.read_u8()? as u32;
                let obj = stack.memo_get(idx)?;
                stack.push(obj);
            }
            OpCode::LongBinGet => {
                let idx = r.read_u32::<LittleEndian>()?;
                let obj = stack.memo_get(idx)?;
                stack.push(obj);
            }
            OpCode::BinPersId => match stack.pop()? {
                Object::Tuple(pid) => stack.push(Object::Persistent(pid)),
                other => {
                    return Err(PickleError::InvalidData(format!(
                        "persistent id must be a tuple, got {}",
                        other.kind()
                    )))
                }
            },
            OpCode::Reduce | OpCode::NewObj => {
                let args = stack.pop()?;
                let callable = stack.pop()?;
                let obj = reduce(callable, args, stack.storages)?;
                stack.push(obj);
            }
            OpCode::Build => {
                let state = stack.pop()?;
                // The state of a dict is its `__dict__` (`_metadata` of a state dict), not items.
                // Tensors may carry extra Python state as well. Neither is needed.
                if let Object::Instance { state: slot, .. } = stack.last_mut()? {
                    **slot = state;
                }
            }
        }
    }

    stack.pop()
}
