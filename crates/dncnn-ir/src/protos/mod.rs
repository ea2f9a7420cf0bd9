include!(concat!(env!("OUT_DIR"), "/onnx-protos/mod.rs"));

pub use onnx::*;
