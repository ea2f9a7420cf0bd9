#![warn(missing_debug_implementations)]
#![allow(clippy::upper_case_acronyms)]

//! `dncnn-import` converts PyTorch checkpoints of the DnCNN denoiser into validated ONNX graphs.
//!
//! A conversion reads the checkpoint in whichever of the three `torch.save` layouts it was
//! written, renames its parameters into the names of [`model::DnCnn`], binds them, exports the
//! network with [`export::export`], repairs and validates the graph with `dncnn-ir` and finally
//! compares the burn module with the persisted artifact on a random input. See
//! [`pipeline::convert`].

#[macro_use]
extern crate derive_new;

pub mod binder;
pub mod checkpoint;
pub mod export;
pub mod logger;
pub mod model;
pub mod normalize;
pub mod parity;
pub mod pipeline;
pub mod synth;

pub use pipeline::{convert, Classification, ConversionReport, ConvertConfig, PipelineError, Stage};
