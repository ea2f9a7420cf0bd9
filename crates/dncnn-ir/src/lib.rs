#![warn(missing_debug_implementations)]

//! `dncnn-ir` holds the portable side of a DnCNN conversion: the in-memory computation graph,
//! its on-disk artifact encoding, the kernel-shape patcher, the structural validator and a
//! reference interpreter that executes an artifact without the training framework.

#[macro_use]
extern crate derive_new;

pub mod artifact;
pub mod ir;
pub mod patch;
pub mod runtime;
pub mod validate;

mod protos;

pub use artifact::{ArtifactError, PRODUCER_NAME};
pub use ir::*;
pub use patch::{patch, PatchOutcome};
pub use runtime::{RuntimeError, Session};
pub use validate::{validate, StructuralError};
