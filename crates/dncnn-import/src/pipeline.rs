//! The conversion pipeline: load, normalize, bind, export, patch, validate, persist and check
//! parity, strictly in that order. The first fatal condition stops the run and is reported
//! together with the stage it happened in.

use core::fmt;
use std::path::Path;

use burn::{backend::NdArray, config::Config};
use dncnn_ir::{patch, validate, ArtifactError, Session, StructuralError};
use serde::{Deserialize, Serialize};

use crate::binder::{bind, BindingReport};
use crate::checkpoint::{self, CheckpointError, CheckpointLayout};
use crate::export::{export, ExportError};
use crate::model::{ArchitectureError, DnCnnConfig};
use crate::normalize::{KeyNormalizer, NormalizeError};
use crate::parity::{check_parity, ParityError, ParityResult};

type PipelineBackend = NdArray<f32>;

/// A user supplied rename rule, see [`KeyNormalizer::with_key_remap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRemap {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Config, Debug)]
pub struct ConvertConfig {
    #[config(default = "String::from(\"dncnn_25.pth\")")]
    pub checkpoint: String,
    #[config(default = "String::from(\"dncnn_grayscale.onnx\")")]
    pub artifact: String,
    #[config(default = 12)]
    pub opset_version: i64,
    /// Static input shape declared by the exported graph.
    #[config(default = "vec![1, 1, 512, 512]")]
    pub export_shape: Vec<usize>,
    /// Input shape of the parity check.
    #[config(default = "vec![1, 1, 128, 128]")]
    pub parity_shape: Vec<usize>,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1e-5)]
    pub degenerate_threshold: f32,
    #[config(default = 1e-3)]
    pub agreement_tolerance: f32,
    #[config(default = "Vec::new()")]
    pub key_remap: Vec<KeyRemap>,
    #[config(default = "DnCnnConfig::new()")]
    pub model: DnCnnConfig,
}

impl ConvertConfig {
    /// Key normalizer prefixing bare indices with the container of `model`.
    pub fn normalizer(&self) -> Result<KeyNormalizer, NormalizeError> {
        self.key_remap
            .iter()
            .try_fold(KeyNormalizer::new(&self.model.container), |normalizer, remap| {
                normalizer.with_key_remap(&remap.pattern, &remap.replacement)
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Stage {
    Load,
    Normalize,
    Bind,
    Export,
    Patch,
    Validate,
    Persist,
    Parity,
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Architecture(#[from] ArchitectureError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Parity(#[from] ParityError),
}

/// A fatal error together with the stage that raised it.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: ConvertError,
}

impl PipelineError {
    pub fn new(stage: Stage, source: impl Into<ConvertError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Classification {
    /// Every slot was bound and both engines agree on a working network.
    #[strum(to_string = "success")]
    Success,
    /// The artifact works, but binding was incomplete or the engines disagree.
    #[strum(to_string = "suspect conversion")]
    Suspect,
    /// The artifact was written but the network leaves its input unchanged.
    #[strum(to_string = "degenerate network")]
    Degenerate,
}

#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub checkpoint: String,
    pub layout: CheckpointLayout,
    pub num_tensors: usize,
    pub renamed: usize,
    pub collisions: Vec<String>,
    pub binding: BindingReport,
    pub opset_version: i64,
    pub num_nodes: usize,
    pub patched: usize,
    pub artifact: String,
    pub artifact_bytes: u64,
    pub parity: ParityResult,
    pub degenerate_threshold: f32,
    pub agreement_tolerance: f32,
}

impl ConversionReport {
    pub fn classification(&self) -> Classification {
        if self.parity.is_degenerate(self.degenerate_threshold) {
            Classification::Degenerate
        } else if self.binding.is_degraded() || !self.engines_agree() {
            Classification::Suspect
        } else {
            Classification::Success
        }
    }

    pub fn engines_agree(&self) -> bool {
        self.parity.engines_agree(self.agreement_tolerance)
    }

    pub fn artifact_megabytes(&self) -> f64 {
        self.artifact_bytes as f64 / (1024.0 * 1024.0)
    }
}

impl fmt::Display for ConversionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "checkpoint: {} ({})", self.checkpoint, self.layout)?;
        writeln!(
            f,
            "tensors:    {} ({} renamed, {} collisions)",
            self.num_tensors,
            self.renamed,
            self.collisions.len()
        )?;
        for line in self.binding.summary().lines() {
            writeln!(f, "binding:    {line}")?;
        }
        writeln!(
            f,
            "graph:      {} nodes at opset {}, {} convolutions patched",
            self.num_nodes, self.opset_version, self.patched
        )?;
        writeln!(
            f,
            "artifact:   {} ({:.2} MB)",
            self.artifact,
            self.artifact_megabytes()
        )?;
        writeln!(
            f,
            "parity:     framework diff {:.6e}, runtime diff {:.6e}, engines differ by {:.6e}",
            self.parity.framework_diff, self.parity.runtime_diff, self.parity.cross_diff
        )?;

        let classification = self.classification();
        match classification {
            Classification::Degenerate => write!(
                f,
                "WARNING: {classification}, the output differs from the input by less than {:e}",
                self.degenerate_threshold
            ),
            Classification::Suspect if self.binding.is_degraded() => write!(
                f,
                "WARNING: {classification}, {} of {} slots missing from the checkpoint, {} unexpected keys",
                self.binding.missing.len(),
                self.binding.num_slots(),
                self.binding.unexpected.len()
            ),
            Classification::Suspect => write!(
                f,
                "WARNING: {classification}, the engines differ by more than {:e}",
                self.agreement_tolerance
            ),
            Classification::Success => write!(f, "{classification}"),
        }
    }
}

/// Run the whole conversion described by `config`.
pub fn convert(config: &ConvertConfig) -> Result<ConversionReport, PipelineError> {
    let device = Default::default();

    log::info!("[1/8] Loading {}", config.checkpoint);
    let checkpoint = checkpoint::load(&config.checkpoint)
        .map_err(|err| PipelineError::new(Stage::Load, err))?;
    let num_tensors = checkpoint.params.len();

    log::info!("[2/8] Normalizing parameter names");
    let normalizer = config
        .normalizer()
        .map_err(|err| PipelineError::new(Stage::Normalize, err))?;
    let normalized = normalizer.normalize(checkpoint.params);

    log::info!("[3/8] Binding parameters");
    config
        .model
        .check()
        .map_err(|err| PipelineError::new(Stage::Bind, err))?;
    let mut model = config.model.init::<PipelineBackend>(&device);
    let binding = bind(&mut model, &normalized.params);

    log::info!("[4/8] Exporting at opset {}", config.opset_version);
    let graph = export(&model, &config.export_shape, config.opset_version)
        .map_err(|err| PipelineError::new(Stage::Export, err))?;

    log::info!("[5/8] Patching convolutions");
    let outcome = patch(&graph);
    log::info!("Patched {} convolution nodes", outcome.patched);
    let graph = outcome.graph;

    log::info!("[6/8] Validating graph structure");
    validate(&graph).map_err(|err| PipelineError::new(Stage::Validate, err))?;

    log::info!("[7/8] Writing {}", config.artifact);
    let artifact_bytes = graph
        .save(&config.artifact)
        .map_err(|err| PipelineError::new(Stage::Persist, err))?;

    log::info!("[8/8] Checking parity");
    let session = Session::from_file(&config.artifact)
        .map_err(|err| PipelineError::new(Stage::Parity, ParityError::from(err)))?;
    let parity = check_parity(&model, session, &config.parity_shape, config.seed)
        .map_err(|err| PipelineError::new(Stage::Parity, err))?;

    let report = ConversionReport {
        checkpoint: config.checkpoint.clone(),
        layout: checkpoint.layout,
        num_tensors,
        renamed: normalized.renamed,
        collisions: normalized.collisions,
        binding,
        opset_version: graph.opset_version,
        num_nodes: graph.nodes.len(),
        patched: outcome.patched,
        artifact: config.artifact.clone(),
        artifact_bytes,
        parity,
        degenerate_threshold: config.degenerate_threshold,
        agreement_tolerance: config.agreement_tolerance,
    };

    match report.classification() {
        Classification::Success => log::info!("Conversion finished: {}", Classification::Success),
        other => log::warn!("Conversion finished: {}", other),
    }
    Ok(report)
}

/// Load a pipeline configuration from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ConvertConfig, burn::config::ConfigError> {
    ConvertConfig::load(path)
}
