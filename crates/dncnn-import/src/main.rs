use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use dncnn_import::{
    checkpoint,
    logger::init_log,
    model::DnCnnConfig,
    normalize::{KeyNormalizer, DEFAULT_CONTAINER},
    parity::{runtime_diff, DEGENERATE_THRESHOLD},
    pipeline::{convert, load_config, Classification, ConvertConfig, KeyRemap},
    synth::{self, KeyStyle, LayoutKind, SynthConfig, Weights},
};
use dncnn_ir::Session;

#[derive(Parser, Debug)]
#[command(name = "dncnn-import", version, about = "Convert DnCNN checkpoints into ONNX graphs", long_about = None)]
struct Cli {
    /// Minimum level of the log records written to stderr
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a checkpoint into a validated graph artifact
    Convert {
        /// JSON pipeline configuration; the flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        checkpoint: Option<String>,

        #[arg(long)]
        artifact: Option<String>,

        #[arg(long)]
        opset: Option<i64>,

        /// Input shape declared by the graph, e.g. 1,1,512,512
        #[arg(long, value_delimiter = ',')]
        export_shape: Option<Vec<usize>>,

        /// Input shape of the parity check, e.g. 1,1,128,128
        #[arg(long, value_delimiter = ',')]
        parity_shape: Option<Vec<usize>>,

        #[arg(long)]
        seed: Option<u64>,

        /// Extra key rename rule PATTERN=REPLACEMENT, may be repeated
        #[arg(long = "remap", value_parser = parse_remap)]
        key_remap: Vec<KeyRemap>,

        #[arg(long)]
        depth: Option<usize>,

        #[arg(long)]
        channels: Option<usize>,

        /// Attribute name of the layer sequence in checkpoint keys
        #[arg(long)]
        container: Option<String>,

        /// Fail unless the conversion is classified as a success
        #[arg(long)]
        strict: bool,
    },

    /// Run a seeded random input through an artifact
    Verify {
        artifact: PathBuf,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Evaluate on another input shape than the declared one
        #[arg(long, value_delimiter = ',')]
        shape: Option<Vec<usize>>,
    },

    /// List the layout and parameters of a checkpoint
    Inspect {
        checkpoint: PathBuf,

        /// Also print the name each key normalizes to
        #[arg(long)]
        normalized: bool,
    },

    /// Write a synthetic checkpoint
    Synth {
        path: PathBuf,

        #[arg(long, value_enum, default_value_t = Weights::Random)]
        weights: Weights,

        #[arg(long, value_enum, default_value_t = LayoutKind::Bare)]
        layout: LayoutKind,

        #[arg(long, value_enum, default_value_t = KeyStyle::Prefixed)]
        key_style: KeyStyle,

        /// Fraction of the parameter slots to leave out
        #[arg(long, default_value_t = 0.0)]
        drop_fraction: f64,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        #[arg(long, default_value_t = 17)]
        depth: usize,

        #[arg(long, default_value_t = 64)]
        channels: usize,

        #[arg(long, default_value = DEFAULT_CONTAINER)]
        container: String,
    },
}

fn parse_remap(value: &str) -> Result<KeyRemap, String> {
    let (pattern, replacement) = value
        .split_once('=')
        .ok_or_else(|| format!("expected PATTERN=REPLACEMENT, got '{value}'"))?;
    Ok(KeyRemap {
        pattern: pattern.to_string(),
        replacement: replacement.to_string(),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_log(cli.log_level)?;

    match cli.command {
        Command::Convert {
            config,
            checkpoint,
            artifact,
            opset,
            export_shape,
            parity_shape,
            seed,
            key_remap,
            depth,
            channels,
            container,
            strict,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => ConvertConfig::new(),
            };
            if let Some(checkpoint) = checkpoint {
                config.checkpoint = checkpoint;
            }
            if let Some(artifact) = artifact {
                config.artifact = artifact;
            }
            if let Some(opset) = opset {
                config.opset_version = opset;
            }
            if let Some(shape) = export_shape {
                config.export_shape = shape;
            }
            if let Some(shape) = parity_shape {
                config.parity_shape = shape;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }
            config.key_remap.extend(key_remap);
            if let Some(depth) = depth {
                config.model.depth = depth;
            }
            if let Some(channels) = channels {
                config.model.channels = channels;
            }
            if let Some(container) = container {
                config.model.container = container;
            }

            let report = convert(&config)?;
            println!("{report}");
            if strict && report.classification() != Classification::Success {
                bail!("conversion classified as {}", report.classification());
            }
        }
        Command::Verify {
            artifact,
            seed,
            shape,
        } => {
            if !artifact.exists() {
                bail!("artifact not found: {}", artifact.display());
            }
            let mut session = Session::from_file(&artifact)?;
            if let Some(shape) = shape {
                session = session.with_input_shape(&shape)?;
            }
            let diff = runtime_diff(&session, seed)?;

            println!(
                "{}: input {:?}, max |input - output| = {:.6e}",
                artifact.display(),
                session.input_shape(),
                diff
            );
            if diff < DEGENERATE_THRESHOLD {
                println!("WARNING: the network does not change its input");
            } else {
                println!("the network is active");
            }
        }
        Command::Inspect {
            checkpoint,
            normalized,
        } => {
            let loaded = checkpoint::load(&checkpoint)?;
            let normalizer = KeyNormalizer::default();

            println!("{}: {}", checkpoint.display(), loaded.layout);
            println!(
                "{} tensors, {} values",
                loaded.params.len(),
                loaded.params.num_values()
            );
            for (key, tensor) in loaded.params.iter() {
                if normalized {
                    println!("  {key} -> {} {:?}", normalizer.normalize_key(key), tensor.shape);
                } else {
                    println!("  {key} {:?}", tensor.shape);
                }
            }
        }
        Command::Synth {
            path,
            weights,
            layout,
            key_style,
            drop_fraction,
            seed,
            depth,
            channels,
            container,
        } => {
            let config = SynthConfig::new()
                .with_weights(weights)
                .with_layout(layout)
                .with_key_style(key_style)
                .with_drop_fraction(drop_fraction)
                .with_seed(seed)
                .with_model(
                    DnCnnConfig::new()
                        .with_depth(depth)
                        .with_channels(channels)
                        .with_container(container),
                );
            config.model.check()?;
            let bytes = synth::write(&path, &config)?;
            println!(
                "{}: {} ({:.2} MB)",
                path.display(),
                layout.layout(),
                bytes as f64 / (1024.0 * 1024.0)
            );
        }
    }

    Ok(())
}
