use std::path::Path;

use dncnn_import::{
    checkpoint::CheckpointError,
    export::ExportError,
    model::DnCnnConfig,
    pipeline::{convert, Classification, ConversionReport, ConvertConfig, ConvertError, Stage},
    synth::{self, KeyStyle, LayoutKind, SynthConfig, Weights},
};
use dncnn_ir::{validate, Graph, Session};

fn model() -> DnCnnConfig {
    DnCnnConfig::new().with_depth(4).with_channels(4)
}

fn synth_config() -> SynthConfig {
    SynthConfig::new().with_seed(3).with_model(model())
}

fn write_checkpoint(dir: &Path, name: &str, config: &SynthConfig) -> String {
    let path = dir.join(name);
    synth::write(&path, config).unwrap();
    path.display().to_string()
}

fn convert_config(dir: &Path, checkpoint: String) -> ConvertConfig {
    ConvertConfig::new()
        .with_checkpoint(checkpoint)
        .with_artifact(dir.join("model.onnx").display().to_string())
        .with_export_shape(vec![1, 1, 8, 8])
        .with_parity_shape(vec![1, 1, 12, 12])
        .with_model(model())
}

fn run(config: &SynthConfig) -> ConversionReport {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = write_checkpoint(dir.path(), "dncnn.pth", config);
    convert(&convert_config(dir.path(), checkpoint)).unwrap()
}

#[test]
fn prefixed_bare_mapping_converts_successfully() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = write_checkpoint(dir.path(), "dncnn.pth", &synth_config());
    let config = convert_config(dir.path(), checkpoint);

    let report = convert(&config).unwrap();

    assert!(report.binding.missing.is_empty());
    assert!(report.binding.unexpected.is_empty());
    assert_eq!(report.binding.bound.len(), 13);
    assert_eq!(report.binding.ignored.len(), 2);
    assert_eq!(report.patched, 4);
    assert!(report.parity.framework_diff > 1e-5);
    assert!(report.parity.runtime_diff > 1e-5);
    assert_eq!(report.classification(), Classification::Success, "{report}");

    let graph = Graph::load(&config.artifact).unwrap();
    assert_eq!(validate(&graph), Ok(()));
    assert_eq!(graph.inputs[0].shape, vec![1, 1, 8, 8]);
    assert!(report.artifact_bytes > 0);
}

#[test]
fn opset_with_kernel_shape_needs_no_patch() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = write_checkpoint(dir.path(), "dncnn.pth", &synth_config());
    let config = convert_config(dir.path(), checkpoint).with_opset_version(13);

    let report = convert(&config).unwrap();

    assert_eq!(report.patched, 0);
    assert_eq!(report.classification(), Classification::Success);
}

#[test]
fn bare_index_keys_bind_like_prefixed_keys() {
    let prefixed = run(&synth_config());
    let bare = run(&synth_config().with_key_style(KeyStyle::Bare));

    assert_eq!(bare.renamed, 15);
    assert_eq!(bare.binding, prefixed.binding);
    assert_eq!(bare.parity, prefixed.parity);
    assert_eq!(bare.classification(), Classification::Success);
}

#[test]
fn distributed_keys_bind_like_prefixed_keys() {
    let prefixed = run(&synth_config());
    let distributed = run(&synth_config().with_key_style(KeyStyle::Distributed));

    assert_eq!(distributed.binding, prefixed.binding);
    assert_eq!(distributed.parity, prefixed.parity);
}

#[test]
fn bare_keys_are_prefixed_with_the_configured_container() {
    let dir = tempfile::tempdir().unwrap();
    let features = model().with_container("features".to_string());
    let synth = synth_config()
        .with_model(features.clone())
        .with_key_style(KeyStyle::Bare);
    let checkpoint = write_checkpoint(dir.path(), "features.pth", &synth);
    let config = convert_config(dir.path(), checkpoint).with_model(features);

    let report = convert(&config).unwrap();

    assert!(report.binding.missing.is_empty(), "{report}");
    assert!(report.binding.unexpected.is_empty(), "{report}");
    assert_eq!(report.binding.bound.len(), 13);
    assert_eq!(report.classification(), Classification::Success);

    let graph = Graph::load(&config.artifact).unwrap();
    assert!(graph
        .initializers
        .iter()
        .all(|init| init.name.starts_with("features.")));
}

#[test]
fn every_layout_converts_identically() {
    let reference = run(&synth_config());

    for layout in [LayoutKind::Full, LayoutKind::Wrapped] {
        let report = run(&synth_config().with_layout(layout));

        assert_eq!(report.layout, layout.layout());
        assert_eq!(report.binding, reference.binding);
        assert_eq!(report.parity, reference.parity);
    }
}

#[test]
fn zero_weights_are_flagged_degenerate_but_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = write_checkpoint(
        dir.path(),
        "zero.pth",
        &synth_config().with_weights(Weights::Zero),
    );
    let config = convert_config(dir.path(), checkpoint);

    let report = convert(&config).unwrap();

    assert!(!report.binding.is_degraded());
    assert_eq!(report.parity.framework_diff, 0.0);
    assert_eq!(report.parity.runtime_diff, 0.0);
    assert_eq!(report.classification(), Classification::Degenerate);
    assert!(report.to_string().contains("WARNING: degenerate network"));
    assert!(Session::from_file(&config.artifact).is_ok());
}

#[test]
fn missing_keys_degrade_but_still_export() {
    let report = run(&synth_config().with_drop_fraction(0.3));

    assert_eq!(report.binding.missing.len(), 4);
    assert_eq!(report.binding.bound.len(), 9);
    assert!(report.binding.is_degraded());
    assert_eq!(report.classification(), Classification::Suspect);
    assert!(report.to_string().contains("4 of 13 slots missing"));
}

#[test]
fn deeper_checkpoint_reports_mismatches_and_unexpected_keys() {
    let deeper = synth_config().with_model(model().with_depth(5));

    let report = run(&deeper);

    // The tail of the shallower network sits where the deeper one has a hidden convolution.
    assert_eq!(report.binding.missing, ["dncnn.8.weight"]);
    assert_eq!(report.binding.mismatched[0].expected, vec![1, 4, 3, 3]);
    assert_eq!(report.binding.mismatched[0].found, vec![4, 4, 3, 3]);
    assert_eq!(
        report.binding.unexpected,
        [
            "dncnn.9.weight",
            "dncnn.9.bias",
            "dncnn.9.running_mean",
            "dncnn.9.running_var",
            "dncnn.11.weight",
        ]
    );
    assert_eq!(report.binding.ignored.len(), 3);
    assert_eq!(report.classification(), Classification::Suspect);
}

#[test]
fn legacy_checkpoint_fails_in_the_load_stage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.pth");
    std::fs::write(&path, [0x80, 0x02, 0x8a, 0x0a, 0x6c, 0xfc]).unwrap();
    let config = convert_config(dir.path(), path.display().to_string());

    let err = convert(&config).unwrap_err();

    assert_eq!(err.stage, Stage::Load);
    assert!(matches!(
        err.source,
        ConvertError::Checkpoint(CheckpointError::UnsupportedEncoding(_))
    ));
    assert!(!Path::new(&config.artifact).exists());
}

#[test]
fn unsupported_opset_fails_before_anything_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = write_checkpoint(dir.path(), "dncnn.pth", &synth_config());
    let config = convert_config(dir.path(), checkpoint).with_opset_version(21);

    let err = convert(&config).unwrap_err();

    assert_eq!(err.stage, Stage::Export);
    assert!(matches!(
        err.source,
        ConvertError::Export(ExportError::UnsupportedOpset(21))
    ));
    assert!(!Path::new(&config.artifact).exists());
}

#[test]
fn invalid_architecture_fails_in_the_bind_stage() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = write_checkpoint(dir.path(), "dncnn.pth", &synth_config());
    let config = convert_config(dir.path(), checkpoint).with_model(model().with_depth(1));

    let err = convert(&config).unwrap_err();

    assert_eq!(err.stage, Stage::Bind);
}
