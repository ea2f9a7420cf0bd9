//! Synthetic checkpoints, so that every supported encoding can be produced and converted without
//! a PyTorch installation.

use std::path::Path;

use burn::config::Config;
use rand::{distributions::Uniform, rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, CheckpointError, CheckpointLayout, ParamTensor, ParameterMap};
use crate::model::{DnCnnConfig, NUM_BATCHES_TRACKED};
use crate::normalize::DISTRIBUTED_SEGMENT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Weights {
    /// He-initialized convolutions and plausible batch norm statistics.
    Random,
    /// Every tensor is zero; the resulting network is an identity.
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum KeyStyle {
    /// `dncnn.0.weight`
    Prefixed,
    /// `0.weight`
    Bare,
    /// `module.dncnn.0.weight`
    Distributed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum LayoutKind {
    Full,
    Wrapped,
    Bare,
}

impl LayoutKind {
    pub fn layout(self) -> CheckpointLayout {
        match self {
            LayoutKind::Full => CheckpointLayout::FullInstance {
                class: "__main__.DnCNN".to_string(),
            },
            LayoutKind::Wrapped => CheckpointLayout::WrappedMapping {
                key: checkpoint::STATE_DICT_KEY.to_string(),
            },
            LayoutKind::Bare => CheckpointLayout::BareMapping,
        }
    }
}

#[derive(Config, Debug)]
pub struct SynthConfig {
    #[config(default = "Weights::Random")]
    pub weights: Weights,
    #[config(default = "KeyStyle::Prefixed")]
    pub key_style: KeyStyle,
    #[config(default = "LayoutKind::Bare")]
    pub layout: LayoutKind,
    /// Fraction of the parameter slots left out of the checkpoint.
    #[config(default = 0.0)]
    pub drop_fraction: f64,
    #[config(default = 0)]
    pub seed: u64,
    #[config(default = "DnCnnConfig::new()")]
    pub model: DnCnnConfig,
}

/// Build the parameter map a trained DnCNN of `config.model` would store.
///
/// Batch norm layers also get their `num_batches_tracked` counter, like `state_dict()` does.
pub fn synthesize(config: &SynthConfig) -> ParameterMap {
    let model = &config.model;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let kernel = model.kernel_size;
    let mut entries: Vec<(String, ParamTensor)> = Vec::new();

    let mut conv = |rng: &mut StdRng, index: usize, out: usize, input: usize, bias: bool| {
        let shape = vec![out, input, kernel, kernel];
        let fan_in = (input * kernel * kernel) as f32;
        entries.push((
            slot(&model.container, index, "weight"),
            tensor(rng, config.weights, shape, (2.0 / fan_in).sqrt(), 0.0),
        ));
        if bias {
            entries.push((
                slot(&model.container, index, "bias"),
                tensor(rng, config.weights, vec![out], 0.01, 0.0),
            ));
        }
    };

    let mut slots = Vec::new();
    conv(&mut rng, 0, model.channels, model.image_channels, true);
    for i in 0..model.depth.saturating_sub(2) {
        conv(&mut rng, 3 * i + 2, model.channels, model.channels, false);
        slots.push(3 * i + 3);
    }
    conv(
        &mut rng,
        3 * model.depth.saturating_sub(2) + 2,
        model.image_channels,
        model.channels,
        false,
    );

    for index in slots {
        let channels = vec![model.channels];
        let norm = [
            ("weight", 0.1, 1.0),
            ("bias", 0.1, 0.0),
            ("running_mean", 0.1, 0.0),
        ];
        for (field, std, mean) in norm {
            let value = tensor(&mut rng, config.weights, channels.clone(), std, mean);
            entries.push((slot(&model.container, index, field), value));
        }
        let var = match config.weights {
            Weights::Random => {
                let uniform = Uniform::new(0.5f32, 1.5);
                (&mut rng).sample_iter(uniform).take(model.channels).collect()
            }
            Weights::Zero => vec![0.0; model.channels],
        };
        entries.push((
            slot(&model.container, index, "running_var"),
            ParamTensor::new(channels, var),
        ));
        entries.push((
            slot(&model.container, index, NUM_BATCHES_TRACKED),
            ParamTensor::new(vec![], vec![0.0]),
        ));
    }
    // Layers are listed in `state_dict()` order.
    entries.sort_by_key(|(key, _)| layer_index(key));

    let dropped = dropped_slots(&entries, config.drop_fraction, &mut rng);
    entries
        .into_iter()
        .filter(|(key, _)| !dropped.contains(key))
        .map(|(key, tensor)| (rename(&key, &model.container, config.key_style), tensor))
        .collect()
}

/// Synthesize a checkpoint and write it to `path`. Returns the file size.
pub fn write(path: impl AsRef<Path>, config: &SynthConfig) -> Result<u64, CheckpointError> {
    let params = synthesize(config);
    log::info!(
        "Synthesized {} tensors ({:?} weights, {:?} keys)",
        params.len(),
        config.weights,
        config.key_style
    );
    checkpoint::save(path, &params, &config.layout.layout())
}

fn slot(container: &str, index: usize, field: &str) -> String {
    format!("{container}.{index}.{field}")
}

fn layer_index(key: &str) -> usize {
    key.split('.')
        .nth(1)
        .and_then(|index| index.parse().ok())
        .unwrap_or(usize::MAX)
}

fn tensor(rng: &mut StdRng, weights: Weights, shape: Vec<usize>, std: f32, mean: f32) -> ParamTensor {
    match (weights, Normal::new(mean, std)) {
        (Weights::Random, Ok(normal)) => {
            let len = shape.iter().product();
            let values = rng.sample_iter(normal).take(len).collect();
            ParamTensor::new(shape, values)
        }
        _ => ParamTensor::zeros(shape),
    }
}

fn dropped_slots(entries: &[(String, ParamTensor)], fraction: f64, rng: &mut StdRng) -> Vec<String> {
    let mut candidates: Vec<&String> = entries
        .iter()
        .map(|(key, _)| key)
        .filter(|key| !key.ends_with(NUM_BATCHES_TRACKED))
        .collect();
    let count = (fraction.clamp(0.0, 1.0) * candidates.len() as f64).round() as usize;
    candidates.shuffle(rng);
    candidates.into_iter().take(count).cloned().collect()
}

fn rename(key: &str, container: &str, style: KeyStyle) -> String {
    match style {
        KeyStyle::Prefixed => key.to_string(),
        KeyStyle::Bare => key
            .strip_prefix(container)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(key)
            .to_string(),
        KeyStyle::Distributed => format!("{DISTRIBUTED_SEGMENT}.{key}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::KeyNormalizer;

    fn tiny() -> SynthConfig {
        SynthConfig::new().with_model(DnCnnConfig::new().with_depth(4).with_channels(3))
    }

    #[test]
    fn keys_follow_state_dict_order() {
        let params = synthesize(&tiny());

        let keys: Vec<_> = params.keys().collect();
        assert_eq!(
            keys,
            [
                "dncnn.0.weight",
                "dncnn.0.bias",
                "dncnn.2.weight",
                "dncnn.3.weight",
                "dncnn.3.bias",
                "dncnn.3.running_mean",
                "dncnn.3.running_var",
                "dncnn.3.num_batches_tracked",
                "dncnn.5.weight",
                "dncnn.6.weight",
                "dncnn.6.bias",
                "dncnn.6.running_mean",
                "dncnn.6.running_var",
                "dncnn.6.num_batches_tracked",
                "dncnn.8.weight",
            ]
        );
        assert_eq!(params.get("dncnn.8.weight").unwrap().shape, vec![1, 3, 3, 3]);
    }

    #[test]
    fn same_seed_same_weights() {
        assert_eq!(synthesize(&tiny()), synthesize(&tiny()));
        assert_ne!(synthesize(&tiny()), synthesize(&tiny().with_seed(1)));
    }

    #[test]
    fn zero_weights_are_zero() {
        let params = synthesize(&tiny().with_weights(Weights::Zero));

        assert!(params
            .iter()
            .all(|(_, tensor)| tensor.values.iter().all(|v| *v == 0.0)));
    }

    #[test]
    fn key_styles_normalize_to_the_same_map() {
        let normalizer = KeyNormalizer::default();
        let prefixed = synthesize(&tiny());

        for style in [KeyStyle::Bare, KeyStyle::Distributed] {
            let params = synthesize(&tiny().with_key_style(style));
            assert_ne!(params, prefixed);
            assert_eq!(normalizer.normalize(params).params, prefixed);
        }
        let bare = synthesize(&tiny().with_key_style(KeyStyle::Bare));
        assert!(bare.keys().all(|key| key.starts_with(|c: char| c.is_ascii_digit())));
    }

    #[test]
    fn keys_use_the_model_container() {
        let features = DnCnnConfig::new()
            .with_depth(4)
            .with_channels(3)
            .with_container("features".into());
        let prefixed = synthesize(&tiny().with_model(features.clone()));
        let bare = synthesize(
            &tiny()
                .with_model(features)
                .with_key_style(KeyStyle::Bare),
        );

        assert!(prefixed.keys().all(|key| key.starts_with("features.")));
        assert_eq!(bare.keys().next(), Some("0.weight"));
        assert_eq!(
            KeyNormalizer::new("features").normalize(bare).params,
            prefixed
        );
    }

    #[test]
    fn drop_fraction_removes_slots_only() {
        let params = synthesize(&tiny().with_drop_fraction(0.3));

        // 13 slots, 4 of them dropped; both step counters stay.
        assert_eq!(params.len(), 15 - 4);
        assert!(params.contains_key("dncnn.3.num_batches_tracked"));
        assert!(params.contains_key("dncnn.6.num_batches_tracked"));
    }

    #[test]
    fn write_produces_a_loadable_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synthetic.pth");

        write(&path, &tiny().with_layout(LayoutKind::Full)).unwrap();
        let checkpoint = checkpoint::load(&path).unwrap();

        assert_eq!(checkpoint.layout, LayoutKind::Full.layout());
        assert_eq!(checkpoint.params, synthesize(&tiny()));
    }
}
