//! Rewrites stored parameter names into the names the architecture expects.
//!
//! Two rules run on every key, in order:
//!
//! 1. every `module` path segment is removed (`nn.DataParallel` and
//!    `DistributedDataParallel` wrap the model under `module.`);
//! 2. a key that then starts with a digit, such as `0.weight`, is a bare layer index of the
//!    sequential container and gets the container name prepended.
//!
//! Optional regex remaps run between the two rules. Rule 2 assumes the checkpoint stores its
//! layers in the same order as the architecture. Nothing here can check that assumption; a
//! checkpoint with a different layer order binds the wrong weights without being reported.

use regex::Regex;

use crate::checkpoint::ParameterMap;

/// Name of the sequential container holding every layer of the denoiser.
pub const DEFAULT_CONTAINER: &str = "dncnn";

/// Path segment added by data-parallel training wrappers.
pub const DISTRIBUTED_SEGMENT: &str = "module";

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("invalid key remap pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// The result of normalizing a parameter map.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub params: ParameterMap,
    /// Number of keys whose name changed.
    pub renamed: usize,
    /// Input keys dropped because an earlier key already normalized to the same name.
    pub collisions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    container: String,
    key_remap: Vec<(Regex, String)>,
}

impl Default for KeyNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_CONTAINER)
    }
}

impl KeyNormalizer {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key_remap: Vec::new(),
        }
    }

    /// Add a remapping rule. The pattern must match the whole key; the first matching rule
    /// wins. Capture groups can be referenced as `$1`, `$2`, ... in the replacement.
    pub fn with_key_remap(mut self, pattern: &str, replacement: &str) -> Result<Self, NormalizeError> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
            NormalizeError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        self.key_remap.push((regex, replacement.to_string()));
        Ok(self)
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Normalize a single key.
    pub fn normalize_key(&self, key: &str) -> String {
        let key = strip_distributed_segments(key);
        let key = self.remap(&key);
        prefix_bare_index(&key, &self.container)
    }

    fn remap(&self, key: &str) -> String {
        for (pattern, replacement) in self.key_remap.iter() {
            if pattern.is_match(key) {
                return pattern.replace(key, replacement.as_str()).to_string();
            }
        }
        key.to_string()
    }

    /// Normalize every key of `params`, keeping the input order.
    pub fn normalize(&self, params: ParameterMap) -> Normalized {
        let mut normalized = ParameterMap::new();
        let mut renamed = 0;
        let mut collisions = Vec::new();

        for (key, tensor) in params {
            let new_key = self.normalize_key(&key);
            if normalized.contains_key(&new_key) {
                log::warn!(
                    "Key '{}' normalizes to '{}', which is already taken; keeping the first",
                    key,
                    new_key
                );
                collisions.push(key);
                continue;
            }
            if new_key != key {
                log::trace!("{} -> {}", key, new_key);
                renamed += 1;
            }
            normalized.insert(new_key, tensor);
        }

        log::info!(
            "Normalized {} keys ({} renamed, {} collisions)",
            normalized.len(),
            renamed,
            collisions.len()
        );

        Normalized {
            params: normalized,
            renamed,
            collisions,
        }
    }
}

/// Rule 1: drop every `module` segment. A key made only of such segments is left as is.
pub fn strip_distributed_segments(key: &str) -> String {
    let segments: Vec<&str> = key
        .split('.')
        .filter(|segment| *segment != DISTRIBUTED_SEGMENT)
        .collect();
    if segments.is_empty() {
        return key.to_string();
    }
    segments.join(".")
}

/// Rule 2: prepend `container.` to keys starting with a layer index.
///
/// The layer indices of the checkpoint are assumed to follow the container's own layer order.
/// Nothing checks this: layers of equal shape stored in another order bind to the wrong slots
/// without showing up in the binding report.
pub fn prefix_bare_index(key: &str, container: &str) -> String {
    match key.chars().next() {
        Some(first) if first.is_ascii_digit() => format!("{container}.{key}"),
        _ => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ParamTensor;

    fn map(keys: &[&str]) -> ParameterMap {
        keys.iter()
            .enumerate()
            .map(|(i, key)| (*key, ParamTensor::new(vec![1], vec![i as f32])))
            .collect()
    }

    #[test]
    fn distributed_prefix_is_stripped() {
        let normalizer = KeyNormalizer::default();

        assert_eq!(normalizer.normalize_key("module.dncnn.0.weight"), "dncnn.0.weight");
        assert_eq!(normalizer.normalize_key("module.module.dncnn.2.weight"), "dncnn.2.weight");
        assert_eq!(normalizer.normalize_key("module"), "module");
    }

    #[test]
    fn bare_indices_get_the_container_prefix() {
        let normalizer = KeyNormalizer::default();

        assert_eq!(normalizer.normalize_key("0.weight"), "dncnn.0.weight");
        assert_eq!(normalizer.normalize_key("module.48.weight"), "dncnn.48.weight");
        assert_eq!(normalizer.normalize_key("dncnn.3.bias"), "dncnn.3.bias");
        assert_eq!(normalizer.normalize_key("head.weight"), "head.weight");
    }

    #[test]
    fn normalization_is_idempotent() {
        let normalizer = KeyNormalizer::default();
        let input = map(&["module.0.weight", "1.bias", "dncnn.2.weight", "module", "x.module.y"]);

        let once = normalizer.normalize(input).params;
        let twice = normalizer.normalize(once.clone()).params;

        assert_eq!(once, twice);
    }

    #[test]
    fn order_and_values_are_preserved() {
        let normalizer = KeyNormalizer::default();

        let normalized = normalizer.normalize(map(&["2.weight", "0.weight", "1.bias"]));

        assert_eq!(
            normalized.params.keys().collect::<Vec<_>>(),
            ["dncnn.2.weight", "dncnn.0.weight", "dncnn.1.bias"]
        );
        assert_eq!(normalized.params.get("dncnn.0.weight").unwrap().values, vec![1.0]);
        assert_eq!(normalized.renamed, 3);
    }

    #[test]
    fn collisions_keep_the_first_key() {
        let normalizer = KeyNormalizer::default();

        let normalized = normalizer.normalize(map(&["module.0.weight", "0.weight"]));

        assert_eq!(normalized.params.len(), 1);
        assert_eq!(normalized.params.get("dncnn.0.weight").unwrap().values, vec![0.0]);
        assert_eq!(normalized.collisions, vec!["0.weight".to_string()]);
    }

    #[test]
    fn remaps_run_before_the_prefix_rule() {
        let normalizer = KeyNormalizer::default()
            .with_key_remap(r"features\.(.*)", "$1")
            .unwrap()
            .with_key_remap(r"features2\.(.*)", "never.$1")
            .unwrap();

        assert_eq!(normalizer.normalize_key("features.0.weight"), "dncnn.0.weight");
        // Anchored: a match in the middle of a key does not count.
        assert_eq!(normalizer.normalize_key("x.features.0.weight"), "x.features.0.weight");
    }

    #[test]
    fn invalid_remap_pattern_is_reported() {
        let err = KeyNormalizer::default().with_key_remap("(", "").unwrap_err();

        assert!(matches!(err, NormalizeError::InvalidPattern { .. }));
    }
}
