//! Non-strict binding of a parameter map onto a [`DnCnn`] instance.

use core::fmt;

use burn::tensor::backend::Backend;

use crate::checkpoint::ParameterMap;
use crate::model::{DnCnn, SlotError, NUM_BATCHES_TRACKED};

/// Number of example keys listed per set by [`BindingReport::summary`].
const SAMPLE_SIZE: usize = 3;

/// A slot whose key was present but whose tensor had the wrong shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub found: Vec<usize>,
}

/// Outcome of [`bind`].
///
/// `bound` and `missing` partition the slots of the network; `mismatched` is a subset of
/// `missing`. Keys of the map that matched no slot are listed in `unexpected`, except batch norm
/// step counters, which carry no weights and go to `ignored`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingReport {
    pub bound: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mismatched: Vec<Mismatch>,
    pub ignored: Vec<String>,
}

impl BindingReport {
    /// The map and the network disagree on at least one name.
    pub fn is_degraded(&self) -> bool {
        !self.missing.is_empty() || !self.unexpected.is_empty()
    }

    pub fn num_slots(&self) -> usize {
        self.bound.len() + self.missing.len()
    }

    /// Counts and up to three example keys per set, one line each.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "bound {}/{} slots, {} missing, {} unexpected, {} ignored",
            self.bound.len(),
            self.num_slots(),
            self.missing.len(),
            self.unexpected.len(),
            self.ignored.len()
        )];
        if !self.missing.is_empty() {
            lines.push(format!("missing: {}", sample(&self.missing)));
        }
        if !self.unexpected.is_empty() {
            lines.push(format!("unexpected: {}", sample(&self.unexpected)));
        }
        for mismatch in self.mismatched.iter().take(SAMPLE_SIZE) {
            lines.push(format!(
                "shape mismatch: {} expects {:?}, checkpoint has {:?}",
                mismatch.name, mismatch.expected, mismatch.found
            ));
        }
        lines.join("\n")
    }
}

impl fmt::Display for BindingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

fn sample(keys: &[String]) -> String {
    let shown = keys
        .iter()
        .take(SAMPLE_SIZE)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    match keys.len().saturating_sub(SAMPLE_SIZE) {
        0 => shown,
        rest => format!("{shown} (+{rest} more)"),
    }
}

/// Write every tensor of `params` whose name and shape match a slot of `model`.
///
/// Never fails: anything that cannot be bound is recorded in the report and the slot keeps its
/// initial value.
pub fn bind<B: Backend>(model: &mut DnCnn<B>, params: &ParameterMap) -> BindingReport {
    let mut report = BindingReport::default();
    let slots = model.slots();

    for slot in slots.iter() {
        let Some(tensor) = params.get(&slot.name) else {
            report.missing.push(slot.name.clone());
            continue;
        };
        match model.set_slot(&slot.name, tensor) {
            Ok(()) => report.bound.push(slot.name.clone()),
            Err(SlotError::Shape {
                name,
                expected,
                found,
            }) => {
                log::warn!("Shape mismatch for {name}: expected {expected:?}, found {found:?}");
                report.missing.push(name.clone());
                report.mismatched.push(Mismatch {
                    name,
                    expected,
                    found,
                });
            }
            Err(SlotError::Unknown(name)) => report.missing.push(name),
            Err(err @ SlotError::Data { .. }) => {
                log::warn!("{err}");
                report.missing.push(slot.name.clone());
            }
        }
    }

    for key in params.keys() {
        if slots.iter().any(|slot| slot.name == key) {
            continue;
        }
        if key.ends_with(NUM_BATCHES_TRACKED) {
            report.ignored.push(key.to_string());
        } else {
            report.unexpected.push(key.to_string());
        }
    }

    if report.is_degraded() {
        log::warn!("Binding degraded: {}", report.summary());
    } else {
        log::info!("Bound all {} slots", report.bound.len());
    }
    report
}
