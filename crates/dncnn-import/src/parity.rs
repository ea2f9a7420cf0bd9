//! Numeric parity between the burn module and the reference runtime.
//!
//! Both evaluators receive the same seeded input and share no state. For a residual denoiser the
//! distance between input and output is the magnitude of the predicted noise, so a near-zero
//! distance on either side means the network does nothing.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use dncnn_ir::{RuntimeError, Session};
use ndarray::{ArrayD, IxDyn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::model::DnCnn;

/// Below this distance a network is considered a no-op.
pub const DEGENERATE_THRESHOLD: f32 = 1e-5;

/// Largest accepted distance between the outputs of the two evaluators.
pub const AGREEMENT_TOLERANCE: f32 = 1e-3;

#[derive(Debug, thiserror::Error)]
pub enum ParityError {
    #[error("parity input shape {0:?} is not a [batch, channels, height, width] image batch")]
    InputShape(Vec<usize>),

    #[error("reference runtime failed: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("framework output could not be read: {0}")]
    Data(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParityResult {
    /// `max |input - output|` of the burn module.
    pub framework_diff: f32,
    /// `max |input - output|` of the reference runtime.
    pub runtime_diff: f32,
    /// `max |framework output - runtime output|`.
    pub cross_diff: f32,
}

impl ParityResult {
    /// Either evaluator leaves its input (almost) unchanged.
    pub fn is_degenerate(&self, threshold: f32) -> bool {
        self.framework_diff < threshold || self.runtime_diff < threshold
    }

    pub fn engines_agree(&self, tolerance: f32) -> bool {
        self.cross_diff <= tolerance
    }
}

/// Values drawn from a standard normal distribution, reproducible for a given seed.
pub fn random_input(shape: &[usize], seed: u64) -> Vec<f32> {
    let len = shape.iter().product();
    StdRng::seed_from_u64(seed)
        .sample_iter(StandardNormal)
        .take(len)
        .collect()
}

/// Run one seeded input of `input_shape` through `model` and through `session`.
pub fn check_parity<B: Backend>(
    model: &DnCnn<B>,
    session: Session,
    input_shape: &[usize],
    seed: u64,
) -> Result<ParityResult, ParityError> {
    let shape: [usize; 4] = input_shape
        .try_into()
        .map_err(|_| ParityError::InputShape(input_shape.to_vec()))?;
    let input = random_input(&shape, seed);

    let device = model.head.weight.device();
    let framework_input = Tensor::<B, 4>::from_data(TensorData::new(input.clone(), shape), &device);
    let framework_output = model
        .forward(framework_input)
        .into_data()
        .convert::<f32>()
        .into_vec::<f32>()
        .map_err(|err| ParityError::Data(format!("{err:?}")))?;

    let session = session.with_input_shape(&shape)?;
    let runtime_output = run_session(&session, &shape, input.clone())?;

    let result = ParityResult {
        framework_diff: max_abs_diff(&input, &framework_output),
        runtime_diff: max_abs_diff(&input, &runtime_output),
        cross_diff: max_abs_diff(&framework_output, &runtime_output),
    };
    log::info!(
        "Parity on {:?}: framework diff {:.6e}, runtime diff {:.6e}, engines differ by {:.6e}",
        shape,
        result.framework_diff,
        result.runtime_diff,
        result.cross_diff
    );
    Ok(result)
}

/// `max |input - output|` of the reference runtime alone, on its declared input shape.
pub fn runtime_diff(session: &Session, seed: u64) -> Result<f32, ParityError> {
    let shape = session.input_shape().to_vec();
    let input = random_input(&shape, seed);
    let output = run_session(session, &shape, input.clone())?;
    Ok(max_abs_diff(&input, &output))
}

fn run_session(
    session: &Session,
    shape: &[usize],
    input: Vec<f32>,
) -> Result<Vec<f32>, ParityError> {
    let input = ArrayD::from_shape_vec(IxDyn(shape), input)
        .map_err(|_| ParityError::InputShape(shape.to_vec()))?;
    let output = session.run(input)?;
    Ok(output.iter().copied().collect())
}

/// Largest absolute element-wise difference; NaN counts as infinitely far.
pub fn max_abs_diff(lhs: &[f32], rhs: &[f32]) -> f32 {
    if lhs.len() != rhs.len() {
        return f32::INFINITY;
    }
    lhs.iter()
        .zip(rhs.iter())
        .map(|(a, b)| {
            let diff = (a - b).abs();
            if diff.is_nan() {
                f32::INFINITY
            } else {
                diff
            }
        })
        .fold(0.0, f32::max)
}
