//! The DnCNN denoiser as a burn module.
//!
//! Parameters are addressed by the names a PyTorch `nn.Sequential` gives them. The container is
//! called `dncnn` unless [`DnCnnConfig::container`] says otherwise:
//!
//! | index        | layer                          | slots                                         |
//! |--------------|--------------------------------|-----------------------------------------------|
//! | `0`          | head convolution (with bias)   | `weight`, `bias`                              |
//! | `3i + 2`     | convolution of block `i`       | `weight`                                      |
//! | `3i + 3`     | batch norm of block `i`        | `weight`, `bias`, `running_mean`, `running_var` |
//! | `3(d-2) + 2` | tail convolution               | `weight`                                      |
//!
//! Indices `1` and `3i + 4` are the parameterless ReLU layers.

use burn::{
    config::Config,
    module::{Module, Param, RunningState},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor, TensorData},
};

use crate::checkpoint::ParamTensor;
use crate::normalize::DEFAULT_CONTAINER;

/// Bookkeeping buffer of batch norm layers. It carries no weights.
pub const NUM_BATCHES_TRACKED: &str = "num_batches_tracked";

#[derive(Config, Debug)]
pub struct DnCnnConfig {
    /// Number of convolution layers, head and tail included.
    #[config(default = 17)]
    pub depth: usize,
    /// Feature channels of the hidden layers.
    #[config(default = 64)]
    pub channels: usize,
    /// Channels of the input and output images.
    #[config(default = 1)]
    pub image_channels: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 1e-4)]
    pub epsilon: f64,
    #[config(default = 0.95)]
    pub momentum: f64,
    /// Attribute name of the `nn.Sequential` holding the layers.
    #[config(default = "String::from(DEFAULT_CONTAINER)")]
    pub container: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArchitectureError {
    #[error("depth must be at least 2 (head and tail), got {0}")]
    Depth(usize),

    #[error("kernel size must be odd, got {0}")]
    KernelSize(usize),

    #[error("channel counts must be positive")]
    Channels,

    #[error("container name '{0}' must be a non-empty name without dots")]
    Container(String),
}

impl DnCnnConfig {
    /// Check that the hyper parameters describe a buildable network.
    pub fn check(&self) -> Result<(), ArchitectureError> {
        if self.depth < 2 {
            return Err(ArchitectureError::Depth(self.depth));
        }
        if self.kernel_size % 2 == 0 {
            return Err(ArchitectureError::KernelSize(self.kernel_size));
        }
        if self.channels == 0 || self.image_channels == 0 {
            return Err(ArchitectureError::Channels);
        }
        if self.container.is_empty() || self.container.contains('.') {
            return Err(ArchitectureError::Container(self.container.clone()));
        }
        Ok(())
    }

    /// Initialize a network with untrained weights.
    ///
    /// # Panics
    ///
    /// Panics if [`check`](Self::check) fails.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DnCnn<B> {
        if let Err(err) = self.check() {
            panic!("Invalid DnCNN configuration: {err}");
        }

        let padding = self.kernel_size / 2;
        let conv = |channels: [usize; 2], bias: bool| {
            Conv2dConfig::new(channels, [self.kernel_size, self.kernel_size])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_bias(bias)
                .init(device)
        };

        let body = (0..self.depth - 2)
            .map(|_| ConvBlock {
                conv: conv([self.channels, self.channels], false),
                norm: BatchNormConfig::new(self.channels)
                    .with_epsilon(self.epsilon)
                    .with_momentum(self.momentum)
                    .init(device),
                activation: Relu::new(),
            })
            .collect();

        DnCnn {
            head: conv([self.image_channels, self.channels], true),
            body,
            tail: conv([self.channels, self.image_channels], false),
            activation: Relu::new(),
            kernel_size: self.kernel_size,
            padding,
            epsilon: self.epsilon,
            momentum: self.momentum,
            container: self.container.clone(),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B, 2>,
    pub activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.norm.forward(x);
        self.activation.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct DnCnn<B: Backend> {
    pub head: Conv2d<B>,
    pub body: Vec<ConvBlock<B>>,
    pub tail: Conv2d<B>,
    pub activation: Relu,
    pub kernel_size: usize,
    pub padding: usize,
    pub epsilon: f64,
    pub momentum: f64,
    pub container: String,
}

impl<B: Backend> DnCnn<B> {
    /// Residual denoising: the network predicts the noise and subtracts it from the input.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.activation.forward(self.head.forward(input.clone()));
        for block in self.body.iter() {
            x = block.forward(x);
        }
        let noise = self.tail.forward(x);
        input - noise
    }

    /// Number of convolution layers.
    pub fn depth(&self) -> usize {
        self.body.len() + 2
    }

    pub fn image_channels(&self) -> usize {
        self.head.weight.dims()[1]
    }

    /// Sequential index of the tail convolution.
    pub fn tail_index(&self) -> usize {
        3 * self.body.len() + 2
    }

    /// `<container>.<index>`, the name PyTorch gives the layer at `index`.
    pub fn layer_name(&self, index: usize) -> String {
        format!("{}.{index}", self.container)
    }

    /// Every parameter slot with its required shape, in `state_dict()` order.
    pub fn slots(&self) -> Vec<Slot> {
        let mut slots = Vec::new();
        let push_conv = |slots: &mut Vec<Slot>, index: usize, conv: &Conv2d<B>| {
            let layer = self.layer_name(index);
            slots.push(Slot::new(&layer, "weight", conv.weight.dims().to_vec()));
            if let Some(bias) = conv.bias.as_ref() {
                slots.push(Slot::new(&layer, "bias", bias.dims().to_vec()));
            }
        };

        push_conv(&mut slots, 0, &self.head);
        for (i, block) in self.body.iter().enumerate() {
            push_conv(&mut slots, 3 * i + 2, &block.conv);
            let layer = self.layer_name(3 * i + 3);
            let channels = block.norm.gamma.dims().to_vec();
            for field in NORM_FIELDS {
                slots.push(Slot::new(&layer, field, channels.clone()));
            }
        }
        push_conv(&mut slots, self.tail_index(), &self.tail);
        slots
    }

    /// Read the current value of a slot.
    pub fn slot(&self, name: &str) -> Result<ParamTensor, SlotError> {
        let unknown = || SlotError::Unknown(name.to_string());
        match self.locate(name).ok_or_else(unknown)? {
            Target::ConvWeight(conv) => to_param(name, conv.weight.val()),
            Target::ConvBias(conv) => match conv.bias.as_ref() {
                Some(bias) => to_param(name, bias.val()),
                None => Err(unknown()),
            },
            Target::Norm(norm, field) => to_param(
                name,
                match field {
                    NormField::Gamma => norm.gamma.val(),
                    NormField::Beta => norm.beta.val(),
                    NormField::RunningMean => norm.running_mean.value(),
                    NormField::RunningVar => norm.running_var.value(),
                },
            ),
        }
    }

    /// Overwrite a slot. The tensor must have exactly the slot's shape.
    pub fn set_slot(&mut self, name: &str, tensor: &ParamTensor) -> Result<(), SlotError> {
        let expected = self
            .slots()
            .into_iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.shape)
            .ok_or_else(|| SlotError::Unknown(name.to_string()))?;
        if expected != tensor.shape {
            return Err(SlotError::Shape {
                name: name.to_string(),
                expected,
                found: tensor.shape.clone(),
            });
        }

        let device = self.head.weight.device();
        let (index, field) =
            parse_slot(name, &self.container).ok_or_else(|| SlotError::Unknown(name.to_string()))?;
        let body_len = self.body.len();

        match (index, field) {
            (0, "weight") => self.head.weight = Param::from_tensor(from_param(tensor, &device)),
            (0, "bias") => self.head.bias = Some(Param::from_tensor(from_param(tensor, &device))),
            (index, "weight") if index == 3 * body_len + 2 => {
                self.tail.weight = Param::from_tensor(from_param(tensor, &device))
            }
            (index, "weight") if index % 3 == 2 => {
                self.body[(index - 2) / 3].conv.weight =
                    Param::from_tensor(from_param(tensor, &device))
            }
            (index, field) => {
                let norm = &mut self.body[(index - 3) / 3].norm;
                let value = from_param(tensor, &device);
                match field {
                    "weight" => norm.gamma = Param::from_tensor(value),
                    "bias" => norm.beta = Param::from_tensor(value),
                    "running_mean" => norm.running_mean = RunningState::new(value),
                    _ => norm.running_var = RunningState::new(value),
                }
            }
        }
        Ok(())
    }

    fn locate(&self, name: &str) -> Option<Target<'_, B>> {
        let (index, field) = parse_slot(name, &self.container)?;
        let body_len = self.body.len();

        let conv = if index == 0 {
            Some(&self.head)
        } else if index == 3 * body_len + 2 {
            Some(&self.tail)
        } else if index % 3 == 2 && index < 3 * body_len + 2 {
            Some(&self.body[(index - 2) / 3].conv)
        } else {
            None
        };
        if let Some(conv) = conv {
            return match field {
                "weight" => Some(Target::ConvWeight(conv)),
                "bias" if conv.bias.is_some() => Some(Target::ConvBias(conv)),
                _ => None,
            };
        }

        if index % 3 == 0 && index >= 3 && index <= 3 * body_len {
            let norm = &self.body[(index - 3) / 3].norm;
            let field = match field {
                "weight" => NormField::Gamma,
                "bias" => NormField::Beta,
                "running_mean" => NormField::RunningMean,
                "running_var" => NormField::RunningVar,
                _ => return None,
            };
            return Some(Target::Norm(norm, field));
        }
        None
    }
}

const NORM_FIELDS: [&str; 4] = ["weight", "bias", "running_mean", "running_var"];

/// A named parameter of the network and its required shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    pub shape: Vec<usize>,
}

impl Slot {
    fn new(layer: &str, field: &str, shape: Vec<usize>) -> Self {
        Self {
            name: format!("{layer}.{field}"),
            shape,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SlotError {
    #[error("the network has no parameter named '{0}'")]
    Unknown(String),

    #[error("parameter '{name}' has shape {expected:?}, got {found:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("parameter '{name}' could not be read as f32: {reason}")]
    Data { name: String, reason: String },
}

enum NormField {
    Gamma,
    Beta,
    RunningMean,
    RunningVar,
}

enum Target<'a, B: Backend> {
    ConvWeight(&'a Conv2d<B>),
    ConvBias(&'a Conv2d<B>),
    Norm(&'a BatchNorm<B, 2>, NormField),
}

/// Split `<container>.<index>.<field>` into its index and field.
fn parse_slot<'a>(name: &'a str, container: &str) -> Option<(usize, &'a str)> {
    let rest = name.strip_prefix(container)?.strip_prefix('.')?;
    let (index, field) = rest.split_once('.')?;
    Some((index.parse().ok()?, field))
}

fn to_param<B: Backend, const D: usize>(
    name: &str,
    tensor: Tensor<B, D>,
) -> Result<ParamTensor, SlotError> {
    let shape = tensor.dims().to_vec();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .into_vec::<f32>()
        .map_err(|err| SlotError::Data {
            name: name.to_string(),
            reason: format!("{err:?}"),
        })?;
    Ok(ParamTensor::new(shape, values))
}

fn from_param<B: Backend, const D: usize>(tensor: &ParamTensor, device: &B::Device) -> Tensor<B, D> {
    Tensor::from_data(
        TensorData::new(tensor.values.clone(), tensor.shape.clone()),
        device,
    )
}
