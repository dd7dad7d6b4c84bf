//! Layer parameter types and the closed layer classification.

use ndarray::{Array1, Array4};
use serde::{Deserialize, Serialize};

/// A 2D convolution layer.
///
/// `weight` has shape `[out_channels, in_channels / groups, kH, kW]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conv2d {
    pub weight: Array4<f32>,
    pub bias: Option<Array1<f32>>,
    pub groups: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2d {
    /// Creates a stride-1, unpadded, ungrouped convolution.
    pub fn new(weight: Array4<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            weight,
            bias,
            groups: 1,
            stride: 1,
            padding: 0,
        }
    }

    /// Builder-style setter for the group count.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Builder-style setter for stride and zero padding.
    pub fn with_geometry(mut self, stride: usize, padding: usize) -> Self {
        self.stride = stride;
        self.padding = padding;
        self
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn in_channels(&self) -> usize {
        self.weight.shape()[1] * self.groups
    }

    /// `groups == 1`.
    pub fn is_normal(&self) -> bool {
        self.groups == 1
    }

    /// `groups == in_channels == out_channels`.
    pub fn is_depthwise(&self) -> bool {
        self.groups == self.in_channels() && self.groups == self.out_channels()
    }
}

/// Inference-mode batch normalization over the channel axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm2d {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub eps: f32,
}

impl BatchNorm2d {
    pub fn num_features(&self) -> usize {
        self.weight.len()
    }
}

/// Pointwise activation functions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activation {
    Relu,
    LeakyRelu { negative_slope: f32 },
    /// Per-channel (or single shared) learned negative slope.
    PRelu { weight: Array1<f32> },
    Identity,
    Sigmoid,
    Tanh,
}

impl Activation {
    /// Whether `f(k * x) == k * f(x)` holds for every `k > 0`.
    pub fn is_positive_homogeneous(&self) -> bool {
        matches!(
            self,
            Self::Relu | Self::LeakyRelu { .. } | Self::PRelu { .. } | Self::Identity
        )
    }

    /// Applies the activation to a single value of the given channel.
    pub fn apply(&self, x: f32, channel: usize) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::LeakyRelu { negative_slope } => {
                if x >= 0.0 {
                    x
                } else {
                    x * negative_slope
                }
            }
            Self::PRelu { weight } => {
                if x >= 0.0 {
                    x
                } else {
                    let slope = if weight.len() == 1 {
                        weight[0]
                    } else {
                        weight[channel]
                    };
                    x * slope
                }
            }
            Self::Identity => x,
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
        }
    }
}

/// Window geometry shared by max and average pooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool2d {
    pub kernel: usize,
    pub stride: usize,
}

/// The operation a graph node performs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "snake_case")]
pub enum Op {
    /// Graph input placeholder.
    Input,
    Conv2d(Conv2d),
    BatchNorm2d(BatchNorm2d),
    Activation(Activation),
    /// Elementwise sum of all inputs.
    Add,
    /// Concatenation along the channel axis.
    Concat,
    MaxPool2d(Pool2d),
    AvgPool2d(Pool2d),
}

impl Op {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Input => "Input",
            Self::Conv2d(_) => "Conv2d",
            Self::BatchNorm2d(_) => "BatchNorm2d",
            Self::Activation(_) => "Activation",
            Self::Add => "Add",
            Self::Concat => "Concat",
            Self::MaxPool2d(_) => "MaxPool2d",
            Self::AvgPool2d(_) => "AvgPool2d",
        }
    }
}

/// Layer classification consulted by group discovery.
///
/// Computed once when a node enters the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    /// Convolution with `groups == 1`.
    NormalConv,
    /// Convolution with one filter per channel.
    DepthwiseConv,
    /// Activation through which per-channel scales commute.
    ScaleInvariantActivation,
    Other,
}

impl LayerKind {
    pub fn classify(op: &Op) -> Self {
        match op {
            Op::Conv2d(conv) if conv.is_normal() => Self::NormalConv,
            Op::Conv2d(conv) if conv.is_depthwise() => Self::DepthwiseConv,
            Op::Activation(act) if act.is_positive_homogeneous() => {
                Self::ScaleInvariantActivation
            }
            _ => Self::Other,
        }
    }

    /// Normal or depthwise convolution.
    pub fn is_conv(self) -> bool {
        matches!(self, Self::NormalConv | Self::DepthwiseConv)
    }
}
