use burn::prelude::*;
use nn::PaddingConfig2d;

use super::{
    activation::ActivationKind,
    conv2d_norm::{Conv2dNorm, Conv2dNormConfig},
    quant::{LayerKind, QuantizationPolicy},
};

/// Darknet residual unit: 1×1 squeeze to half width, 3×3 back, added to the input.
#[derive(Module, Debug)]
pub struct DarkResidual<B: Backend> {
    squeeze: Conv2dNorm<B>,
    expand: Conv2dNorm<B>,
}

impl<B: Backend> DarkResidual<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = self.expand.forward(self.squeeze.forward(x.clone()));
        x + residual
    }
}

#[derive(Config, Debug)]
pub struct DarkResidualConfig {
    pub channels: usize,

    #[config(default = "ActivationKind::Mish")]
    pub activation: ActivationKind,
}

impl DarkResidualConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DarkResidual<B> {
        let hidden = (self.channels / 2).max(1);

        DarkResidual {
            squeeze: Conv2dNormConfig::same([self.channels, hidden], [1, 1])
                .with_activation(self.activation)
                .init(device),
            expand: Conv2dNormConfig::same([hidden, self.channels], [3, 3])
                .with_activation(self.activation)
                .init(device),
        }
    }
}

/// How the 3×3 stage of a bottleneck is factored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SpatialKind {
    Standard,
    /// 3×1 followed by 1×3.
    Asymmetric,
    /// Per-channel 3×3 followed by a 1×1 mix.
    DepthwiseSeparable,
}

#[derive(Module, Debug)]
pub struct ConvPair<B: Backend> {
    first: Conv2dNorm<B>,
    second: Conv2dNorm<B>,
}

impl<B: Backend> ConvPair<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.second.forward(self.first.forward(x))
    }
}

#[derive(Module, Debug)]
pub enum SpatialConv<B: Backend> {
    Standard(Conv2dNorm<B>),
    Asymmetric(ConvPair<B>),
    DepthwiseSeparable(ConvPair<B>),
}

impl<B: Backend> SpatialConv<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            SpatialConv::Standard(conv) => conv.forward(x),
            SpatialConv::Asymmetric(pair) | SpatialConv::DepthwiseSeparable(pair) => pair.forward(x),
        }
    }
}

/// ResNet bottleneck: 1×1 reduce, spatial stage, 1×1 expand by [`EXPANSION`].
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    reduce: Conv2dNorm<B>,
    spatial: SpatialConv<B>,
    expand: Conv2dNorm<B>,
    shortcut: Option<Conv2dNorm<B>>,
}

pub const EXPANSION: usize = 4;

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.shortcut {
            Some(shortcut) => shortcut.forward(x.clone()),
            None => x.clone(),
        };

        let x = self.reduce.forward(x);
        let x = self.spatial.forward(x);
        let x = self.expand.forward(x);

        ActivationKind::Relu.forward(x + identity)
    }
}

#[derive(Config, Debug)]
pub struct BottleneckConfig {
    /// Input channels and bottleneck width; the output has `width * EXPANSION`.
    pub channels: [usize; 2],

    pub stride: usize,

    #[config(default = "SpatialKind::Standard")]
    pub spatial: SpatialKind,
}

impl BottleneckConfig {
    pub fn output_channels(&self) -> usize {
        self.channels[1] * EXPANSION
    }

    pub fn init<B: Backend>(&self, policy: &QuantizationPolicy, device: &B::Device) -> Bottleneck<B> {
        let [input, width] = self.channels;
        let output = self.output_channels();
        let stride = [self.stride, self.stride];
        let conv = policy.resolve(LayerKind::Conv2d);

        let spatial = match self.spatial {
            SpatialKind::Standard => SpatialConv::Standard(
                Conv2dNormConfig::new([width, width], [3, 3], stride, PaddingConfig2d::Explicit(1, 1))
                    .with_wrapping(conv)
                    .init(device),
            ),
            SpatialKind::Asymmetric => SpatialConv::Asymmetric(ConvPair {
                first: Conv2dNormConfig::new(
                    [width, width],
                    [3, 1],
                    [self.stride, 1],
                    PaddingConfig2d::Explicit(1, 0),
                )
                .with_wrapping(conv)
                .init(device),
                second: Conv2dNormConfig::new(
                    [width, width],
                    [1, 3],
                    [1, self.stride],
                    PaddingConfig2d::Explicit(0, 1),
                )
                .with_wrapping(conv)
                .init(device),
            }),
            SpatialKind::DepthwiseSeparable => {
                let separable = policy.resolve(LayerKind::SeparableConv2d);
                SpatialConv::DepthwiseSeparable(ConvPair {
                    first: Conv2dNormConfig::new(
                        [width, width],
                        [3, 3],
                        stride,
                        PaddingConfig2d::Explicit(1, 1),
                    )
                    .with_groups(width)
                    .with_wrapping(separable)
                    .init(device),
                    second: Conv2dNormConfig::same([width, width], [1, 1])
                        .with_wrapping(separable)
                        .init(device),
                })
            }
        };

        let shortcut = (self.stride != 1 || input != output).then(|| {
            Conv2dNormConfig::new([input, output], [1, 1], stride, PaddingConfig2d::Valid)
                .with_activation(ActivationKind::Identity)
                .with_wrapping(conv)
                .init(device)
        });

        Bottleneck {
            reduce: Conv2dNormConfig::same([input, width], [1, 1])
                .with_wrapping(conv)
                .init(device),
            spatial,
            expand: Conv2dNormConfig::same([width, output], [1, 1])
                .with_activation(ActivationKind::Identity)
                .with_wrapping(conv)
                .init(device),
            shortcut,
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn dark_residual_keeps_shape() {
        let device = Default::default();
        let block = DarkResidualConfig::new(8).init::<TestBackend>(&device);
        let output = block.forward(Tensor::ones([1, 8, 6, 6], &device));
        assert_eq!(output.dims(), [1, 8, 6, 6]);
    }

    #[test]
    fn every_spatial_kind_downsamples_alike() {
        let device = Default::default();
        for kind in [
            SpatialKind::Standard,
            SpatialKind::Asymmetric,
            SpatialKind::DepthwiseSeparable,
        ] {
            let block = BottleneckConfig::new([16, 8], 2)
                .with_spatial(kind)
                .init::<TestBackend>(&QuantizationPolicy::new(), &device);
            let output = block.forward(Tensor::ones([2, 16, 8, 8], &device));
            assert_eq!(output.dims(), [2, 32, 4, 4], "{kind:?}");
        }
    }

    #[test]
    fn identity_shortcut_when_shapes_match() {
        let device = Default::default();
        let config = BottleneckConfig::new([32, 8], 1);
        let block = config.init::<TestBackend>(&QuantizationPolicy::new(), &device);
        assert!(block.shortcut.is_none());
        assert_eq!(config.output_channels(), 32);
    }
}
