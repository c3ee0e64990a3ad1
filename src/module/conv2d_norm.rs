use burn::{
    module::{Ignored, Module},
    nn::conv::Conv2d,
    prelude::*,
    tensor::{module::conv2d, ops::ConvOptions},
};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, PaddingConfig2d};

use super::{
    activation::ActivationKind,
    quant::{FakeQuant, Wrapping},
};

#[derive(Module, Debug)]
pub struct Conv2dNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: Ignored<ActivationKind>,
    quant: Option<FakeQuant>,
}

impl<B: Backend> Conv2dNorm<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.quant {
            Some(_) => conv2d(
                x,
                self.effective_weight(),
                self.conv.bias.as_ref().map(|bias| bias.val()),
                self.conv_options(),
            ),
            None => self.conv.forward(x),
        };
        let x = self.activation.forward(self.norm.forward(x));

        match &self.quant {
            Some(quant) => quant.forward(x),
            None => x,
        }
    }

    /// The kernel the convolution applies, on the 8-bit grid when fake-quantized.
    pub fn effective_weight(&self) -> Tensor<B, 4> {
        let weight = self.conv.weight.val();
        match &self.quant {
            Some(quant) => quant.forward(weight),
            None => weight,
        }
    }

    fn conv_options(&self) -> ConvOptions<2> {
        let [kernel_h, kernel_w] = self.conv.kernel_size;
        let padding = match &*self.conv.padding {
            PaddingConfig2d::Explicit(h, w) => [*h, *w],
            PaddingConfig2d::Valid => [0, 0],
            PaddingConfig2d::Same => [kernel_h / 2, kernel_w / 2],
        };

        ConvOptions::new(self.conv.stride, padding, self.conv.dilation, self.conv.groups)
    }
}

#[derive(Config, Debug)]
pub struct Conv2dNormConfig {
    channels: [usize; 2],

    kernel_size: [usize; 2],

    stride: [usize; 2],

    padding: PaddingConfig2d,

    #[config(default = "1")]
    groups: usize,

    #[config(default = false)]
    bias: bool,

    #[config(default = "ActivationKind::Relu")]
    activation: ActivationKind,

    #[config(default = "Wrapping::Plain")]
    wrapping: Wrapping,
}

impl Conv2dNormConfig {
    /// Stride 1, padding that keeps the spatial size for odd kernels.
    pub fn same(channels: [usize; 2], kernel_size: [usize; 2]) -> Self {
        Self::new(
            channels,
            kernel_size,
            [1, 1],
            PaddingConfig2d::Explicit(kernel_size[0] / 2, kernel_size[1] / 2),
        )
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Conv2dNorm<B> {
        Conv2dNorm {
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_stride(self.stride)
                .with_padding(self.padding.clone())
                .with_groups(self.groups)
                .with_bias(self.bias)
                .init(device),
            norm: BatchNormConfig::new(self.channels[1]).init(device),
            activation: Ignored(self.activation),
            quant: self.wrapping.init(),
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    use super::*;

    type TestBackend = NdArray<f32>;

    fn wrapped(config: Conv2dNormConfig) -> Conv2dNorm<TestBackend> {
        config
            .with_wrapping(Wrapping::FakeQuantized)
            .init(&Default::default())
    }

    #[test]
    fn strided_conv_halves_the_grid() {
        let device = Default::default();
        let block = Conv2dNormConfig::new([3, 8], [3, 3], [2, 2], PaddingConfig2d::Explicit(1, 1))
            .with_activation(ActivationKind::Mish)
            .init::<TestBackend>(&device);

        let output = block.forward(Tensor::zeros([2, 3, 16, 12], &device));
        assert_eq!(output.dims(), [2, 8, 8, 6]);
    }

    #[test]
    fn wrapping_adds_a_fake_quant_stage() {
        let device = Default::default();
        let plain = Conv2dNormConfig::same([4, 4], [1, 1]).init::<TestBackend>(&device);
        let wrapped = Conv2dNormConfig::same([4, 4], [1, 1])
            .with_wrapping(Wrapping::FakeQuantized)
            .init::<TestBackend>(&device);

        assert!(plain.quant.is_none());
        assert!(wrapped.quant.is_some());
    }

    #[test]
    fn wrapped_kernel_lies_on_the_int8_grid() {
        let block = wrapped(Conv2dNormConfig::same([4, 8], [3, 3]));
        let weight = block.effective_weight().into_data().to_vec::<f32>().unwrap();
        let raw = block.conv.weight.val().into_data().to_vec::<f32>().unwrap();

        let scale = weight.iter().fold(0f32, |max, w| max.max(w.abs())) / 127.;
        assert!(scale > 0.);
        for w in &weight {
            let level = w / scale;
            assert!((level - level.round()).abs() < 1e-3, "{w} is off the grid");
        }
        assert_ne!(raw, weight);
    }

    #[test]
    fn plain_kernel_is_used_as_is() {
        let block = Conv2dNormConfig::same([4, 8], [3, 3]).init::<TestBackend>(&Default::default());
        block
            .effective_weight()
            .into_data()
            .assert_eq(&block.conv.weight.val().into_data(), true);
    }

    #[test]
    fn functional_conv_matches_the_layer_geometry() {
        let device = Default::default();
        for config in [
            Conv2dNormConfig::new([3, 4], [3, 3], [2, 2], PaddingConfig2d::Explicit(1, 1)),
            Conv2dNormConfig::new([3, 4], [3, 1], [2, 1], PaddingConfig2d::Explicit(1, 0)),
            Conv2dNormConfig::new([4, 4], [3, 3], [1, 1], PaddingConfig2d::Explicit(1, 1))
                .with_groups(4),
            Conv2dNormConfig::new([3, 4], [1, 1], [2, 2], PaddingConfig2d::Valid),
        ] {
            let block = config.init::<TestBackend>(&device);
            let [_, channels_per_group, _, _] = block.conv.weight.val().dims();
            let input = Tensor::<TestBackend, 4>::random(
                [1, channels_per_group * block.conv.groups, 9, 7],
                burn::tensor::Distribution::Default,
                &device,
            );

            let expected = block.conv.forward(input.clone());
            let actual = conv2d(input, block.conv.weight.val(), None, block.conv_options());
            expected.into_data().assert_approx_eq(&actual.into_data(), 4);
        }
    }

    #[test]
    fn wrapped_kernel_still_receives_gradients() {
        type B = Autodiff<TestBackend>;
        let device = Default::default();
        let block = Conv2dNormConfig::same([2, 3], [3, 3])
            .with_wrapping(Wrapping::FakeQuantized)
            .init::<B>(&device);

        let input = Tensor::<B, 4>::random([2, 2, 5, 5], burn::tensor::Distribution::Default, &device);
        let grads = block.forward(input).sum().backward();

        assert!(block.conv.weight.val().grad(&grads).is_some());
    }
}
