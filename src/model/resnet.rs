use burn::{
    prelude::*,
    tensor::backend::AutodiffBackend,
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};
use nn::{
    loss::CrossEntropyLossConfig,
    pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    Dropout, DropoutConfig, Linear, LinearConfig,
};

use crate::{
    data::cifar::CifarBatch,
    error::{Result, TrainError},
    module::{
        conv2d_norm::{Conv2dNorm, Conv2dNormConfig},
        quant::{FakeQuant, LayerKind, QuantizationPolicy},
        residual::{Bottleneck, BottleneckConfig, SpatialKind},
    },
};

/// Bottleneck widths of the four stages; outputs are four times wider.
const STAGE_WIDTHS: [usize; 4] = [64, 128, 256, 512];

#[derive(Module, Debug)]
struct Classifier<B: Backend> {
    dropout: Dropout,
    linear: Linear<B>,
    quant: Option<FakeQuant>,
}

impl<B: Backend> Classifier<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(x);
        let Some(quant) = &self.quant else {
            return self.linear.forward(x);
        };

        let x = x.matmul(self.effective_weight());
        let x = match &self.linear.bias {
            Some(bias) => x + bias.val().unsqueeze::<2>(),
            None => x,
        };
        quant.forward(x)
    }

    /// `[d_input, d_output]`, on the 8-bit grid when fake-quantized.
    fn effective_weight(&self) -> Tensor<B, 2> {
        let weight = self.linear.weight.val();
        match &self.quant {
            Some(quant) => quant.forward(weight),
            None => weight,
        }
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    stem: Conv2dNorm<B>,
    blocks: Vec<Bottleneck<B>>,

    avg_pool: AdaptiveAvgPool2d,
    classifier: Classifier<B>,
}

impl<B: Backend> ResNet<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(x);
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));

        let x = self.avg_pool.forward(x);
        let x = x.flatten(1, 3);
        self.classifier.forward(x)
    }

    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);

        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

impl<B: AutodiffBackend> TrainStep<CifarBatch<B>, ClassificationOutput<B>> for ResNet<B> {
    fn step(&self, batch: CifarBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<CifarBatch<B>, ClassificationOutput<B>> for ResNet<B> {
    fn step(&self, batch: CifarBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

#[derive(Config, Debug)]
pub struct ResNetConfig {
    #[config(default = 10)]
    pub classes: usize,

    /// Bottleneck count per stage; `[3, 4, 6, 3]` is ResNet-50.
    #[config(default = "vec![3, 4, 6, 3]")]
    pub blocks: Vec<usize>,

    /// Factor every 3×3 convolution into 3×1 and 1×3.
    #[config(default = false)]
    pub asymmetric: bool,

    /// Replace every 3×3 convolution with a depthwise-separable pair.
    /// Takes precedence over `asymmetric`.
    #[config(default = false)]
    pub depthwise: bool,

    #[config(default = "QuantizationPolicy::new()")]
    pub quantization: QuantizationPolicy,

    #[config(default = 0.0)]
    pub dropout: f64,

    /// Divides every stage width; 1 is the full network.
    #[config(default = 1)]
    pub width_divisor: usize,
}

impl ResNetConfig {
    pub fn spatial_kind(&self) -> SpatialKind {
        if self.depthwise {
            SpatialKind::DepthwiseSeparable
        } else if self.asymmetric {
            SpatialKind::Asymmetric
        } else {
            SpatialKind::Standard
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ResNet<B>> {
        if self.blocks.len() != STAGE_WIDTHS.len() || self.blocks.contains(&0) {
            return Err(TrainError::Config(format!(
                "expected {} non-empty stages, got {:?}",
                STAGE_WIDTHS.len(),
                self.blocks
            )));
        }
        if self.width_divisor == 0 || STAGE_WIDTHS[0] % self.width_divisor != 0 {
            return Err(TrainError::Config(format!(
                "width divisor {} does not divide {}",
                self.width_divisor, STAGE_WIDTHS[0]
            )));
        }

        let policy = &self.quantization;
        let spatial = self.spatial_kind();
        let mut channels = STAGE_WIDTHS[0] / self.width_divisor;

        // CIFAR stem: no downsampling before the first stage
        let stem = Conv2dNormConfig::same([3, channels], [3, 3])
            .with_wrapping(policy.resolve(LayerKind::Conv2d))
            .init(device);

        let mut blocks = vec![];
        for (stage, (&width, &count)) in STAGE_WIDTHS.iter().zip(&self.blocks).enumerate() {
            let width = width / self.width_divisor;
            for index in 0..count {
                let stride = if stage > 0 && index == 0 { 2 } else { 1 };
                let config = BottleneckConfig::new([channels, width], stride).with_spatial(spatial);
                channels = config.output_channels();
                blocks.push(config.init(policy, device));
            }
        }

        let classifier = Classifier {
            dropout: DropoutConfig::new(self.dropout).init(),
            linear: LinearConfig::new(channels, self.classes).init(device),
            quant: policy.resolve(LayerKind::Dense).init(),
        };

        Ok(ResNet {
            stem,
            blocks,
            avg_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            classifier,
        })
    }
}
