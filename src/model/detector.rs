use burn::{
    module::Ignored,
    prelude::*,
    tensor::backend::AutodiffBackend,
    train::{TrainOutput, TrainStep, ValidStep},
};
use nn::PaddingConfig2d;

use crate::{
    anchor::{AnchorConfig, NUM_SCALES},
    data::detection::DetectionBatch,
    driver::{scalar, StepOutput},
    error::{Result, TrainError},
    loss::{DetectionLoss, YoloLoss, YoloLossConfig},
    model::head::{DetectionHead, DetectionHeadConfig},
    module::{
        activation::ActivationKind,
        conv2d_norm::{Conv2dNorm, Conv2dNormConfig},
        residual::{DarkResidual, DarkResidualConfig},
    },
};

/// Residual units per downsampling stage, finest first.
const STAGE_DEPTHS: [usize; 5] = [1, 2, 2, 2, 1];

#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    downsample: Conv2dNorm<B>,
    blocks: Vec<DarkResidual<B>>,
}

impl<B: Backend> Stage<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.downsample.forward(x);
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

/// Top-down merge of a coarse feature map into the next finer one.
#[derive(Module, Debug)]
pub struct Lateral<B: Backend> {
    reduce: Conv2dNorm<B>,
    merge: Conv2dNorm<B>,
}

impl<B: Backend> Lateral<B> {
    fn forward(&self, coarse: Tensor<B, 4>, fine: Tensor<B, 4>) -> Tensor<B, 4> {
        let up = upsample_nearest(self.reduce.forward(coarse));
        self.merge.forward(Tensor::cat(vec![up, fine], 1))
    }
}

fn upsample_nearest<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, channels, height, width] = x.dims();
    x.reshape([batch, channels, height, 1, width, 1])
        .expand([batch, channels, height, 2, width, 2])
        .reshape([batch, channels, height * 2, width * 2])
}

#[derive(Clone, Debug)]
pub struct DetectionOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub iou: Tensor<B, 1>,
    pub conf: Tensor<B, 1>,
    pub prob: Tensor<B, 1>,
}

impl<B: Backend> From<DetectionLoss<B>> for DetectionOutput<B> {
    fn from(loss: DetectionLoss<B>) -> Self {
        Self {
            loss: loss.total,
            iou: loss.iou,
            conf: loss.conf,
            prob: loss.prob,
        }
    }
}

impl<B: Backend> StepOutput for DetectionOutput<B> {
    fn loss(&self) -> f64 {
        scalar(&self.loss)
    }

    fn components(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("iou", scalar(&self.iou)),
            ("conf", scalar(&self.conf)),
            ("prob", scalar(&self.prob)),
        ]
    }
}

/// Darknet-style backbone, a top-down feature pyramid and one head per stride.
#[derive(Module, Debug)]
pub struct Detector<B: Backend> {
    stem: Conv2dNorm<B>,
    stages: Vec<Stage<B>>,
    neck_top: Conv2dNorm<B>,
    laterals: Vec<Lateral<B>>,
    heads: Vec<DetectionHead<B>>,
    loss: Ignored<YoloLoss>,
}

impl<B: Backend> Detector<B> {
    /// Decoded predictions, finest scale first.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 5>> {
        let mut x = self.stem.forward(images);
        let mut features = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            x = stage.forward(x);
            features.push(x.clone());
        }

        // strides 8, 16, 32 are the last three stages
        let mut pyramid = features.split_off(features.len() - NUM_SCALES);
        let mut coarse = self.neck_top.forward(pyramid.remove(NUM_SCALES - 1));
        let mut levels = vec![coarse.clone()];
        for (lateral, fine) in self.laterals.iter().zip(pyramid.into_iter().rev()) {
            coarse = lateral.forward(coarse, fine);
            levels.push(coarse.clone());
        }
        levels.reverse();

        self.heads
            .iter()
            .zip(levels)
            .map(|(head, level)| head.forward(level))
            .collect()
    }

    pub fn forward_loss(&self, batch: DetectionBatch<B>) -> DetectionOutput<B> {
        let predictions = self.forward(batch.images);
        self.loss.forward(&predictions, &batch.targets).into()
    }
}

impl<B: AutodiffBackend> TrainStep<DetectionBatch<B>, DetectionOutput<B>> for Detector<B> {
    fn step(&self, batch: DetectionBatch<B>) -> TrainOutput<DetectionOutput<B>> {
        let item = self.forward_loss(batch);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<DetectionBatch<B>, DetectionOutput<B>> for Detector<B> {
    fn step(&self, batch: DetectionBatch<B>) -> DetectionOutput<B> {
        self.forward_loss(batch)
    }
}

#[derive(Config, Debug)]
pub struct DetectorConfig {
    pub num_classes: usize,

    /// `[width, height]` in pixels.
    pub input_size: [usize; 2],

    /// Channels of the stem; every stage doubles it.
    #[config(default = 32)]
    pub width: usize,

    #[config(default = "AnchorConfig::new()")]
    pub anchors: AnchorConfig,

    #[config(default = "YoloLossConfig::new()")]
    pub loss: YoloLossConfig,
}

impl DetectorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Detector<B>> {
        let anchors = self.anchors.init()?;
        let strides = anchors.strides();
        let downsampling = 1 << STAGE_DEPTHS.len();
        if strides != [downsampling / 4, downsampling / 2, downsampling] {
            return Err(TrainError::ShapeMismatch(format!(
                "anchor strides {strides:?} do not match the feature strides of a {}-stage backbone",
                STAGE_DEPTHS.len()
            )));
        }
        anchors.grid_sizes(self.input_size)?;
        let loss = self.loss.init(self.num_classes)?;

        let stem = Conv2dNormConfig::same([3, self.width], [3, 3])
            .with_activation(ActivationKind::Mish)
            .init(device);

        let mut channels = self.width;
        let mut stage_channels = Vec::with_capacity(STAGE_DEPTHS.len());
        let stages = STAGE_DEPTHS
            .iter()
            .map(|&depth| {
                let stage = Stage {
                    downsample: Conv2dNormConfig::new(
                        [channels, channels * 2],
                        [3, 3],
                        [2, 2],
                        PaddingConfig2d::Explicit(1, 1),
                    )
                    .with_activation(ActivationKind::Mish)
                    .init(device),
                    blocks: (0..depth)
                        .map(|_| DarkResidualConfig::new(channels * 2).init(device))
                        .collect(),
                };
                channels *= 2;
                stage_channels.push(channels);
                stage
            })
            .collect();

        let pyramid = &stage_channels[stage_channels.len() - NUM_SCALES..];
        // neck widths: half of each backbone level
        let neck: Vec<usize> = pyramid.iter().map(|c| c / 2).collect();

        let neck_top = Conv2dNormConfig::same([pyramid[2], neck[2]], [1, 1])
            .with_activation(ActivationKind::LeakyRelu)
            .init(device);
        let laterals = (0..NUM_SCALES - 1)
            .rev()
            .map(|level| Lateral {
                reduce: Conv2dNormConfig::same([neck[level + 1], neck[level]], [1, 1])
                    .with_activation(ActivationKind::LeakyRelu)
                    .init(device),
                merge: Conv2dNormConfig::same([neck[level] + pyramid[level], neck[level]], [3, 3])
                    .with_activation(ActivationKind::LeakyRelu)
                    .init(device),
            })
            .collect();
        let heads: Vec<_> = (0..NUM_SCALES)
            .map(|scale| {
                DetectionHeadConfig::new(neck[scale], scale, self.num_classes, self.input_size)
                    .init(&anchors, device)
            })
            .collect();

        Ok(Detector {
            stem,
            stages,
            neck_top,
            laterals,
            heads,
            loss: Ignored(loss),
        })
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    use super::*;
    use crate::{
        anchor::AnchorSet,
        data::{annotation::BoxLabel, detection::DetectionTargets},
        target::TargetEncoder,
    };

    type TestBackend = NdArray<f32>;

    fn config() -> DetectorConfig {
        DetectorConfig::new(2, [64, 32]).with_width(4)
    }

    #[test]
    fn one_prediction_per_stride() {
        let device = Default::default();
        let detector = config().init::<TestBackend>(&device).unwrap();
        let predictions = detector.forward(Tensor::zeros([1, 3, 32, 64], &device));

        let dims: Vec<_> = predictions.iter().map(|p| p.dims()).collect();
        assert_eq!(dims, vec![[1, 4, 8, 3, 7], [1, 2, 4, 3, 7], [1, 1, 2, 3, 7]]);
    }

    #[test]
    fn indivisible_input_is_a_shape_mismatch() {
        let result = DetectorConfig::new(2, [60, 32]).init::<TestBackend>(&Default::default());
        assert!(matches!(result, Err(TrainError::ShapeMismatch(_))));
    }

    #[test]
    fn foreign_strides_are_a_shape_mismatch() {
        let anchors = AnchorConfig::new().with_strides(vec![4, 8, 16]);
        let result = config()
            .with_anchors(anchors)
            .init::<TestBackend>(&Default::default());
        assert!(matches!(result, Err(TrainError::ShapeMismatch(_))));
    }

    #[test]
    fn train_step_produces_a_finite_loss() {
        type B = Autodiff<TestBackend>;
        let device = Default::default();
        let detector = config().init::<B>(&device).unwrap();

        let encoder = TargetEncoder::new(AnchorSet::default(), [64, 32], 2, 0.05).unwrap();
        let label = BoxLabel { x: 0.5, y: 0.5, w: 0.4, h: 0.6, class_id: 0 };
        let targets = DetectionTargets::from_encoded(&[encoder.encode(std::path::Path::new("img.jpg"), &[label]).unwrap()], &device);
        let batch = DetectionBatch {
            images: Tensor::random([1, 3, 32, 64], burn::tensor::Distribution::Default, &device),
            targets,
        };

        let output = TrainStep::step(&detector, batch);
        let loss: f32 = output.item.loss.into_scalar();
        assert!(loss.is_finite() && loss > 0.);
    }
}
