use burn::{
    module::Ignored,
    nn::conv::{Conv2d, Conv2dConfig},
    prelude::*,
    tensor::activation::sigmoid,
};

use crate::{
    anchor::{AnchorSet, ANCHORS_PER_SCALE},
    module::{
        activation::ActivationKind,
        conv2d_norm::{Conv2dNorm, Conv2dNormConfig},
    },
};

/// Everything needed to turn raw head activations of one scale into boxes.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDecoder {
    pub xy_scale: f32,
    /// Anchor sizes relative to the input `[width, height]`.
    pub anchor_ratios: [[f32; 2]; ANCHORS_PER_SCALE],
    pub depth: usize,
}

impl ScaleDecoder {
    /// `raw` is `[batch, anchors * depth, grid_h, grid_w]`; the result is
    /// `[batch, grid_h, grid_w, anchors, depth]` with normalized `xywh`, then
    /// objectness and class probabilities.
    pub fn decode<B: Backend>(&self, raw: Tensor<B, 4>) -> Tensor<B, 5> {
        let [batch, channels, grid_h, grid_w] = raw.dims();
        assert_eq!(
            channels,
            ANCHORS_PER_SCALE * self.depth,
            "head emits {channels} channels, expected {} anchors of depth {}",
            ANCHORS_PER_SCALE,
            self.depth
        );
        let device = raw.device();
        let raw = raw
            .reshape([batch, ANCHORS_PER_SCALE, self.depth, grid_h, grid_w])
            .permute([0, 3, 4, 1, 2]);
        let part = |range: std::ops::Range<usize>| {
            raw.clone()
                .slice([0..batch, 0..grid_h, 0..grid_w, 0..ANCHORS_PER_SCALE, range])
        };

        let offsets: Vec<f32> = (0..grid_h)
            .flat_map(|row| (0..grid_w).flat_map(move |col| [col as f32, row as f32]))
            .collect();
        let grid = Tensor::<B, 5>::from_data(
            TensorData::new(offsets, [1, grid_h, grid_w, 1, 2]).convert::<B::FloatElem>(),
            &device,
        )
        .expand([batch, grid_h, grid_w, ANCHORS_PER_SCALE, 2]);
        let cell = Tensor::<B, 1>::from_floats([1. / grid_w as f32, 1. / grid_h as f32], &device)
            .reshape([1, 1, 1, 1, 2])
            .expand([batch, grid_h, grid_w, ANCHORS_PER_SCALE, 2]);
        let ratios: Vec<f32> = self.anchor_ratios.iter().flatten().copied().collect();
        let ratios = Tensor::<B, 5>::from_data(
            TensorData::new(ratios, [1, 1, 1, ANCHORS_PER_SCALE, 2]).convert::<B::FloatElem>(),
            &device,
        )
        .expand([batch, grid_h, grid_w, ANCHORS_PER_SCALE, 2]);

        let xy = (sigmoid(part(0..2)) * self.xy_scale - 0.5 * (self.xy_scale - 1.) + grid) * cell;
        let wh = part(2..4).exp() * ratios;
        let conf = sigmoid(part(4..5));
        let prob = sigmoid(part(5..self.depth));

        Tensor::cat(vec![xy, wh, conf, prob], 4)
    }
}

#[derive(Module, Debug)]
pub struct DetectionHead<B: Backend> {
    hidden: Conv2dNorm<B>,
    output: Conv2d<B>,
    decoder: Ignored<ScaleDecoder>,
}

impl<B: Backend> DetectionHead<B> {
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 5> {
        let raw = self.output.forward(self.hidden.forward(features));
        self.decoder.decode(raw)
    }
}

#[derive(Config, Debug)]
pub struct DetectionHeadConfig {
    pub channels: usize,
    pub scale: usize,
    pub num_classes: usize,
    /// `[width, height]` in pixels.
    pub input_size: [usize; 2],
}

impl DetectionHeadConfig {
    pub fn init<B: Backend>(&self, anchors: &AnchorSet, device: &B::Device) -> DetectionHead<B> {
        let depth = 5 + self.num_classes;

        DetectionHead {
            hidden: Conv2dNormConfig::same([self.channels, self.channels * 2], [3, 3])
                .with_activation(ActivationKind::LeakyRelu)
                .init(device),
            output: Conv2dConfig::new([self.channels * 2, ANCHORS_PER_SCALE * depth], [1, 1])
                .init(device),
            decoder: Ignored(ScaleDecoder {
                xy_scale: anchors.xy_scale(self.scale),
                anchor_ratios: anchors.ratios(self.scale, self.input_size),
                depth,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    fn decoder() -> ScaleDecoder {
        ScaleDecoder {
            xy_scale: 1.2,
            anchor_ratios: [[0.1, 0.2], [0.3, 0.4], [0.5, 0.6]],
            depth: 6,
        }
    }

    #[test]
    fn zero_activations_decode_to_cell_centres_and_anchor_sizes() {
        let device = Default::default();
        let decoded = decoder().decode(Tensor::<TestBackend, 4>::zeros([1, 18, 2, 4], &device));
        assert_eq!(decoded.dims(), [1, 2, 4, 3, 6]);

        let at = |row: usize, col: usize, anchor: usize| {
            decoded
                .clone()
                .slice([0..1, row..row + 1, col..col + 1, anchor..anchor + 1, 0..6])
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };

        let cell = at(1, 3, 2);
        assert!((cell[0] - 3.5 / 4.).abs() < 1e-6);
        assert!((cell[1] - 1.5 / 2.).abs() < 1e-6);
        assert!((cell[2] - 0.5).abs() < 1e-6);
        assert!((cell[3] - 0.6).abs() < 1e-6);
        assert!((cell[4] - 0.5).abs() < 1e-6);
        assert!((cell[5] - 0.5).abs() < 1e-6);

        let first = at(0, 0, 0);
        assert!((first[0] - 0.5 / 4.).abs() < 1e-6);
        assert!((first[2] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn head_emits_one_slot_per_anchor() {
        let device = Default::default();
        let head = DetectionHeadConfig::new(8, 0, 2, [64, 64])
            .init::<TestBackend>(&AnchorSet::default(), &device);
        let output = head.forward(Tensor::zeros([2, 8, 8, 8], &device));
        assert_eq!(output.dims(), [2, 8, 8, 3, 7]);
    }

    #[test]
    #[should_panic(expected = "head emits")]
    fn wrong_channel_count_panics() {
        decoder().decode(Tensor::<TestBackend, 4>::zeros([1, 17, 2, 2], &Default::default()));
    }
}
