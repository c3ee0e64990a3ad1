use std::path::{Path, PathBuf};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use image::{imageops::FilterType, DynamicImage};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::{
    data::annotation::{read_annotations, Annotation, AnnotationFormat, BoxLabel},
    error::Result,
    target::{EncodedTargets, TargetEncoder},
};

const CHANNEL_COUNT: usize = 3;
const PAD_VALUE: f32 = 0.5;

/// Aspect-preserving resize into a fixed canvas, padding the remainder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub resized: [usize; 2],
    pub offset: [usize; 2],
    pub canvas: [usize; 2],
}

impl Letterbox {
    /// Sizes are `[width, height]`.
    pub fn fit(source: [usize; 2], canvas: [usize; 2]) -> Self {
        let scale = (canvas[0] as f32 / source[0] as f32).min(canvas[1] as f32 / source[1] as f32);
        let resized = [
            ((source[0] as f32 * scale).round() as usize).clamp(1, canvas[0]),
            ((source[1] as f32 * scale).round() as usize).clamp(1, canvas[1]),
        ];
        let offset = [(canvas[0] - resized[0]) / 2, (canvas[1] - resized[1]) / 2];

        Self {
            scale,
            resized,
            offset,
            canvas,
        }
    }

    /// Maps a box normalized to the source image onto the canvas.
    pub fn map_box(&self, label: &BoxLabel) -> BoxLabel {
        let [cw, ch] = self.canvas.map(|v| v as f32);
        let [rw, rh] = self.resized.map(|v| v as f32);
        let [dx, dy] = self.offset.map(|v| v as f32);

        BoxLabel {
            x: (label.x * rw + dx) / cw,
            y: (label.y * rh + dy) / ch,
            w: label.w * rw / cw,
            h: label.h * rh / ch,
            class_id: label.class_id,
        }
    }

    /// Channel-major `[3, height, width]` pixels in `[0, 1]`.
    pub fn apply(&self, image: &DynamicImage) -> Vec<f32> {
        let [cw, ch] = self.canvas;
        let resized = image
            .resize_exact(self.resized[0] as u32, self.resized[1] as u32, FilterType::Triangle)
            .to_rgb8();

        let mut pixels = vec![PAD_VALUE; CHANNEL_COUNT * ch * cw];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (col, row) = (x as usize + self.offset[0], y as usize + self.offset[1]);
            for (channel, value) in pixel.0.iter().enumerate() {
                pixels[channel * ch * cw + row * cw + col] = *value as f32 / 255.;
            }
        }
        pixels
    }
}

#[derive(Debug, Clone)]
pub struct DetectionItem {
    pub image_path: PathBuf,
    pub boxes: Vec<BoxLabel>,
}

impl From<Annotation> for DetectionItem {
    fn from(annotation: Annotation) -> Self {
        Self {
            image_path: annotation.image_path,
            boxes: annotation.boxes,
        }
    }
}

pub struct DetectionDataset {
    pub dataset: InMemDataset<DetectionItem>,
}

impl Dataset<DetectionItem> for DetectionDataset {
    fn get(&self, index: usize) -> Option<DetectionItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl DetectionDataset {
    pub fn load(
        annotation_path: &Path,
        format: AnnotationFormat,
        image_prefix: Option<&Path>,
        num_classes: usize,
    ) -> Result<Self> {
        let items = read_annotations(annotation_path, format, image_prefix, num_classes)?
            .into_iter()
            .map(DetectionItem::from)
            .collect();

        Ok(Self::from_items(items))
    }

    pub fn from_items(items: Vec<DetectionItem>) -> Self {
        Self {
            dataset: InMemDataset::new(items),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DetectionTargets<B: Backend> {
    /// `[batch, grid_h, grid_w, anchors, 5 + classes]` per scale.
    pub scales: Vec<Tensor<B, 5>>,
    /// `[batch, max_boxes, 4]`, zero padded.
    pub boxes: Tensor<B, 3>,
    /// `[batch, max_boxes]`, 1 where `boxes` holds a real box.
    pub box_mask: Tensor<B, 2>,
}

impl<B: Backend> DetectionTargets<B> {
    pub fn from_encoded(encoded: &[EncodedTargets], device: &B::Device) -> Self {
        let batch_size = encoded.len();
        let scale_count = encoded.first().map_or(0, |targets| targets.scales.len());

        let scales = (0..scale_count)
            .map(|scale| {
                let (grid_h, grid_w, anchors, depth) = encoded[0].scales[scale].dim();
                let values: Vec<f32> = encoded
                    .iter()
                    .flat_map(|targets| targets.scales[scale].iter().copied())
                    .collect();
                Tensor::from_data(
                    TensorData::new(values, [batch_size, grid_h, grid_w, anchors, depth])
                        .convert::<B::FloatElem>(),
                    device,
                )
            })
            .collect();

        let max_boxes = encoded
            .iter()
            .map(|targets| targets.boxes.len())
            .max()
            .unwrap_or(0)
            .max(1);
        let mut boxes = vec![0f32; batch_size * max_boxes * 4];
        let mut mask = vec![0f32; batch_size * max_boxes];
        for (item, targets) in encoded.iter().enumerate() {
            for (slot, xywh) in targets.boxes.iter().enumerate() {
                let base = (item * max_boxes + slot) * 4;
                boxes[base..base + 4].copy_from_slice(xywh);
                mask[item * max_boxes + slot] = 1.;
            }
        }

        Self {
            scales,
            boxes: Tensor::from_data(
                TensorData::new(boxes, [batch_size, max_boxes, 4]).convert::<B::FloatElem>(),
                device,
            ),
            box_mask: Tensor::from_data(
                TensorData::new(mask, [batch_size, max_boxes]).convert::<B::FloatElem>(),
                device,
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DetectionBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: DetectionTargets<B>,
}

#[derive(Clone)]
pub struct DetectionBatcher<B: Backend> {
    device: B::Device,
    encoder: TargetEncoder,
    input_size: [usize; 2],
}

impl<B: Backend> DetectionBatcher<B> {
    /// `input_size` is `[width, height]`.
    pub fn new(device: B::Device, encoder: TargetEncoder, input_size: [usize; 2]) -> Self {
        Self {
            device,
            encoder,
            input_size,
        }
    }

    fn prepare(&self, item: &DetectionItem) -> (Vec<f32>, EncodedTargets) {
        let image = image::open(&item.image_path).unwrap_or_else(|err| {
            panic!("failed to decode {}: {err}", item.image_path.display())
        });
        let letterbox = Letterbox::fit(
            [image.width() as usize, image.height() as usize],
            self.input_size,
        );

        let boxes: Vec<_> = item.boxes.iter().map(|b| letterbox.map_box(b)).collect();
        let targets = self.encoder.encode(&item.image_path, &boxes).unwrap_or_else(|err| {
            panic!("failed to encode targets of {}: {err}", item.image_path.display())
        });

        (letterbox.apply(&image), targets)
    }
}

impl<B: Backend> Batcher<DetectionItem, DetectionBatch<B>> for DetectionBatcher<B> {
    fn batch(&self, items: Vec<DetectionItem>) -> DetectionBatch<B> {
        let [width, height] = self.input_size;
        let prepared: Vec<_> = items.par_iter().map(|item| self.prepare(item)).collect();
        let (pixels, targets): (Vec<_>, Vec<_>) = prepared.into_iter().unzip();

        let images = Tensor::from_data(
            TensorData::new(
                pixels.concat(),
                [targets.len(), CHANNEL_COUNT, height, width],
            )
            .convert::<B::FloatElem>(),
            &self.device,
        );

        DetectionBatch {
            images,
            targets: DetectionTargets::from_encoded(&targets, &self.device),
        }
    }
}
