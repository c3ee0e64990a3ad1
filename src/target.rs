//! Ground-truth encoding: boxes → per-scale, per-anchor regression and class targets.

use std::path::Path;

use ndarray::{s, Array4};

use crate::{
    anchor::{AnchorSet, ANCHORS_PER_SCALE, NUM_SCALES},
    data::annotation::BoxLabel,
    error::{Result, TrainError},
    geometry::IouKind,
};

/// Offset of the objectness slot in the last target dimension; classes follow it.
pub const OBJECTNESS: usize = 4;

/// One-hot vector for `class_id` with `smoothing` of the mass spread uniformly
/// over all `num_classes`: `1 - s + s/C` on the target, `s/C` elsewhere.
pub fn smooth_one_hot(class_id: usize, num_classes: usize, smoothing: f32) -> Vec<f32> {
    let uniform = smoothing / num_classes as f32;
    let mut vector = vec![uniform; num_classes];
    vector[class_id] = 1. - smoothing + uniform;
    vector
}

#[derive(Debug, Clone)]
pub struct EncodedTargets {
    /// One `[grid_h, grid_w, anchors, 5 + classes]` grid per scale.
    pub scales: Vec<Array4<f32>>,
    /// The image's boxes in `(x, y, w, h)`, consumed by the loss's background-ignore rule.
    pub boxes: Vec<[f32; 4]>,
}

#[derive(Debug, Clone)]
pub struct TargetEncoder {
    anchors: AnchorSet,
    input_size: [usize; 2],
    grids: [[usize; 2]; NUM_SCALES],
    num_classes: usize,
    label_smoothing: f32,
    positive_iou_threshold: f32,
}

impl TargetEncoder {
    /// `input_size` is `[width, height]` in pixels.
    pub fn new(
        anchors: AnchorSet,
        input_size: [usize; 2],
        num_classes: usize,
        label_smoothing: f32,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(TrainError::Config("at least one class is required".into()));
        }
        if !(0. ..1.).contains(&label_smoothing) {
            return Err(TrainError::Config(format!(
                "label smoothing must lie in [0, 1), got {label_smoothing}"
            )));
        }

        Ok(Self {
            grids: anchors.grid_sizes(input_size)?,
            anchors,
            input_size,
            num_classes,
            label_smoothing,
            positive_iou_threshold: 0.3,
        })
    }

    pub fn with_positive_iou_threshold(mut self, threshold: f32) -> Self {
        self.positive_iou_threshold = threshold;
        self
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// `[grid_h, grid_w]` per scale.
    pub fn grid_sizes(&self) -> [[usize; 2]; NUM_SCALES] {
        self.grids
    }

    pub fn target_depth(&self) -> usize {
        OBJECTNESS + 1 + self.num_classes
    }

    /// Shape-only overlap of `label` against every anchor, centred on the box.
    fn anchor_ious(&self, label: &BoxLabel) -> [[f32; ANCHORS_PER_SCALE]; NUM_SCALES] {
        let mut ious = [[0.; ANCHORS_PER_SCALE]; NUM_SCALES];
        for (scale, row) in ious.iter_mut().enumerate() {
            let ratios = self.anchors.ratios(scale, self.input_size);
            for (slot, iou) in row.iter_mut().enumerate() {
                let [w, h] = ratios[slot];
                *iou = IouKind::Iou.host(label.xywh(), [label.x, label.y, w, h]);
            }
        }
        ious
    }

    /// Anchors made responsible for `label`: every anchor above the positive
    /// threshold, or the single best anchor when none clears it.
    pub fn responsible_anchors(&self, label: &BoxLabel) -> Vec<(usize, usize)> {
        let ious = self.anchor_ious(label);

        let positive: Vec<_> = (0..NUM_SCALES)
            .flat_map(|scale| (0..ANCHORS_PER_SCALE).map(move |slot| (scale, slot)))
            .filter(|&(scale, slot)| ious[scale][slot] > self.positive_iou_threshold)
            .collect();
        if !positive.is_empty() {
            return positive;
        }

        let mut best = (0, 0);
        for scale in 0..NUM_SCALES {
            for slot in 0..ANCHORS_PER_SCALE {
                if ious[scale][slot] > ious[best.0][best.1] {
                    best = (scale, slot);
                }
            }
        }
        vec![best]
    }

    /// `image_path` only labels errors.
    pub fn encode(&self, image_path: &Path, labels: &[BoxLabel]) -> Result<EncodedTargets> {
        let depth = self.target_depth();
        let mut scales: Vec<_> = self
            .grids
            .iter()
            .map(|&[grid_h, grid_w]| Array4::<f32>::zeros((grid_h, grid_w, ANCHORS_PER_SCALE, depth)))
            .collect();

        let malformed = |reason: String| TrainError::Annotation {
            path: image_path.to_path_buf(),
            line: 0,
            reason,
        };
        for label in labels {
            if label.class_id >= self.num_classes {
                return Err(malformed(format!(
                    "class id {} out of range for {} classes",
                    label.class_id, self.num_classes
                )));
            }
            if !(label.w > 0. && label.h > 0.) {
                return Err(malformed(format!("box {:?} has non-positive size", label.xywh())));
            }

            let classes = smooth_one_hot(label.class_id, self.num_classes, self.label_smoothing);

            for (scale, slot) in self.responsible_anchors(label) {
                let [grid_h, grid_w] = self.grids[scale];
                let col = ((label.x * grid_w as f32).floor().max(0.) as usize).min(grid_w - 1);
                let row = ((label.y * grid_h as f32).floor().max(0.) as usize).min(grid_h - 1);

                let mut cell = scales[scale].slice_mut(s![row, col, slot, ..]);
                for (dst, value) in cell.iter_mut().zip(label.xywh()) {
                    *dst = value;
                }
                cell[OBJECTNESS] = 1.;
                for (dst, value) in cell.iter_mut().skip(OBJECTNESS + 1).zip(&classes) {
                    *dst = *value;
                }
            }
        }

        Ok(EncodedTargets {
            scales,
            boxes: labels.iter().map(BoxLabel::xywh).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder(classes: usize, smoothing: f32) -> TargetEncoder {
        TargetEncoder::new(AnchorSet::default(), [608, 416], classes, smoothing).unwrap()
    }

    fn label(x: f32, y: f32, w: f32, h: f32, class_id: usize) -> BoxLabel {
        BoxLabel { x, y, w, h, class_id }
    }

    #[test]
    fn smoothing_sums_to_one() {
        let vector = smooth_one_hot(2, 80, 0.05);
        let sum: f32 = vector.iter().sum();
        assert!((sum - 1.).abs() < 1e-5);
        assert!((vector[2] - (1. - 0.05 + 0.05 / 80.)).abs() < 1e-7);
        assert!((vector[0] - 0.05 / 80.).abs() < 1e-9);
    }

    #[test]
    fn zero_smoothing_is_plain_one_hot() {
        assert_eq!(smooth_one_hot(1, 3, 0.), vec![0., 1., 0.]);
    }

    #[test]
    fn grids_have_expected_shapes() {
        let encoded = encoder(4, 0.).encode(Path::new("img.jpg"), &[]).unwrap();
        let shapes: Vec<_> = encoded.scales.iter().map(|grid| grid.dim()).collect();
        assert_eq!(shapes, vec![(52, 76, 3, 9), (26, 38, 3, 9), (13, 19, 3, 9)]);
        assert!(encoded.scales.iter().all(|grid| grid.iter().all(|&v| v == 0.)));
    }

    #[test]
    fn every_box_gets_a_responsible_anchor() {
        let encoder = encoder(3, 0.1);
        // tiny, huge and oddly shaped boxes
        let labels = [
            label(0.1, 0.1, 0.005, 0.005, 0),
            label(0.5, 0.5, 0.95, 0.95, 1),
            label(0.7, 0.3, 0.6, 0.02, 2),
        ];
        for label in &labels {
            assert!(!encoder.responsible_anchors(label).is_empty());
        }
        let encoded = encoder.encode(Path::new("img.jpg"), &labels).unwrap();
        let positives: f32 = encoded
            .scales
            .iter()
            .map(|grid| grid.slice(s![.., .., .., OBJECTNESS]).sum())
            .sum();
        assert!(positives >= 3.);
    }

    #[test]
    fn box_matching_an_anchor_lands_on_that_anchor() {
        let encoder = encoder(2, 0.);
        // exactly the [76, 55] anchor of the middle scale
        let label = label(0.5, 0.5, 76. / 608., 55. / 416., 1);
        let responsible = encoder.responsible_anchors(&label);
        assert!(responsible.contains(&(1, 1)));

        let encoded = encoder.encode(Path::new("img.jpg"), &[label]).unwrap();
        let cell = encoded.scales[1].slice(s![13, 19, 1, ..]).to_vec();
        assert_eq!(&cell[..4], &label.xywh());
        assert_eq!(cell[OBJECTNESS], 1.);
        assert_eq!(&cell[5..], &[0., 1.]);
    }

    #[test]
    fn best_anchor_is_used_when_nothing_clears_threshold() {
        let encoder = encoder(1, 0.).with_positive_iou_threshold(0.99);
        let responsible = encoder.responsible_anchors(&label(0.5, 0.5, 0.3, 0.01, 0));
        assert_eq!(responsible.len(), 1);
    }

    #[test]
    fn edge_box_is_clamped_into_the_grid() {
        let encoder = encoder(1, 0.);
        let encoded = encoder.encode(Path::new("img.jpg"), &[label(1.0, 1.0, 0.02, 0.04, 0)]).unwrap();
        let positives: f32 = encoded
            .scales
            .iter()
            .map(|grid| grid.slice(s![.., .., .., OBJECTNESS]).sum())
            .sum();
        assert!(positives >= 1.);
    }

    #[test]
    fn out_of_range_class_is_rejected() {
        let result = encoder(2, 0.).encode(Path::new("img.jpg"), &[label(0.5, 0.5, 0.1, 0.1, 2)]);
        match result {
            Err(TrainError::Annotation { path, line, .. }) => {
                assert_eq!(path, Path::new("img.jpg"));
                assert_eq!(line, 0);
            }
            other => panic!("expected an annotation error, got {other:?}"),
        }
    }

    #[test]
    fn flat_box_is_rejected() {
        let result = encoder(2, 0.).encode(Path::new("img.jpg"), &[label(0.5, 0.5, 0.1, 0., 0)]);
        assert!(matches!(result, Err(TrainError::Annotation { .. })));
    }

    #[test]
    fn invalid_smoothing_is_rejected() {
        assert!(TargetEncoder::new(AnchorSet::default(), [608, 416], 3, 1.0).is_err());
    }
}
