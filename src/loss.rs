//! Detection loss over the three decoded prediction scales.
//!
//! Every term is summed per image, summed over scales, then averaged over the
//! batch.

use burn::prelude::*;

use crate::{
    anchor::{ANCHORS_PER_SCALE, NUM_SCALES},
    data::detection::DetectionTargets,
    error::{Result, TrainError},
    geometry::IouKind,
    target::OBJECTNESS,
};

const EPS: f32 = 1e-7;

#[derive(Config, Debug)]
pub struct YoloLossConfig {
    #[config(default = "IouKind::Ciou")]
    pub iou_kind: IouKind,

    #[config(default = 3.0)]
    pub box_weight: f32,

    /// Background anchors whose prediction overlaps a ground-truth box at
    /// least this much carry no objectness loss.
    #[config(default = 0.5)]
    pub ignore_threshold: f32,
}

impl YoloLossConfig {
    pub fn init(&self, num_classes: usize) -> Result<YoloLoss> {
        if num_classes == 0 {
            return Err(TrainError::Config("at least one class is required".into()));
        }
        if !(self.ignore_threshold > 0. && self.ignore_threshold <= 1.) {
            return Err(TrainError::Config(format!(
                "ignore threshold must lie in (0, 1], got {}",
                self.ignore_threshold
            )));
        }
        if self.box_weight < 0. {
            return Err(TrainError::Config(format!(
                "box weight must be non-negative, got {}",
                self.box_weight
            )));
        }

        Ok(YoloLoss {
            iou_kind: self.iou_kind,
            box_weight: self.box_weight,
            ignore_threshold: self.ignore_threshold,
            depth: OBJECTNESS + 1 + num_classes,
        })
    }
}

#[derive(Debug, Clone)]
pub struct YoloLoss {
    iou_kind: IouKind,
    box_weight: f32,
    ignore_threshold: f32,
    depth: usize,
}

#[derive(Debug, Clone)]
pub struct DetectionLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub iou: Tensor<B, 1>,
    pub conf: Tensor<B, 1>,
    pub prob: Tensor<B, 1>,
}

impl YoloLoss {
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// `predictions` are decoded `[batch, grid_h, grid_w, anchors, 5 + classes]`
    /// tensors with boxes normalized to the input and scores in `(0, 1)`.
    ///
    /// # Panics
    ///
    /// When the predictions and targets disagree in scale count or shape.
    pub fn forward<B: Backend>(
        &self,
        predictions: &[Tensor<B, 5>],
        targets: &DetectionTargets<B>,
    ) -> DetectionLoss<B> {
        assert_eq!(
            predictions.len(),
            NUM_SCALES,
            "expected {NUM_SCALES} prediction scales, got {}",
            predictions.len()
        );
        assert_eq!(
            targets.scales.len(),
            NUM_SCALES,
            "expected {NUM_SCALES} target scales, got {}",
            targets.scales.len()
        );

        let mut terms: Option<[Tensor<B, 1>; 3]> = None;
        for (scale, (pred, target)) in predictions.iter().zip(&targets.scales).enumerate() {
            let [_, _, _, anchors, depth] = pred.dims();
            assert_eq!(
                pred.dims(),
                target.dims(),
                "scale {scale}: prediction and target shapes differ"
            );
            assert_eq!(
                anchors, ANCHORS_PER_SCALE,
                "scale {scale}: expected {ANCHORS_PER_SCALE} anchors, got {anchors}"
            );
            assert_eq!(
                depth, self.depth,
                "scale {scale}: expected depth {}, got {depth}",
                self.depth
            );

            let scale_terms = self.scale_terms(
                pred.clone(),
                target.clone(),
                targets.boxes.clone(),
                targets.box_mask.clone(),
            );
            terms = Some(match terms {
                None => scale_terms,
                Some([iou, conf, prob]) => {
                    let [d_iou, d_conf, d_prob] = scale_terms;
                    [iou + d_iou, conf + d_conf, prob + d_prob]
                }
            });
        }

        let [iou, conf, prob] = terms.unwrap_or_else(|| unreachable!("scale count was checked"));
        let (iou, conf, prob) = (iou.mean(), conf.mean(), prob.mean());

        DetectionLoss {
            total: iou.clone() + conf.clone() + prob.clone(),
            iou,
            conf,
            prob,
        }
    }

    /// Per-image `[iou, conf, prob]` terms of one scale, each shaped `[batch]`.
    fn scale_terms<B: Backend>(
        &self,
        pred: Tensor<B, 5>,
        target: Tensor<B, 5>,
        boxes: Tensor<B, 3>,
        box_mask: Tensor<B, 2>,
    ) -> [Tensor<B, 1>; 3] {
        let [batch, grid_h, grid_w, anchors, depth] = pred.dims();
        let part = |tensor: &Tensor<B, 5>, range: std::ops::Range<usize>| {
            tensor
                .clone()
                .slice([0..batch, 0..grid_h, 0..grid_w, 0..anchors, range])
        };

        let pred_xywh = part(&pred, 0..4);
        let pred_conf = part(&pred, OBJECTNESS..OBJECTNESS + 1);
        let pred_prob = part(&pred, OBJECTNESS + 1..depth);
        let label_xywh = part(&target, 0..4);
        let respond = part(&target, OBJECTNESS..OBJECTNESS + 1);
        let label_prob = part(&target, OBJECTNESS + 1..depth);

        // small boxes weigh more
        let box_scale = (part(&target, 2..3) * part(&target, 3..4)).neg() + 2.;
        let xiou = self.iou_kind.tensor(pred_xywh.clone(), label_xywh);
        let iou_loss = respond.clone() * box_scale * (xiou.neg() + 1.) * self.box_weight;

        let max_boxes = boxes.dims()[1];
        let expanded = [batch, grid_h, grid_w, anchors, max_boxes, 4];
        let overlap = IouKind::Iou.tensor(
            pred_xywh
                .detach()
                .reshape([batch, grid_h, grid_w, anchors, 1, 4])
                .expand(expanded),
            boxes
                .reshape([batch, 1, 1, 1, max_boxes, 4])
                .expand(expanded),
        ) * box_mask
            .reshape([batch, 1, 1, 1, max_boxes, 1])
            .expand([batch, grid_h, grid_w, anchors, max_boxes, 1]);
        let best_overlap = overlap
            .max_dim(4)
            .reshape([batch, grid_h, grid_w, anchors, 1]);
        let background = (respond.clone().neg() + 1.)
            * best_overlap.lower_elem(self.ignore_threshold).float();
        let conf_loss =
            (respond.clone() + background) * binary_cross_entropy(respond.clone(), pred_conf);

        let prob_loss = respond.expand([batch, grid_h, grid_w, anchors, depth - OBJECTNESS - 1])
            * binary_cross_entropy(label_prob, pred_prob);

        [iou_loss, conf_loss, prob_loss].map(per_image)
    }
}

fn binary_cross_entropy<B: Backend, const D: usize>(
    target: Tensor<B, D>,
    prob: Tensor<B, D>,
) -> Tensor<B, D> {
    let prob = prob.clamp(EPS, 1. - EPS);
    let positive = target.clone() * prob.clone().log();
    let negative = (target.neg() + 1.) * (prob.neg() + 1.).log();
    (positive + negative).neg()
}

fn per_image<B: Backend>(term: Tensor<B, 5>) -> Tensor<B, 1> {
    let batch = term.dims()[0];
    term.flatten::<2>(1, 4).sum_dim(1).reshape([batch])
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;
    use crate::{anchor::AnchorSet, data::annotation::BoxLabel, target::TargetEncoder};

    type TestBackend = NdArray<f32>;

    const INPUT: [usize; 2] = [64, 64];

    fn targets(labels: &[BoxLabel]) -> DetectionTargets<TestBackend> {
        let encoder = TargetEncoder::new(AnchorSet::default(), INPUT, 2, 0.).unwrap();
        let encoded = encoder.encode(std::path::Path::new("img.jpg"), labels).unwrap();
        DetectionTargets::from_encoded(&[encoded], &Default::default())
    }

    fn label() -> BoxLabel {
        BoxLabel { x: 0.55, y: 0.55, w: 0.3, h: 0.4, class_id: 1 }
    }

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f32 {
        tensor.into_scalar()
    }

    fn with_cell(
        tensor: Tensor<TestBackend, 5>,
        cell: [usize; 3],
        values: [f32; 5],
    ) -> Tensor<TestBackend, 5> {
        let [row, col, anchor] = cell;
        let values = Tensor::<TestBackend, 1>::from_floats(values, &Default::default())
            .reshape([1, 1, 1, 1, 5]);
        tensor.slice_assign([0..1, row..row + 1, col..col + 1, anchor..anchor + 1, 0..5], values)
    }

    #[test]
    fn perfect_prediction_is_nearly_free() {
        let loss = YoloLossConfig::new().init(2).unwrap();
        let targets = targets(&[label()]);
        let output = loss.forward(&targets.scales.clone(), &targets);

        assert!(scalar(output.iou) < 1e-3);
        assert!(scalar(output.conf) < 1e-3);
        assert!(scalar(output.prob) < 1e-3);
    }

    #[test]
    fn uncertain_prediction_costs_more() {
        let loss = YoloLossConfig::new().init(2).unwrap();
        let targets = targets(&[label()]);
        let perfect = scalar(loss.forward(&targets.scales.clone(), &targets).total);

        let uncertain: Vec<_> = targets
            .scales
            .iter()
            .map(|scale| scale.clone().clamp(0.25, 0.75))
            .collect();
        let output = loss.forward(&uncertain, &targets);

        assert!(scalar(output.total.clone()) > perfect + 1.);
        let total = scalar(output.iou) + scalar(output.conf) + scalar(output.prob);
        assert!((total - scalar(output.total)).abs() < 1e-3);
    }

    #[test]
    fn overlapping_background_is_ignored() {
        let loss = YoloLossConfig::new().init(2).unwrap();
        let targets = targets(&[label()]);
        let baseline = scalar(loss.forward(&targets.scales.clone(), &targets).conf);

        // cell (0, 0) of the finest scale is background for a box centred at 0.55
        let overlapping = {
            let mut scales = targets.scales.clone();
            scales[0] = with_cell(scales[0].clone(), [0, 0, 0], [0.55, 0.55, 0.3, 0.4, 0.9]);
            scales
        };
        let far_away = {
            let mut scales = targets.scales.clone();
            scales[0] = with_cell(scales[0].clone(), [0, 0, 0], [0.05, 0.05, 0.05, 0.05, 0.9]);
            scales
        };

        let ignored = scalar(loss.forward(&overlapping, &targets).conf);
        let punished = scalar(loss.forward(&far_away, &targets).conf);
        assert!((ignored - baseline).abs() < 1e-4);
        assert!(punished > baseline + 2.);
    }

    #[test]
    fn empty_image_only_pays_for_confidence() {
        let loss = YoloLossConfig::new().init(2).unwrap();
        let targets = targets(&[]);
        let confident: Vec<_> = targets.scales.iter().map(|s| s.clone() + 0.5).collect();
        let output = loss.forward(&confident, &targets);

        assert_eq!(scalar(output.iou), 0.);
        assert_eq!(scalar(output.prob), 0.);
        assert!(scalar(output.conf) > 0.);
        assert!(scalar(output.total).is_finite());
    }

    #[test]
    #[should_panic(expected = "prediction and target shapes differ")]
    fn mismatched_shapes_panic() {
        let loss = YoloLossConfig::new().init(2).unwrap();
        let targets = targets(&[label()]);
        let mut predictions = targets.scales.clone();
        predictions[1] = Tensor::zeros([1, 2, 2, 3, 7], &Default::default());
        loss.forward(&predictions, &targets);
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        assert!(YoloLossConfig::new().with_ignore_threshold(0.).init(2).is_err());
        assert!(YoloLossConfig::new().with_box_weight(-1.).init(2).is_err());
        assert!(YoloLossConfig::new().init(0).is_err());
    }
}
