//! Intersection-over-union family on `(x_center, y_center, width, height)` boxes.
//!
//! Every variant exists twice: a host version on `[f32; 4]` used while
//! encoding targets and in tests, and a tensor version used by the loss. The
//! tensor version operates on the last dimension (size 4) of any rank and
//! returns the same rank with a last dimension of size 1.

use std::f32::consts::{FRAC_PI_4, PI};

use burn::prelude::*;
use serde::{Deserialize, Serialize};

const EPS: f32 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IouKind {
    Iou,
    Giou,
    Diou,
    Ciou,
}

impl IouKind {
    pub fn host(&self, a: [f32; 4], b: [f32; 4]) -> f32 {
        let [ax, ay, aw, ah] = a;
        let [bx, by, bw, bh] = b;
        let (a_x0, a_x1, a_y0, a_y1) = (ax - aw / 2., ax + aw / 2., ay - ah / 2., ay + ah / 2.);
        let (b_x0, b_x1, b_y0, b_y1) = (bx - bw / 2., bx + bw / 2., by - bh / 2., by + bh / 2.);

        let inter_w = (a_x1.min(b_x1) - a_x0.max(b_x0)).max(0.);
        let inter_h = (a_y1.min(b_y1) - a_y0.max(b_y0)).max(0.);
        let inter = inter_w * inter_h;
        let union = aw * ah + bw * bh - inter;
        let iou = inter / (union + EPS);

        if *self == IouKind::Iou {
            return iou;
        }

        let enclose_w = a_x1.max(b_x1) - a_x0.min(b_x0);
        let enclose_h = a_y1.max(b_y1) - a_y0.min(b_y0);

        match self {
            IouKind::Giou => {
                let enclose = enclose_w * enclose_h;
                iou - (enclose - union) / (enclose + EPS)
            }
            _ => {
                let diagonal = enclose_w * enclose_w + enclose_h * enclose_h;
                let center = (ax - bx).powi(2) + (ay - by).powi(2);
                let diou = iou - center / (diagonal + EPS);
                if *self == IouKind::Diou {
                    return diou;
                }
                let v = 4. / (PI * PI) * ((bw / (bh + EPS)).atan() - (aw / (ah + EPS)).atan()).powi(2);
                let alpha = v / (1. - iou + v + EPS);
                diou - alpha * v
            }
        }
    }

    /// `pred` is the prediction, `truth` the target. For CIoU the aspect
    /// weight `alpha` is treated as a constant during backpropagation.
    pub fn tensor<B: Backend, const D: usize>(
        &self,
        pred: Tensor<B, D>,
        truth: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let [px, py, pw, ph] = split_xywh(pred);
        let [tx, ty, tw, th] = split_xywh(truth);

        let p_x0 = px.clone() - pw.clone() / 2.;
        let p_x1 = px.clone() + pw.clone() / 2.;
        let p_y0 = py.clone() - ph.clone() / 2.;
        let p_y1 = py.clone() + ph.clone() / 2.;
        let t_x0 = tx.clone() - tw.clone() / 2.;
        let t_x1 = tx.clone() + tw.clone() / 2.;
        let t_y0 = ty.clone() - th.clone() / 2.;
        let t_y1 = ty.clone() + th.clone() / 2.;

        let inter_w = (p_x1.clone().min_pair(t_x1.clone()) - p_x0.clone().max_pair(t_x0.clone()))
            .clamp_min(0.);
        let inter_h = (p_y1.clone().min_pair(t_y1.clone()) - p_y0.clone().max_pair(t_y0.clone()))
            .clamp_min(0.);
        let inter = inter_w * inter_h;
        let union = pw.clone() * ph.clone() + tw.clone() * th.clone() - inter.clone();
        let iou = inter / (union.clone() + EPS);

        if *self == IouKind::Iou {
            return iou;
        }

        let enclose_w = p_x1.max_pair(t_x1) - p_x0.min_pair(t_x0);
        let enclose_h = p_y1.max_pair(t_y1) - p_y0.min_pair(t_y0);

        if *self == IouKind::Giou {
            let enclose = enclose_w * enclose_h;
            return iou - (enclose.clone() - union) / (enclose + EPS);
        }

        let diagonal = enclose_w.powf_scalar(2.) + enclose_h.powf_scalar(2.);
        let center = (px - tx).powf_scalar(2.) + (py - ty).powf_scalar(2.);
        let diou = iou.clone() - center / (diagonal + EPS);

        if *self == IouKind::Diou {
            return diou;
        }

        let angle = atan_non_negative(tw / (th + EPS)) - atan_non_negative(pw / (ph + EPS));
        let v = angle.powf_scalar(2.) * (4. / (PI * PI));
        let alpha = (v.clone() / (iou.neg() + 1. + v.clone() + EPS)).detach();
        diou - alpha * v
    }
}

fn split_xywh<B: Backend, const D: usize>(boxes: Tensor<B, D>) -> [Tensor<B, D>; 4] {
    let mut parts = boxes.chunk(4, D - 1).into_iter();
    let mut next = || {
        parts
            .next()
            .unwrap_or_else(|| panic!("box tensors must end in a dimension of size 4"))
    };
    [next(), next(), next(), next()]
}

/// `atan(x)` for `x >= 0`, built from differentiable primitives.
///
/// Uses `atan(x) = π/4 + atan((x - 1) / (x + 1))` to bring the argument into
/// `[-1, 1]`, then a degree-9 odd polynomial (max error about 1e-5 rad).
pub fn atan_non_negative<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let z = (x.clone() - 1.) / (x + 1.);
    let z2 = z.clone().powf_scalar(2.);
    let poly = ((((z2.clone() * 0.020_835_1 - 0.085_133) * z2.clone() + 0.180_141) * z2.clone()
        - 0.330_299_5)
        * z2
        + 0.999_866)
        * z;
    poly + FRAC_PI_4
}
