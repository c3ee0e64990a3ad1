use burn::prelude::*;

use crate::error::{Result, TrainError};

pub const NUM_SCALES: usize = 3;
pub const ANCHORS_PER_SCALE: usize = 3;

fn default_anchors() -> Vec<Vec<[f32; 2]>> {
    vec![
        vec![[12., 16.], [19., 36.], [40., 28.]],
        vec![[36., 75.], [76., 55.], [72., 146.]],
        vec![[142., 110.], [192., 243.], [459., 401.]],
    ]
}

/// Anchor priors as they appear in a config file. Converted into an
/// [`AnchorSet`] once, which rejects any layout other than 3 scales × 3 anchors.
#[derive(Config, Debug)]
pub struct AnchorConfig {
    /// Anchor `(width, height)` in input pixels, one row per scale.
    #[config(default = "default_anchors()")]
    pub anchors: Vec<Vec<[f32; 2]>>,

    #[config(default = "vec![8, 16, 32]")]
    pub strides: Vec<usize>,

    #[config(default = "vec![1.2, 1.1, 1.05]")]
    pub xy_scales: Vec<f32>,
}

impl AnchorConfig {
    pub fn init(&self) -> Result<AnchorSet> {
        if self.anchors.len() != NUM_SCALES {
            return Err(TrainError::ShapeMismatch(format!(
                "expected {NUM_SCALES} anchor scales, got {}",
                self.anchors.len()
            )));
        }
        if self.strides.len() != NUM_SCALES || self.xy_scales.len() != NUM_SCALES {
            return Err(TrainError::ShapeMismatch(format!(
                "expected {NUM_SCALES} strides and xy scales, got {} and {}",
                self.strides.len(),
                self.xy_scales.len()
            )));
        }

        let mut anchors = [[[0.; 2]; ANCHORS_PER_SCALE]; NUM_SCALES];
        for (scale, row) in self.anchors.iter().enumerate() {
            if row.len() != ANCHORS_PER_SCALE {
                return Err(TrainError::ShapeMismatch(format!(
                    "scale {scale} has {} anchors, expected {ANCHORS_PER_SCALE}",
                    row.len()
                )));
            }
            for (slot, &[w, h]) in row.iter().enumerate() {
                if !(w > 0. && h > 0.) {
                    return Err(TrainError::Config(format!(
                        "anchor {slot} of scale {scale} has non-positive size {w}x{h}"
                    )));
                }
                anchors[scale][slot] = [w, h];
            }
        }

        let mut strides = [0; NUM_SCALES];
        strides.copy_from_slice(&self.strides);
        if strides.windows(2).any(|pair| pair[0] >= pair[1]) || strides[0] == 0 {
            return Err(TrainError::Config(format!(
                "strides must be positive and increasing, got {strides:?}"
            )));
        }

        let mut xy_scales = [0.; NUM_SCALES];
        xy_scales.copy_from_slice(&self.xy_scales);

        Ok(AnchorSet {
            anchors,
            strides,
            xy_scales,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorSet {
    anchors: [[[f32; 2]; ANCHORS_PER_SCALE]; NUM_SCALES],
    strides: [usize; NUM_SCALES],
    xy_scales: [f32; NUM_SCALES],
}

impl AnchorSet {
    pub fn anchors(&self, scale: usize) -> &[[f32; 2]; ANCHORS_PER_SCALE] {
        &self.anchors[scale]
    }

    pub fn stride(&self, scale: usize) -> usize {
        self.strides[scale]
    }

    pub fn strides(&self) -> [usize; NUM_SCALES] {
        self.strides
    }

    pub fn xy_scale(&self, scale: usize) -> f32 {
        self.xy_scales[scale]
    }

    /// Anchor sizes of one scale as a fraction of the network input `[width, height]`.
    pub fn ratios(&self, scale: usize, input_size: [usize; 2]) -> [[f32; 2]; ANCHORS_PER_SCALE] {
        self.anchors[scale].map(|[w, h]| [w / input_size[0] as f32, h / input_size[1] as f32])
    }

    /// Grid `[height, width]` of every scale for an input of `[width, height]` pixels.
    pub fn grid_sizes(&self, input_size: [usize; 2]) -> Result<[[usize; 2]; NUM_SCALES]> {
        let [width, height] = input_size;
        let mut grids = [[0; 2]; NUM_SCALES];
        for (scale, &stride) in self.strides.iter().enumerate() {
            if width % stride != 0 || height % stride != 0 || width == 0 || height == 0 {
                return Err(TrainError::ShapeMismatch(format!(
                    "input {width}x{height} is not divisible by stride {stride}"
                )));
            }
            grids[scale] = [height / stride, width / stride];
        }
        Ok(grids)
    }
}

impl Default for AnchorSet {
    fn default() -> Self {
        AnchorConfig::new()
            .init()
            .unwrap_or_else(|err| unreachable!("built-in anchors are valid: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_three_by_three() {
        let set = AnchorConfig::new().init().unwrap();
        assert_eq!(set.anchors(0)[0], [12., 16.]);
        assert_eq!(set.anchors(2)[2], [459., 401.]);
        assert_eq!(set.strides(), [8, 16, 32]);
        assert_eq!(set.xy_scale(1), 1.1);
    }

    #[test]
    fn missing_anchor_is_shape_mismatch() {
        let config = AnchorConfig::new().with_anchors(vec![
            vec![[12., 16.], [19., 36.]],
            vec![[36., 75.], [76., 55.], [72., 146.]],
            vec![[142., 110.], [192., 243.], [459., 401.]],
        ]);
        assert!(matches!(config.init(), Err(TrainError::ShapeMismatch(_))));
    }

    #[test]
    fn extra_scale_is_shape_mismatch() {
        let mut anchors = default_anchors();
        anchors.push(vec![[1., 1.], [2., 2.], [3., 3.]]);
        let config = AnchorConfig::new().with_anchors(anchors);
        assert!(matches!(config.init(), Err(TrainError::ShapeMismatch(_))));
    }

    #[test]
    fn grid_sizes_follow_strides() {
        let set = AnchorSet::default();
        let grids = set.grid_sizes([608, 416]).unwrap();
        assert_eq!(grids, [[52, 76], [26, 38], [13, 19]]);
        assert!(set.grid_sizes([600, 416]).is_err());
    }

    #[test]
    fn ratios_are_relative_to_input() {
        let set = AnchorSet::default();
        let ratios = set.ratios(0, [608, 416]);
        assert!((ratios[0][0] - 12. / 608.).abs() < 1e-7);
        assert!((ratios[0][1] - 16. / 416.).abs() < 1e-7);
    }
}
