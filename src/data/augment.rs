use std::f32::consts::TAU;

use ndarray::Array3;
use rand::Rng;

/// Random flip / rotation / zoom for the training split of the classifier.
///
/// `max_rotation` is a fraction of a full turn and `max_zoom` a fraction of
/// the image size, both sampled uniformly in `[-max, max]`. Out-of-image
/// samples reflect back into the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmentation {
    pub horizontal_flip: bool,
    pub max_rotation: f32,
    pub max_zoom: f32,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            horizontal_flip: true,
            max_rotation: 0.1,
            max_zoom: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub flip: bool,
    /// Radians.
    pub angle: f32,
    /// Greater than 1 zooms out.
    pub zoom: f32,
}

impl Transform {
    pub const IDENTITY: Self = Self {
        flip: false,
        angle: 0.,
        zoom: 1.,
    };
}

impl Augmentation {
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Transform {
        let symmetric = |rng: &mut R, max: f32| {
            if max > 0. {
                rng.gen_range(-max..=max)
            } else {
                0.
            }
        };

        Transform {
            flip: self.horizontal_flip && rng.gen_bool(0.5),
            angle: symmetric(rng, self.max_rotation) * TAU,
            zoom: 1. + symmetric(rng, self.max_zoom),
        }
    }

    pub fn apply<R: Rng>(&self, image: &Array3<f32>, rng: &mut R) -> Array3<f32> {
        transform(image, self.sample(rng))
    }
}

fn reflect(index: f32, size: usize) -> usize {
    let size = size as i64;
    if size == 1 {
        return 0;
    }
    let period = 2 * size;
    let mut i = (index.round() as i64).rem_euclid(period);
    if i >= size {
        i = period - 1 - i;
    }
    i as usize
}

/// Resamples a `[channels, height, width]` image with nearest-neighbour lookups.
pub fn transform(image: &Array3<f32>, transform: Transform) -> Array3<f32> {
    if transform == Transform::IDENTITY {
        return image.clone();
    }

    let (channels, height, width) = image.dim();
    let (cy, cx) = ((height as f32 - 1.) / 2., (width as f32 - 1.) / 2.);
    let (sin, cos) = transform.angle.sin_cos();

    let mut output = Array3::zeros((channels, height, width));
    for row in 0..height {
        for col in 0..width {
            let x = (col as f32 - cx) * transform.zoom;
            let y = (row as f32 - cy) * transform.zoom;
            let mut src_x = cos * x + sin * y + cx;
            let src_y = -sin * x + cos * y + cy;
            if transform.flip {
                src_x = width as f32 - 1. - src_x;
            }

            let (src_row, src_col) = (reflect(src_y, height), reflect(src_x, width));
            for channel in 0..channels {
                output[[channel, row, col]] = image[[channel, src_row, src_col]];
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn gradient() -> Array3<f32> {
        Array3::from_shape_fn((2, 4, 5), |(c, r, col)| (c * 100 + r * 10 + col) as f32)
    }

    #[test]
    fn identity_keeps_pixels() {
        let image = gradient();
        assert_eq!(transform(&image, Transform::IDENTITY), image);
    }

    #[test]
    fn flip_mirrors_columns() {
        let image = gradient();
        let flipped = transform(&image, Transform { flip: true, ..Transform::IDENTITY });
        assert_eq!(flipped[[0, 1, 0]], image[[0, 1, 4]]);
        assert_eq!(flipped[[1, 3, 4]], image[[1, 3, 0]]);
    }

    #[test]
    fn half_turn_reverses_the_image() {
        let image = gradient();
        let half_turn = Transform {
            angle: std::f32::consts::PI,
            ..Transform::IDENTITY
        };
        let rotated = transform(&image, half_turn);
        assert_eq!(rotated[[0, 0, 0]], image[[0, 3, 4]]);
    }

    #[test]
    fn samples_stay_within_bounds() {
        let augmentation = Augmentation::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let t = augmentation.sample(&mut rng);
            assert!(t.angle.abs() <= 0.1 * TAU + 1e-6);
            assert!((0.9 - 1e-6..=1.1 + 1e-6).contains(&t.zoom));
        }
    }

    #[test]
    fn disabled_augmentation_is_identity() {
        let augmentation = Augmentation {
            horizontal_flip: false,
            max_rotation: 0.,
            max_zoom: 0.,
        };
        let image = gradient();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(augmentation.apply(&image, &mut rng), image);
    }
}
