//! CIFAR-10 in its binary distribution: `data_batch_{1..5}.bin`, each a run of
//! 3073-byte records (label byte, then 32×32 red, green and blue planes).

use std::{fs, path::Path};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use image::{
    imageops::{self, FilterType},
    Rgb, RgbImage,
};
use ndarray::{Array3, ArrayView3};
use rand::{rngs::StdRng, seq::SliceRandom, thread_rng, SeedableRng};
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSlice,
};

use crate::{
    data::augment::Augmentation,
    error::{io_error, Result, TrainError},
};

pub const LABELS: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

pub const IMAGE_SIZE: usize = 32;
const CHANNEL_COUNT: usize = 3;
const RECORD_LEN: usize = 1 + CHANNEL_COUNT * IMAGE_SIZE * IMAGE_SIZE;
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];

#[derive(Debug, Clone)]
pub struct CifarItem {
    /// Position in the source files; stable across shuffles.
    pub index: usize,
    pub image: Array3<u8>,
    pub label: u8,
}

pub struct CifarDataset {
    pub dataset: InMemDataset<CifarItem>,
}

impl Dataset<CifarItem> for CifarDataset {
    fn get(&self, index: usize) -> Option<CifarItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl CifarDataset {
    pub fn load_train(data_dir: &Path) -> Result<Vec<CifarItem>> {
        let mut items = Vec::new();
        for name in TRAIN_FILES {
            let path = data_dir.join(name);
            if !path.is_file() {
                return Err(TrainError::MissingFile(path));
            }
            let bytes = fs::read(&path).map_err(io_error(&path))?;
            items.extend(parse_records(&bytes, items.len()).map_err(|reason| {
                TrainError::Annotation {
                    path: path.clone(),
                    line: 0,
                    reason,
                }
            })?);
        }
        Ok(items)
    }

    /// Shuffles with `seed` and holds out the last `validation_fraction` of the
    /// items. Both halves are disjoint by construction.
    pub fn split(mut items: Vec<CifarItem>, validation_fraction: f64, seed: u64) -> (Self, Self) {
        items.shuffle(&mut StdRng::seed_from_u64(seed));

        let validation_len = (items.len() as f64 * validation_fraction) as usize;
        let (train_items, valid_items) = items.split_at(items.len() - validation_len);

        (
            CifarDataset {
                dataset: InMemDataset::new(train_items.to_vec()),
            },
            CifarDataset {
                dataset: InMemDataset::new(valid_items.to_vec()),
            },
        )
    }
}

fn parse_records(bytes: &[u8], first_index: usize) -> std::result::Result<Vec<CifarItem>, String> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(format!(
            "{} bytes is not a whole number of {RECORD_LEN}-byte records",
            bytes.len()
        ));
    }

    bytes
        .par_chunks(RECORD_LEN)
        .enumerate()
        .map(|(offset, record)| {
            let label = record[0];
            if label as usize >= LABELS.len() {
                return Err(format!("record {offset} has label {label}"));
            }
            let image = ArrayView3::from_shape((CHANNEL_COUNT, IMAGE_SIZE, IMAGE_SIZE), &record[1..])
                .map_err(|err| err.to_string())?
                .to_owned();
            Ok(CifarItem {
                index: first_index + offset,
                image,
                label,
            })
        })
        .collect()
}

fn resize(image: &Array3<u8>, size: usize) -> Array3<f32> {
    let (_, height, width) = image.dim();
    if height == size && width == size {
        return image.mapv(|v| v as f32 / 255.);
    }

    let rgb = RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([image[[0, y, x]], image[[1, y, x]], image[[2, y, x]]])
    });
    let resized = imageops::resize(&rgb, size as u32, size as u32, FilterType::Triangle);

    Array3::from_shape_fn((CHANNEL_COUNT, size, size), |(c, y, x)| {
        resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.
    })
}

#[derive(Clone, Debug)]
pub struct CifarBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct CifarBatcher<B: Backend> {
    device: B::Device,
    input_size: usize,
    augmentation: Option<Augmentation>,
}

impl<B: Backend> CifarBatcher<B> {
    pub fn new(device: B::Device, input_size: usize) -> Self {
        Self {
            device,
            input_size,
            augmentation: None,
        }
    }

    /// Only the training batcher should augment.
    pub fn with_augmentation(mut self, augmentation: Augmentation) -> Self {
        self.augmentation = Some(augmentation);
        self
    }
}

impl<B: Backend> Batcher<CifarItem, CifarBatch<B>> for CifarBatcher<B> {
    fn batch(&self, items: Vec<CifarItem>) -> CifarBatch<B> {
        let size = self.input_size;
        let mut rng = thread_rng();

        let pixels: Vec<f32> = items
            .iter()
            .map(|item| resize(&item.image, size))
            .map(|image| match &self.augmentation {
                Some(augmentation) => augmentation.apply(&image, &mut rng),
                None => image,
            })
            .flat_map(|image| image.iter().copied().collect::<Vec<_>>())
            .collect();

        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [items.len(), CHANNEL_COUNT, size, size])
                .convert::<B::FloatElem>(),
            &self.device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(labels, [items.len()]).convert::<B::IntElem>(),
            &self.device,
        );

        CifarBatch { images, targets }
    }
}
