use std::path::PathBuf;

use burn::{
    config::Config,
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    optim::{decay::WeightDecayConfig, AdamConfig},
    tensor::backend::AutodiffBackend,
};
use tracing::info;

use crate::{
    anchor::AnchorConfig,
    data::{
        annotation::{read_class_names, AnnotationFormat},
        detection::{DetectionBatcher, DetectionDataset},
    },
    driver::{DriverConfig, FitOutcome, TrainingDriver},
    error::{io_error, Result, TrainError},
    loss::YoloLossConfig,
    model::detector::{Detector, DetectorConfig},
    run::TrainingContext,
    schedule::PiecewiseLrConfig,
    target::TargetEncoder,
};

#[derive(Config)]
pub struct DetectionTrainingConfig {
    #[config(default = "PathBuf::from(\"dataset/coco.names\")")]
    pub class_names: PathBuf,

    #[config(default = "PathBuf::from(\"dataset/train2017.txt\")")]
    pub train_annotations: PathBuf,

    #[config(default = "PathBuf::from(\"dataset/val2017.txt\")")]
    pub valid_annotations: PathBuf,

    #[config(default = "PathBuf::from(\"/content/train2017\")")]
    pub train_image_prefix: PathBuf,

    #[config(default = "PathBuf::from(\"/content/val2017\")")]
    pub valid_image_prefix: PathBuf,

    #[config(default = "AnnotationFormat::ConvertedCoco")]
    pub annotation_format: AnnotationFormat,

    /// `[width, height]` in pixels.
    #[config(default = "[608, 416]")]
    pub input_size: [usize; 2],

    #[config(default = "AnchorConfig::new()")]
    pub anchors: AnchorConfig,

    #[config(default = "YoloLossConfig::new()")]
    pub loss: YoloLossConfig,

    #[config(default = 32)]
    pub width: usize,

    #[config(default = 400)]
    pub epoch_count: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    #[config(default = 1.0e-4)]
    pub learning_rate: f64,

    #[config(default = 0.05)]
    pub label_smoothing: f32,

    /// L2 penalty on every parameter.
    #[config(default = 5.0e-4)]
    pub weight_decay: f32,

    #[config(default = 100)]
    pub steps_per_epoch: usize,

    #[config(default = 50)]
    pub validation_steps: usize,

    #[config(default = 5)]
    pub validation_every: usize,

    #[config(default = 10)]
    pub checkpoint_every: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 4)]
    pub worker_count: usize,
}

pub fn train<B: AutodiffBackend>(
    config: DetectionTrainingConfig,
    context: TrainingContext<B>,
) -> Result<FitOutcome<Detector<B>>> {
    context.layout.create()?;
    let config_path = context.layout.config_path();
    config.save(&config_path).map_err(io_error(&config_path))?;

    B::seed(context.seed);
    let device = context.device.clone();

    let classes = read_class_names(&config.class_names)?;
    info!("{} classes from {}", classes.len(), config.class_names.display());

    let encoder = TargetEncoder::new(
        config.anchors.init()?,
        config.input_size,
        classes.len(),
        config.label_smoothing,
    )?;

    let train = DetectionDataset::load(
        &config.train_annotations,
        config.annotation_format,
        Some(&config.train_image_prefix),
        classes.len(),
    )?;
    let valid = DetectionDataset::load(
        &config.valid_annotations,
        config.annotation_format,
        Some(&config.valid_image_prefix),
        classes.len(),
    )?;
    if train.is_empty() {
        return Err(TrainError::Config(format!(
            "no training images in {}",
            config.train_annotations.display()
        )));
    }
    info!("{} training, {} validation images", train.len(), valid.len());

    let batcher_train = DetectionBatcher::<B>::new(device.clone(), encoder.clone(), config.input_size);
    let batcher_valid = DetectionBatcher::<B::InnerBackend>::new(device.clone(), encoder, config.input_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(context.seed)
        .num_workers(config.worker_count)
        .build(train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .shuffle(context.seed)
        .num_workers(config.worker_count)
        .build(valid);

    let model = DetectorConfig::new(classes.len(), config.input_size)
        .with_width(config.width)
        .with_anchors(config.anchors.clone())
        .with_loss(config.loss.clone())
        .init::<B>(&device)?;
    let optimizer = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f64)))
        .init();
    let schedule = PiecewiseLrConfig::new(config.learning_rate, config.epoch_count).init()?;

    let driver_config = DriverConfig::new(config.epoch_count)
        .with_steps_per_epoch(Some(config.steps_per_epoch))
        .with_validation_steps(Some(config.validation_steps))
        .with_validation_every(config.validation_every)
        .with_checkpoint_every(config.checkpoint_every);

    TrainingDriver::new(driver_config, context, schedule)?.fit(
        model,
        optimizer,
        dataloader_train,
        dataloader_valid,
    )
}
