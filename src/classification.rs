use std::path::Path;

use burn::{
    config::Config,
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::Module,
    optim::AdamConfig,
    tensor::backend::AutodiffBackend,
};
use tracing::info;

use crate::{
    data::{
        augment::Augmentation,
        cifar::{CifarBatcher, CifarDataset},
    },
    driver::{DriverConfig, FitOutcome, TrainingDriver},
    early_stopping::EarlyStoppingConfig,
    error::{io_error, Result},
    model::resnet::{ResNet, ResNetConfig},
    run::TrainingContext,
    schedule::ConstantLr,
};

#[derive(Config)]
pub struct ClassificationTrainingConfig {
    pub model: ResNetConfig,

    pub optimizer: AdamConfig,

    #[config(default = 50)]
    pub epoch_count: usize,

    #[config(default = 32)]
    pub batch_size: usize,

    /// Images are resized to `input_size × input_size`.
    #[config(default = 32)]
    pub input_size: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,

    #[config(default = 4)]
    pub worker_count: usize,

    /// Fraction of the training files held out for validation.
    #[config(default = 0.1)]
    pub validation_split: f64,

    #[config(default = 10)]
    pub checkpoint_every: usize,

    #[config(default = true)]
    pub augment: bool,

    pub early_stopping: Option<EarlyStoppingConfig>,
}

pub fn train<B: AutodiffBackend>(
    data_dir: &Path,
    config: ClassificationTrainingConfig,
    context: TrainingContext<B>,
) -> Result<FitOutcome<ResNet<B>>> {
    context.layout.create()?;
    let config_path = context.layout.config_path();
    config.save(&config_path).map_err(io_error(&config_path))?;

    B::seed(context.seed);
    let device = context.device.clone();

    let items = CifarDataset::load_train(data_dir)?;
    let (train, valid) = CifarDataset::split(items, config.validation_split, context.seed);
    info!("Loaded CIFAR-10: {} training, {} validation images", train.len(), valid.len());

    let mut batcher_train = CifarBatcher::<B>::new(device.clone(), config.input_size);
    if config.augment {
        batcher_train = batcher_train.with_augmentation(Augmentation::default());
    }
    let batcher_valid = CifarBatcher::<B::InnerBackend>::new(device.clone(), config.input_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(context.seed)
        .num_workers(config.worker_count)
        .build(train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.worker_count)
        .build(valid);

    let model = config.model.init::<B>(&device)?;
    info!(
        "ResNet with {:?} convolutions, {} parameters",
        config.model.spatial_kind(),
        model.num_params()
    );

    let driver_config = DriverConfig::new(config.epoch_count)
        .with_checkpoint_every(config.checkpoint_every)
        .with_early_stopping(config.early_stopping.clone());

    TrainingDriver::new(driver_config, context, ConstantLr(config.learning_rate))?.fit(
        model,
        config.optimizer.init(),
        dataloader_train,
        dataloader_valid,
    )
}
