use std::path::{Path, PathBuf};

use anchor_det_train::{
    classification::{train, ClassificationTrainingConfig},
    early_stopping::EarlyStoppingConfig,
    model::resnet::ResNetConfig,
    module::quant::QuantizationPolicy,
    run::{RunLayout, TrainingContext},
};
use anyhow::Context;
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    optim::AdamConfig,
};
use clap::Parser;
use tracing::info;

/// Train a ResNet-50 on CIFAR-10.
#[derive(Parser, Debug)]
struct Args {
    /// Run name under models/ and logs/fit/
    #[arg(short = 'n', long = "folder_name")]
    folder_name: Option<String>,

    #[arg(short = 'q', long = "quantized_training")]
    quantized_training: bool,

    /// Use 3x1 + 1x3 convolutions
    #[arg(short = 'a', long = "asymetric")]
    asymetric: bool,

    /// Use depthwise-separable convolutions
    #[arg(short = 'd', long = "depthwise")]
    depthwise: bool,

    #[arg(short = 'e', long = "epochs", default_value_t = 50)]
    epochs: usize,

    #[arg(short = 'b', long = "batch_size", default_value_t = 32)]
    batch_size: usize,

    #[arg(short = 'i', long = "input_size", default_value_t = 32)]
    input_size: usize,

    #[arg(long = "early_stopping")]
    early_stopping: bool,

    /// Directory holding the CIFAR-10 binary batches
    #[arg(long = "data_dir", default_value = "data/cifar-10-batches-bin")]
    data_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let name = args
        .folder_name
        .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
    info!("Run {name}");

    let quantization = if args.quantized_training {
        QuantizationPolicy::quantization_aware()
    } else {
        QuantizationPolicy::new()
    };
    let model = ResNetConfig::new()
        .with_asymmetric(args.asymetric)
        .with_depthwise(args.depthwise)
        .with_quantization(quantization);

    let early_stopping = args.early_stopping.then(EarlyStoppingConfig::new);
    let config = ClassificationTrainingConfig::new(model, AdamConfig::new())
        .with_epoch_count(args.epochs)
        .with_batch_size(args.batch_size)
        .with_input_size(args.input_size)
        .with_early_stopping(early_stopping);

    let layout = RunLayout::for_classification(Path::new("."), &name);
    let context = TrainingContext::<AutodiffBackend>::new(WgpuDevice::default(), layout, config.seed);

    let outcome = train(&args.data_dir, config, context)
        .with_context(|| format!("training run {name} failed"))?;
    info!("Finished with {:?}", outcome.status);

    Ok(())
}
