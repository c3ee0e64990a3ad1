use std::path::Path;

use anchor_det_train::{
    detection::{train, DetectionTrainingConfig},
    run::{RunLayout, TrainingContext},
};
use anyhow::Context;
use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
use tracing::info;

fn main() -> anyhow::Result<()> {
    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    tracing_subscriber::fmt::init();

    let config = DetectionTrainingConfig::new();
    let layout = RunLayout::for_detection(Path::new("."), "yolov4");
    let context = TrainingContext::<AutodiffBackend>::new(WgpuDevice::default(), layout, config.seed);

    let outcome = train(config, context).context("detection training failed")?;
    info!("Finished with {:?}", outcome.status);

    Ok(())
}
