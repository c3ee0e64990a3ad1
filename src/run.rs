//! Where a run writes its artifacts, and the per-epoch metric log.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use burn::prelude::Backend;
use serde::{Deserialize, Serialize};

use crate::error::{io_error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub model_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl RunLayout {
    pub fn new(model_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        let model_dir = model_dir.into();
        Self {
            checkpoint_dir: model_dir.join("checkpoints"),
            model_dir,
            log_dir: log_dir.into(),
        }
    }

    /// `models/<name>/` and `logs/fit/<name>/` under `root`.
    pub fn for_classification(root: &Path, name: &str) -> Self {
        Self::new(
            root.join("models").join(name),
            root.join("logs").join("fit").join(name),
        )
    }

    /// `models/<name>/` and a shared `logs/` under `root`.
    pub fn for_detection(root: &Path, name: &str) -> Self {
        Self::new(root.join("models").join(name), root.join("logs"))
    }

    pub fn create(&self) -> Result<()> {
        for dir in [&self.model_dir, &self.checkpoint_dir, &self.log_dir] {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
        Ok(())
    }

    /// Without extension; the recorder appends its own.
    pub fn final_model_path(&self) -> PathBuf {
        self.model_dir.join("model")
    }

    pub fn config_path(&self) -> PathBuf {
        self.model_dir.join("config.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.log_dir.join("metrics.jsonl")
    }
}

/// Explicit replacement for process-wide session state.
#[derive(Debug, Clone)]
pub struct TrainingContext<B: Backend> {
    pub device: B::Device,
    pub layout: RunLayout,
    pub seed: u64,
}

impl<B: Backend> TrainingContext<B> {
    pub fn new(device: B::Device, layout: RunLayout, seed: u64) -> Self {
        Self {
            device,
            layout,
            seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// 1-based.
    pub epoch: usize,
    pub lr: f64,
    pub train_loss: Option<f64>,
    pub train_accuracy: Option<f64>,
    pub valid_loss: Option<f64>,
    pub valid_accuracy: Option<f64>,
    /// Named loss terms averaged over the training steps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, f64>,
    pub elapsed_secs: f64,
}

/// Appends one JSON object per line.
pub struct MetricLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error(&path))?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn write(&mut self, summary: &EpochSummary) -> Result<()> {
        let line = serde_json::to_string(summary).map_err(std::io::Error::from);
        line.and_then(|line| {
            writeln!(self.writer, "{line}")?;
            self.writer.flush()
        })
        .map_err(io_error(&self.path))
    }

    pub fn read(path: &Path) -> Result<Vec<EpochSummary>> {
        let content = fs::read_to_string(path).map_err(io_error(path))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| io_error(path)(std::io::Error::from(err)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(epoch: usize) -> EpochSummary {
        EpochSummary {
            epoch,
            lr: 1e-4,
            train_loss: Some(0.5),
            train_accuracy: None,
            valid_loss: None,
            valid_accuracy: None,
            components: BTreeMap::from([("iou".to_string(), 0.25)]),
            elapsed_secs: 1.5,
        }
    }

    #[test]
    fn classification_layout_matches_directory_convention() {
        let layout = RunLayout::for_classification(Path::new("/tmp/run"), "exp");
        assert_eq!(layout.model_dir, Path::new("/tmp/run/models/exp"));
        assert_eq!(layout.checkpoint_dir, Path::new("/tmp/run/models/exp/checkpoints"));
        assert_eq!(layout.log_dir, Path::new("/tmp/run/logs/fit/exp"));
        assert_eq!(layout.final_model_path(), Path::new("/tmp/run/models/exp/model"));
    }

    #[test]
    fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::for_detection(dir.path(), "yolo");
        layout.create().unwrap();
        layout.create().unwrap();
        assert!(layout.checkpoint_dir.is_dir());
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn metric_log_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");

        MetricLog::open(&path).unwrap().write(&summary(1)).unwrap();
        MetricLog::open(&path).unwrap().write(&summary(2)).unwrap();

        let summaries = MetricLog::read(&path).unwrap();
        assert_eq!(summaries, vec![summary(1), summary(2)]);
    }
}
