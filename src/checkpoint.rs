//! Periodic training snapshots under `<model_dir>/checkpoints/model_<epoch>/`.
//!
//! A snapshot holds the model record, the optimizer record and `state.json`.
//! It is assembled in `model_<epoch>.partial/` and renamed into place, so a
//! directory without the suffix is always complete.

use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    record::{DefaultRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    early_stopping::EarlyStoppingState,
    error::{checkpoint_error, io_error, Result, TrainError},
};

const PREFIX: &str = "model_";
const PARTIAL_SUFFIX: &str = ".partial";
const MODEL_FILE: &str = "model";
const OPTIM_FILE: &str = "optim";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Completed epochs; training resumes at this zero-based index.
    pub epoch: usize,
    pub best_valid_loss: Option<f64>,
    pub early_stopping: Option<EarlyStoppingState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub path: PathBuf,
    pub epoch: usize,
    pub created: SystemTime,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    every: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, every: usize) -> Result<Self> {
        if every == 0 {
            return Err(TrainError::Config("checkpoint interval must be positive".into()));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        Ok(Self { dir, every })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `epoch` is 1-based.
    pub fn is_due(&self, epoch: usize) -> bool {
        epoch > 0 && epoch % self.every == 0
    }

    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{PREFIX}{epoch}"))
    }

    /// Complete checkpoints in no particular order.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>> {
        let mut entries = vec![];
        for entry in fs::read_dir(&self.dir).map_err(io_error(&self.dir))? {
            let entry = entry.map_err(io_error(&self.dir))?;
            let path = entry.path();
            let Some(epoch) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(PREFIX))
                .and_then(|epoch| epoch.parse::<usize>().ok())
            else {
                debug!("Skipping {}", path.display());
                continue;
            };
            if !path.is_dir() {
                continue;
            }

            let metadata = entry.metadata().map_err(io_error(&path))?;
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .map_err(io_error(&path))?;
            entries.push(CheckpointEntry {
                path,
                epoch,
                created,
            });
        }
        Ok(entries)
    }

    /// The most recently created checkpoint; ties go to the higher epoch.
    pub fn latest(&self) -> Result<Option<CheckpointEntry>> {
        Ok(self
            .list()?
            .into_iter()
            .max_by_key(|entry| (entry.created, entry.epoch)))
    }

    pub fn save<B, M, O>(&self, model: &M, optim: &O, state: &CheckpointState) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let target = self.path_for(state.epoch);
        let partial = self.dir.join(format!("{PREFIX}{}{PARTIAL_SUFFIX}", state.epoch));
        if partial.exists() {
            fs::remove_dir_all(&partial).map_err(io_error(&partial))?;
        }
        fs::create_dir_all(&partial).map_err(io_error(&partial))?;

        let recorder = DefaultRecorder::new();
        model
            .clone()
            .save_file(partial.join(MODEL_FILE), &recorder)
            .map_err(|err| checkpoint_error(&partial, format!("{err:?}")))?;
        Recorder::<B>::record(&recorder, optim.to_record(), partial.join(OPTIM_FILE))
            .map_err(|err| checkpoint_error(&partial, format!("{err:?}")))?;
        let state_json =
            serde_json::to_string_pretty(state).map_err(|err| checkpoint_error(&partial, err))?;
        let state_path = partial.join(STATE_FILE);
        fs::write(&state_path, state_json).map_err(io_error(&state_path))?;

        if target.exists() {
            fs::remove_dir_all(&target).map_err(io_error(&target))?;
        }
        fs::rename(&partial, &target).map_err(io_error(&target))?;

        info!("Saved checkpoint {}", target.display());
        Ok(target)
    }

    pub fn restore<B, M, O>(
        &self,
        entry: &CheckpointEntry,
        model: M,
        optim: O,
        device: &B::Device,
    ) -> Result<(M, O, CheckpointState)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let path = &entry.path;
        let recorder = DefaultRecorder::new();

        let model = model
            .load_file(path.join(MODEL_FILE), &recorder, device)
            .map_err(|err| checkpoint_error(path, format!("model: {err:?}")))?;
        let record = Recorder::<B>::load(&recorder, path.join(OPTIM_FILE), device)
            .map_err(|err| checkpoint_error(path, format!("optimizer: {err:?}")))?;
        let optim = optim.load_record(record);

        let state_path = path.join(STATE_FILE);
        let state_json = fs::read_to_string(&state_path).map_err(io_error(&state_path))?;
        let state: CheckpointState =
            serde_json::from_str(&state_json).map_err(|err| checkpoint_error(path, err))?;
        if state.epoch != entry.epoch {
            return Err(checkpoint_error(
                path,
                format!("state records epoch {}", state.epoch),
            ));
        }

        info!("Restored checkpoint {} (epoch {})", path.display(), state.epoch);
        Ok((model, optim, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_every_tenth_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 10).unwrap();

        let due: Vec<_> = (0..=30).filter(|&epoch| manager.is_due(epoch)).collect();
        assert_eq!(due, vec![10, 20, 30]);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CheckpointManager::new(dir.path(), 0).is_err());
    }

    #[test]
    fn partial_and_foreign_entries_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 10).unwrap();
        fs::create_dir(dir.path().join("model_10")).unwrap();
        fs::create_dir(dir.path().join("model_20.partial")).unwrap();
        fs::create_dir(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("model_30"), b"not a directory").unwrap();

        let entries = manager.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].epoch, 10);
    }

    #[test]
    fn latest_prefers_creation_time_then_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 10).unwrap();
        assert_eq!(manager.latest().unwrap(), None);

        fs::create_dir(dir.path().join("model_20")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        fs::create_dir(dir.path().join("model_10")).unwrap();

        let latest = manager.latest().unwrap().unwrap();
        assert_eq!(latest.epoch, 10);
    }
}
