use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing file {0}")]
    MissingFile(PathBuf),

    #[error("{path}:{line}: {reason}")]
    Annotation {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("training diverged: non-finite loss at epoch {epoch}, step {step}")]
    Diverged { epoch: usize, step: usize },

    #[error("checkpoint {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },
}

pub type Result<T, E = TrainError> = std::result::Result<T, E>;

/// Adapts an `io::Error` into [`TrainError::Io`] tagged with `path`.
pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TrainError + '_ {
    move |source| TrainError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub(crate) fn checkpoint_error(path: &Path, reason: impl ToString) -> TrainError {
    TrainError::Checkpoint {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
