use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while indexing or decoding the dataset.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read dataset directory {path}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("filename {file} does not match the ID_2m_{{pose}}P_{{v}}V_{{h}}H_{{side}} convention")]
    Parse { file: String },
    #[error("failed to read image {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Invalid or missing configuration values, reported before any data loading
/// or network construction happens.
#[derive(Debug, Error)]
#[error("invalid config: {key} {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(key: &'static str, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

/// Checkpoint persistence failures. Loading never falls back to fresh weights.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found at {path}")]
    Missing { path: PathBuf },
    #[error("failed to load checkpoint {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("failed to save checkpoint {path}: {message}")]
    Save { path: PathBuf, message: String },
}

/// Fatal conditions detected inside the training loop.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("tensors in one batch live on different devices")]
    DeviceMismatch,
    #[error("{term} loss became non-finite at epoch {epoch}, batch {batch}")]
    NonFiniteLoss {
        term: &'static str,
        epoch: usize,
        batch: usize,
    },
}
