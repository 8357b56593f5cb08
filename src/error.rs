//! Error types for dataset acquisition, embedding resolution and experiments.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Failure while fetching a remote file into the local cache.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to download {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while acquiring or loading the review dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A file name that does not follow `<id>_<score>.txt`.
    #[error("file name {0:?} does not match <id>_<score>.txt")]
    FileName(String),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("failed to extract {}: {source}", path.display())]
    Extract {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while resolving an embedding identifier.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("invalid embedding identifier {0:?}")]
    InvalidIdentifier(String),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("no word vectors found in {}", .0.display())]
    Empty(PathBuf),
}

/// Errors raised by a single train/evaluate run.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("embedding resolution failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("the {0} table has no reviews")]
    EmptyDataset(&'static str),
}
