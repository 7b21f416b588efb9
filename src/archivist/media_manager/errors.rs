use std::path::PathBuf;

use thiserror::Error;

/// Why a single transfer failed. The pipeline treats [`DownloadError::Blocked`] as terminal
/// for videos and retries banner images once on [`DownloadError::NotFound`]; anything else
/// aborts the entity's download pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("Blocked (DMCA or legal reasons): {0}")]
    Blocked(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Download failed: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Failed to create media directory {path:?}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write media file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid media file name: {0:?}")]
    InvalidFileName(String),
}
