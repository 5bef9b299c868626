use std::path::{Path, PathBuf};

use ledgerscan_pipeline::PipelineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("{path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read workbook {path}: {message}")]
    WorkbookRead { path: PathBuf, message: String },
    #[error("failed to write workbook {path}: {message}")]
    WorkbookWrite { path: PathBuf, message: String },
    #[error("{path}: invalid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no workbook configured for year {0}")]
    UnknownYear(i32),
}

impl IoError {
    pub(crate) fn file(path: &Path, source: std::io::Error) -> Self {
        IoError::File {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
        IoError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<IoError> for PipelineError {
    fn from(e: IoError) -> Self {
        PipelineError::Source(e.to_string())
    }
}
