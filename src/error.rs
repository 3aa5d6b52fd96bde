use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Destination file or sidecar could not be opened, written or removed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The request could not be issued or ended abnormally.
    #[error("network error: {0}")]
    Network(String),

    #[error("corrupt progress record {}: {reason}", path.display())]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl TransferError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TransferError::CorruptRecord {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        TransferError::Network(e.to_string())
    }
}
