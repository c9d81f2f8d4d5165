use docchat_core::error::{Error, StoreError, ToolError, VectorError};
use docchat_tools::dataframe::FrameError;

/// Why an ingestion step failed. Recorded on the file as its index error.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Text extraction failed: {0}")]
    Extract(String),

    #[error("Spreadsheet could not be read: {0}")]
    Spreadsheet(#[from] FrameError),

    #[error("Unrecognized SQL dump dialect")]
    UnknownDialect,

    #[error("Unsupported avatar image type: {0}")]
    UnsupportedAvatar(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error("Indexing failed: {0}")]
    Index(#[from] Error),
}

impl IngestError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

impl From<IngestError> for Error {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Store(e) => Error::Store(e),
            IngestError::Tool(e) => Error::Tool(e),
            IngestError::Vector(e) => Error::Vector(e),
            IngestError::Index(e) => e,
            other => Error::Internal(other.to_string()),
        }
    }
}
