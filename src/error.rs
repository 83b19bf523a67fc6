//! Crate-wide error types and the exit-code taxonomy.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("database connection failed: {0}")]
    ConnectFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("syntax error at line {line}, column {column} in: {statement}")]
    Syntax {
        line: u32,
        column: u32,
        statement: String,
    },

    #[error("constraint violation on {object}: {message}")]
    ConstraintViolation { object: String, message: String },

    #[error("unsupported compression format: {0}")]
    CompressionFormatUnsupported(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key access denied: {0}")]
    KeyAccessDenied(String),

    #[error("key algorithm unsupported: {0}")]
    KeyAlgorithmUnsupported(String),

    #[error("key provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("integrity check failed: {0}")]
    IntegrityFailure(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("not found in storage: {0}")]
    StorageNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Process exit code for this error when the engine is driven as a tool.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigInvalid(_) | Error::CompressionFormatUnsupported(_) => 2,
            Error::ConnectFailed(_)
            | Error::PermissionDenied(_)
            | Error::Syntax { .. }
            | Error::ConstraintViolation { .. } => 3,
            Error::StorageUnavailable(_) | Error::StorageNotFound(_) => 4,
            Error::KeyNotFound(_)
            | Error::KeyAccessDenied(_)
            | Error::KeyAlgorithmUnsupported(_)
            | Error::ProviderUnavailable(_)
            | Error::IntegrityFailure(_)
            | Error::CorruptArchive(_) => 5,
            Error::Cancelled => 6,
            Error::Internal(_) => 1,
        }
    }

    /// Transient errors are retried locally; everything else propagates.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ProviderUnavailable(_) | Error::StorageUnavailable(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(anyhow::Error::from(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(anyhow::Error::from(e))
    }
}
