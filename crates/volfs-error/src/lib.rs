#![forbid(unsafe_code)]
//! Error types for volfs.
//!
//! Defines `FsError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;
use volfs_types::ParseError;

/// Unified error type for all volfs operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at cluster {cluster}: {detail}")]
    Corruption { cluster: u32, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("no volume mounted")]
    NotMounted,

    #[error("invalid file handle {0}")]
    BadHandle(u32),

    #[error("invalid open mode {0:?}")]
    InvalidMode(String),

    #[error("handle {0} is not open for writing")]
    ReadOnly(u32),

    #[error("seek to negative position {0}")]
    NegativeSeek(i64),

    #[error("no space left on volume")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("name too long")]
    NameTooLong,

    #[error("name is empty")]
    EmptyName,

    #[error("already exists: {0}")]
    Exists(String),

    #[error("cluster {cluster} out of bounds (total {total})")]
    OutOfBounds { cluster: u32, total: u32 },
}

impl From<ParseError> for FsError {
    fn from(err: ParseError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_converts_to_format() {
        let err: FsError = ParseError::InvalidSignature.into();
        assert!(matches!(err, FsError::Format(_)));
        assert_eq!(err.to_string(), "invalid on-disk format: invalid signature");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: FsError = io.into();
        assert!(matches!(err, FsError::Io(_)));
    }
}
