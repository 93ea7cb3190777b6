//! Error types for Sandkeep Core

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Sandkeep operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Path, name and filesystem precondition errors
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Path outside sandbox: {0}")]
    PathOutsideSandbox(String),

    #[error("Refusing to operate on the sandbox root: {0}")]
    SandboxRoot(String),

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Content size {size} exceeds limit of {limit} bytes")]
    ContentTooLarge { size: u64, limit: u64 },

    #[error("File size {size} exceeds read limit of {limit} bytes: {path}")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("File is not valid UTF-8: {0}")]
    NotUtf8(String),
}

/// Archive validation, extraction and creation errors
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive entry escapes its destination: {0}")]
    EntryEscapes(String),

    #[error("Archive holds more than {limit} entries")]
    TooManyEntries { limit: usize },

    #[error("Compression ratio {ratio:.2} of entry '{entry}' exceeds limit {limit}")]
    RatioExceeded { entry: String, ratio: f64, limit: f64 },

    #[error("Entry '{0}' declares zero compressed size but nonzero content")]
    ZeroCompressedSize(String),

    #[error("Uncompressed size exceeds limit of {limit} bytes")]
    TotalSizeExceeded { limit: u64 },

    #[error("Nested archive depth limit of {limit} reached at '{archive}'")]
    RecursionLimit { archive: PathBuf, limit: u32 },

    #[error("Archive source not found: {0}")]
    SourceNotFound(String),

    #[error("Not a valid archive: {0}")]
    Malformed(String),
}

/// Resource lock errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Resource '{key}' is busy (not acquired within {timeout:?}), try again later")]
    Timeout { key: String, timeout: Duration },
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Connection pool error: {0}")]
    Pool(String),
}

/// Configuration validation errors
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than 0")]
    ZeroLimit { field: &'static str },

    #[error("archive max_ratio must be a positive number, got {0}")]
    InvalidRatio(f64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Failure categories surfaced to drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SecurityViolation,
    InvalidName,
    QuotaExceeded,
    ResourceBusy,
    NotFound,
    AlreadyExists,
    DirectoryNotEmpty,
    MalformedArchive,
    InvalidContent,
    Io,
    Storage,
    Config,
    Internal,
}

impl ErrorKind {
    /// Only lock contention is worth retrying as-is
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ResourceBusy)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Sandbox(e) => match e {
                SandboxError::PathOutsideSandbox(_) | SandboxError::SandboxRoot(_) => {
                    ErrorKind::SecurityViolation
                }
                SandboxError::InvalidName { .. } => ErrorKind::InvalidName,
                SandboxError::FileNotFound(_) | SandboxError::DirectoryNotFound(_) => {
                    ErrorKind::NotFound
                }
                SandboxError::AlreadyExists(_) => ErrorKind::AlreadyExists,
                SandboxError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
                SandboxError::ContentTooLarge { .. } | SandboxError::FileTooLarge { .. } => {
                    ErrorKind::QuotaExceeded
                }
                SandboxError::NotUtf8(_) => ErrorKind::InvalidContent,
            },
            Error::Archive(e) => match e {
                ArchiveError::EntryEscapes(_) => ErrorKind::SecurityViolation,
                ArchiveError::TooManyEntries { .. }
                | ArchiveError::RatioExceeded { .. }
                | ArchiveError::ZeroCompressedSize(_)
                | ArchiveError::TotalSizeExceeded { .. }
                | ArchiveError::RecursionLimit { .. } => ErrorKind::QuotaExceeded,
                ArchiveError::SourceNotFound(_) => ErrorKind::NotFound,
                ArchiveError::Malformed(_) => ErrorKind::MalformedArchive,
            },
            Error::Lock(LockError::Timeout { .. }) => ErrorKind::ResourceBusy,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Config(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_security_violation(&self) -> bool {
        self.kind() == ErrorKind::SecurityViolation
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Error::Storage(StorageError::Pool(err.to_string()))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Error::Io(e),
            other => Error::Archive(ArchiveError::Malformed(other.to_string())),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("Blocking task failed: {}", err))
    }
}

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = Error::Sandbox(SandboxError::PathOutsideSandbox("../x".into()));
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);
        assert!(err.is_security_violation());

        let err = Error::Archive(ArchiveError::EntryEscapes("../x".into()));
        assert_eq!(err.kind(), ErrorKind::SecurityViolation);

        let err = Error::Archive(ArchiveError::TooManyEntries { limit: 3 });
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        let err = Error::Archive(ArchiveError::Malformed("bad".into()));
        assert_eq!(err.kind(), ErrorKind::MalformedArchive);
    }

    #[test]
    fn test_only_busy_is_retryable() {
        let busy = Error::Lock(LockError::Timeout {
            key: "/sandbox/a".into(),
            timeout: Duration::from_millis(10),
        });
        assert!(busy.kind().is_retryable());

        let missing = Error::Sandbox(SandboxError::FileNotFound("a".into()));
        assert!(!missing.kind().is_retryable());
    }

    #[test]
    fn test_zip_io_error_stays_io() {
        let err: Error =
            zip::result::ZipError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).into();
        assert_eq!(err.kind(), ErrorKind::Io);

        let err: Error = zip::result::ZipError::InvalidArchive("bad header").into();
        assert_eq!(err.kind(), ErrorKind::MalformedArchive);
    }
}
