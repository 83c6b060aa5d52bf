//! Filesystem error type and errno mapping.

use bosfs_store::StoreError;

/// Errors produced by the mount engine.
///
/// Every variant has a stable errno so the FUSE layer can answer the kernel;
/// remote failures collapse onto `EIO` unless they mean "no such key".
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Access(String),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    #[error("file exists: {0}")]
    Exists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("no such attribute: {0}")]
    NoAttr(String),

    #[error("value does not fit the supplied buffer")]
    Range,

    #[error("insufficient local disk space")]
    NoSpace,

    #[error("file is not open")]
    NotOpen,

    #[error("remote storage failure: {0}")]
    Storage(#[source] StoreError),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The positive errno value for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Access(_) => libc::EACCES,
            FsError::NotPermitted(_) => libc::EPERM,
            FsError::Exists(_) => libc::EEXIST,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::Invalid(_) => libc::EINVAL,
            FsError::NoAttr(_) => libc::ENODATA,
            FsError::Range => libc::ERANGE,
            FsError::NoSpace => libc::ENOSPC,
            FsError::NotOpen => libc::EBADF,
            FsError::Storage(_) => libc::EIO,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True when the error is a plain missing-path answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => FsError::NotFound(key),
            StoreError::Io(io) => FsError::Io(io),
            other => FsError::Storage(other),
        }
    }
}

/// Result type alias for filesystem operations.
pub type Result<T> = std::result::Result<T, FsError>;
