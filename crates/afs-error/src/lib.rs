#![forbid(unsafe_code)]
//! Error types for AethelFS.
//!
//! Defines `AfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for FUSE response codes.

use thiserror::Error;

/// Unified error type for all AethelFS operations.
#[derive(Debug, Error)]
pub enum AfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("is a directory")]
    IsDirectory,

    #[error("not a directory")]
    NotDirectory,

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("device error: {0}")]
    Device(String),

    #[error("corrupt pool metadata: {0}")]
    Corrupt(String),
}

impl AfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::IsDirectory => libc::EISDIR,
            Self::NotDirectory => libc::ENOTDIR,
            Self::InvalidName(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::Device(_) | Self::Corrupt(_) => libc::EIO,
        }
    }
}

/// Result alias using `AfsError`.
pub type Result<T> = std::result::Result<T, AfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_posix_contract() {
        assert_eq!(AfsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(AfsError::Exists.to_errno(), libc::EEXIST);
        assert_eq!(AfsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(AfsError::IsDirectory.to_errno(), libc::EISDIR);
        assert_eq!(AfsError::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(AfsError::InvalidName("".into()).to_errno(), libc::EINVAL);
        assert_eq!(AfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(AfsError::Device("mmap".into()).to_errno(), libc::EIO);
        assert_eq!(AfsError::Corrupt("no uberblock".into()).to_errno(), libc::EIO);
    }

    #[test]
    fn io_error_preserves_raw_errno() {
        let err = AfsError::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.to_errno(), libc::EACCES);
    }
}
