//! Error taxonomy for the filesystem core
//!
//! One flat enumeration covers every failure the core can surface. The
//! mount glue maps these onto errno/NTSTATUS with [`ApiError::to_errno`].

use thiserror::Error;

/// Result alias used throughout the core
pub type ApiResult<T> = Result<T, ApiError>;

/// Flat error enumeration; one tag per kind
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    #[error("access denied")]
    AccessDenied,

    #[error("communication error")]
    CommError,

    #[error("decryption error")]
    DecryptionError,

    #[error("end of directory")]
    DirectoryEndOfFiles,

    #[error("directory exists")]
    DirectoryExists,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("directory not found")]
    DirectoryNotFound,

    #[error("download failed")]
    DownloadFailed,

    #[error("download incomplete")]
    DownloadIncomplete,

    #[error("download stopped")]
    DownloadStopped,

    #[error("file in use")]
    FileInUse,

    #[error("file size mismatch")]
    FileSizeMismatch,

    #[error("invalid handle")]
    InvalidHandle,

    #[error("invalid operation")]
    InvalidOperation,

    #[error("invalid ring buffer size")]
    InvalidRingBufferSize,

    #[error("invalid version")]
    InvalidVersion,

    #[error("item exists")]
    ItemExists,

    #[error("item not found")]
    ItemNotFound,

    #[error("name too long")]
    NameTooLong,

    #[error("no disk space")]
    NoDiskSpace,

    #[error("not implemented")]
    NotImplemented,

    #[error("not supported")]
    NotSupported,

    #[error("os error")]
    OsError,

    #[error("out of memory")]
    OutOfMemory,

    #[error("permission denied")]
    PermissionDenied,

    #[error("upload failed")]
    UploadFailed,

    #[error("xattr buffer too small")]
    XattrBufferSmall,

    #[error("xattr exists")]
    XattrExists,

    #[error("xattr not found")]
    XattrNotFound,

    #[error("xattr too big")]
    XattrTooBig,
}

impl ApiError {
    /// Map to a libc errno for the POSIX mount glue
    pub fn to_errno(self) -> i32 {
        match self {
            ApiError::ItemNotFound | ApiError::DirectoryNotFound => libc::ENOENT,
            ApiError::AccessDenied | ApiError::PermissionDenied => libc::EACCES,
            ApiError::DirectoryNotEmpty => libc::ENOTEMPTY,
            ApiError::ItemExists | ApiError::DirectoryExists => libc::EEXIST,
            ApiError::NoDiskSpace => libc::ENOSPC,
            ApiError::NotSupported | ApiError::NotImplemented => libc::ENOTSUP,
            ApiError::DownloadStopped => libc::EINTR,
            ApiError::NameTooLong => libc::ENAMETOOLONG,
            ApiError::InvalidHandle => libc::EBADF,
            ApiError::OutOfMemory => libc::ENOMEM,
            ApiError::XattrNotFound => libc::ENODATA,
            ApiError::XattrBufferSmall | ApiError::XattrTooBig => libc::ERANGE,
            _ => libc::EIO,
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ApiError::ItemNotFound,
            std::io::ErrorKind::PermissionDenied => ApiError::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ApiError::ItemExists,
            _ => {
                if err.raw_os_error() == Some(libc::ENOSPC) {
                    ApiError::NoDiskSpace
                } else {
                    ApiError::OsError
                }
            }
        }
    }
}
