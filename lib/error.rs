//! Error taxonomy for the cache and synchronization engine.
//!
//! Remote responses carry a [`Status`]; it is translated into an [`FsError`] at the boundary.
//! Transient statuses (`TryAgain`, `Canceled`) are inspected by the synchronization retry loop
//! before that translation happens, so they only surface once their budgets are exhausted.

use thiserror::Error;

/// Non-success status codes a remote provider can answer a request with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum Status {
    /// The referenced entry does not exist on the remote side.
    #[error("entry not found")]
    NotFound,

    /// The caller lacks permission for the operation.
    #[error("permission denied")]
    PermissionDenied,

    /// The requested extended attribute does not exist.
    #[error("no data available")]
    NoData,

    /// Transient failure; the same request may succeed if retried.
    #[error("try again")]
    TryAgain,

    /// The remote side canceled the request; it may succeed if retried.
    #[error("request canceled")]
    Canceled,

    /// The target name already exists.
    #[error("entry already exists")]
    AlreadyExists,

    /// The directory is not empty.
    #[error("directory not empty")]
    NotEmpty,

    /// The request carried an invalid argument.
    #[error("invalid argument")]
    InvalidArgument,

    /// The remote side does not support the operation.
    #[error("operation not supported")]
    NotSupported,

    /// Any other POSIX error code reported verbatim.
    #[error("remote error code {0}")]
    Posix(i32),
}

/// Result of a single remote request.
pub type RemoteResult<T> = Result<T, Status>;

/// The typed error every filesystem-facing operation returns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FsError {
    /// The entry does not exist.
    #[error("entry not found")]
    NotFound,

    /// The remote side refused the operation.
    #[error("permission denied")]
    PermissionDenied,

    /// The extended attribute does not exist.
    #[error("no data available")]
    NoData,

    /// The synchronization retry budget was exhausted on `TryAgain` responses.
    #[error("resource temporarily unavailable")]
    TemporarilyUnavailable,

    /// Checksum mismatch after synchronization, or a storage I/O failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// The operation is not supported for this node type.
    #[error("operation not supported")]
    OperationNotSupported,

    /// The canceled-retry budget was exhausted.
    #[error("operation canceled")]
    Canceled,

    /// The target name already exists.
    #[error("entry already exists")]
    AlreadyExists,

    /// A directory was required.
    #[error("not a directory")]
    NotADirectory,

    /// A non-directory was required.
    #[error("is a directory")]
    IsADirectory,

    /// The directory still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// An argument was rejected.
    #[error("invalid argument")]
    InvalidArgument,

    /// The file handle is not open.
    #[error("bad file handle")]
    BadFileHandle,

    /// The remote provider did not answer in time.
    #[error("remote provider timed out")]
    TimedOut,

    /// Any other remote error code.
    #[error("remote error code {0}")]
    Remote(i32),
}

impl FsError {
    /// The errno value to reply with at the kernel boundary.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::NoData => libc::ENODATA,
            Self::TemporarilyUnavailable => libc::EAGAIN,
            Self::Io(_) => libc::EIO,
            Self::OperationNotSupported => libc::ENOTSUP,
            Self::Canceled => libc::ECANCELED,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::InvalidArgument => libc::EINVAL,
            Self::BadFileHandle => libc::EBADF,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::Remote(code) => *code,
        }
    }
}

impl From<Status> for FsError {
    fn from(status: Status) -> Self {
        match status {
            Status::NotFound => Self::NotFound,
            Status::PermissionDenied => Self::PermissionDenied,
            Status::NoData => Self::NoData,
            Status::TryAgain => Self::TemporarilyUnavailable,
            Status::Canceled => Self::Canceled,
            Status::AlreadyExists => Self::AlreadyExists,
            Status::NotEmpty => Self::NotEmpty,
            Status::InvalidArgument => Self::InvalidArgument,
            Status::NotSupported => Self::OperationNotSupported,
            Status::Posix(code) if code == libc::EPERM => Self::PermissionDenied,
            Status::Posix(code) => Self::Remote(code),
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::ENOENT) => Self::NotFound,
            Some(libc::EACCES | libc::EPERM) => Self::PermissionDenied,
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(e: FsError) -> Self {
        Self::from_raw_os_error(e.errno())
    }
}
