//! Error type shared by every IIO crate.
//!
//! Each variant corresponds to one errno value that can travel in the `code`
//! field of a response frame. Conversions in both directions are lossless for
//! the well-known set; anything else is kept verbatim in [`Error::Errno`].

use thiserror::Error;

/// Errors surfaced by the object model, the protocol engine and the backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Bad index, bad length or malformed request (`EINVAL`).
    #[error("invalid argument")]
    InvalidArgument,

    /// Unknown attribute or object name (`ENOENT`).
    #[error("no such entry")]
    NotFound,

    /// The backend does not implement the operation (`ENOSYS`).
    #[error("operation not implemented")]
    NotImplemented,

    /// Resource already in use (`EBUSY`).
    #[error("resource busy")]
    Busy,

    /// The referenced object was freed (`EBADF`).
    #[error("bad descriptor")]
    BadDescriptor,

    /// Operation not allowed in the current state (`EPERM`).
    #[error("operation not permitted")]
    PermissionDenied,

    /// Allocation failure (`ENOMEM`).
    #[error("out of memory")]
    OutOfMemory,

    /// End of stream on the transport (`EPIPE`).
    #[error("broken pipe")]
    BrokenPipe,

    /// A deadline expired (`ETIMEDOUT`).
    #[error("timed out")]
    TimedOut,

    /// Generic I/O failure (`EIO`).
    #[error("I/O error")]
    Io,

    /// No such device (`ENODEV`).
    #[error("no such device")]
    NoDevice,

    /// Content does not match any supported form (`EOPNOTSUPP`).
    #[error("operation not supported")]
    NotSupported,

    /// No such device or address (`ENXIO`).
    #[error("no such device or address")]
    NoSuchAddress,

    /// The request was cancelled (`EINTR`).
    #[error("interrupted")]
    Interrupted,

    /// Non-blocking call with nothing ready (`EAGAIN`).
    #[error("resource temporarily unavailable")]
    WouldBlock,

    /// The XML context description could not be parsed.
    #[error("invalid XML: {reason}")]
    Xml { reason: String },

    /// A textual value could not be parsed.
    #[error("parse error: {reason}")]
    Parse { reason: String },

    /// Any other errno value, kept positive.
    #[error("errno {0}")]
    Errno(i32),
}

impl Error {
    /// Positive errno value for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument | Error::Xml { .. } | Error::Parse { .. } => libc::EINVAL,
            Error::NotFound => libc::ENOENT,
            Error::NotImplemented => libc::ENOSYS,
            Error::Busy => libc::EBUSY,
            Error::BadDescriptor => libc::EBADF,
            Error::PermissionDenied => libc::EPERM,
            Error::OutOfMemory => libc::ENOMEM,
            Error::BrokenPipe => libc::EPIPE,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Io => libc::EIO,
            Error::NoDevice => libc::ENODEV,
            Error::NotSupported => libc::EOPNOTSUPP,
            Error::NoSuchAddress => libc::ENXIO,
            Error::Interrupted => libc::EINTR,
            Error::WouldBlock => libc::EAGAIN,
            Error::Errno(e) => *e,
        }
    }

    /// Negative wire code for this error.
    pub fn code(&self) -> i32 {
        -self.errno()
    }

    /// Builds an error from a positive errno value.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => Error::InvalidArgument,
            libc::ENOENT => Error::NotFound,
            libc::ENOSYS => Error::NotImplemented,
            libc::EBUSY => Error::Busy,
            libc::EBADF => Error::BadDescriptor,
            libc::EPERM => Error::PermissionDenied,
            libc::ENOMEM => Error::OutOfMemory,
            libc::EPIPE => Error::BrokenPipe,
            libc::ETIMEDOUT => Error::TimedOut,
            libc::EIO => Error::Io,
            libc::ENODEV => Error::NoDevice,
            libc::EOPNOTSUPP => Error::NotSupported,
            libc::ENXIO => Error::NoSuchAddress,
            libc::EINTR => Error::Interrupted,
            libc::EAGAIN => Error::WouldBlock,
            other => Error::Errno(other),
        }
    }

    /// Builds an error from a negative wire code.
    pub fn from_code(code: i32) -> Self {
        Self::from_errno(code.saturating_neg())
    }

    /// Splits a response code into a byte count or an error.
    pub fn check(code: i32) -> Result<usize> {
        if code < 0 {
            Err(Self::from_code(code))
        } else {
            Ok(code as usize)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => Error::BrokenPipe,
            ErrorKind::TimedOut => Error::TimedOut,
            ErrorKind::Interrupted => Error::Interrupted,
            ErrorKind::WouldBlock => Error::WouldBlock,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Error::InvalidArgument,
            ErrorKind::NotFound => Error::NotFound,
            ErrorKind::PermissionDenied => Error::PermissionDenied,
            _ => e.raw_os_error().map(Error::from_errno).unwrap_or(Error::Io),
        }
    }
}

/// Result alias used throughout the IIO crates.
pub type Result<T> = std::result::Result<T, Error>;
