//! Error categories shared by every subsystem.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors surfaced by the diff, patch, validation and heal machinery.
#[derive(Error, Debug)]
pub enum Error {
    /// Wrong magic, truncated frame, undecodable message or an op that is not
    /// allowed at its position in the stream.
    #[error("malformed patch: {0}")]
    Malformed(String),

    /// A bsdiff series that would write past the declared file size.
    #[error("corrupt patch: {0}")]
    Corrupt(String),

    /// Unknown compression algorithm or format version.
    #[error("incompatible version: {0}")]
    IncompatibleVersion(String),

    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying storage does not hold the requested resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// Read or write failure on a pool or stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Any of the above, annotated with where it happened.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Category of an [`Error`], stable across context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Malformed,
    Corrupt,
    IncompatibleVersion,
    Cancelled,
    NotFound,
    TransientIo,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Malformed => "malformed",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::IncompatibleVersion => "incompatible version",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NotFound => "not found",
            ErrorKind::TransientIo => "transient I/O",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Returns the category of this error, looking through context layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Malformed(_) => ErrorKind::Malformed,
            Error::Corrupt(_) => ErrorKind::Corrupt,
            Error::IncompatibleVersion(_) => ErrorKind::IncompatibleVersion,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Io(e) if e.kind() == io::ErrorKind::NotFound => ErrorKind::NotFound,
            Error::Io(_) => ErrorKind::TransientIo,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Wraps `self` with a description of where it happened.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Error::Malformed(format!("truncated message: {e}"))
            }
            bincode::ErrorKind::Io(e) => Error::Io(e),
            bincode::ErrorKind::Custom(msg)
                if msg.starts_with(crate::wire::compression::UNKNOWN_ALGORITHM) =>
            {
                Error::IncompatibleVersion(msg)
            }
            other => Error::Malformed(format!("undecodable message: {other}")),
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Error::Io(e),
            zip::result::ZipError::FileNotFound => Error::NotFound("zip entry".to_string()),
            other => Error::Malformed(format!("zip archive: {other}")),
        }
    }
}

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Attaches context to a fallible result, lazily.
pub trait ResultExt<T> {
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
