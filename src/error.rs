//! Error types.

use std::error::Error as StdError;
use std::path::PathBuf;
use std::{fmt, io, result};

/// Type alias to use this crate's `Error` type in a `Result`.
pub type Result<T> = result::Result<T, Error>;

/// Error kinds.
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error.
    Generic(String),
    /// I/O error from the operating system.
    Io(io::Error),
    /// The directory to watch does not exist.
    PathNotFound,
    /// The path opened for watching is not a directory.
    NotADirectory,
    /// The service has been closed; no further registrations are accepted.
    ServiceClosed,
    /// The watch key has been cancelled or its registration failed; no
    /// further events will be delivered.
    KeyInvalid,
}

/// Error type for this crate.
#[derive(Debug)]
pub struct Error {
    /// Kind of the error.
    pub kind: ErrorKind,
    /// Relevant paths, if any.
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Creates a new error with the given kind.
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a "generic" error with the given message.
    pub fn generic(msg: &str) -> Self {
        Error::new(ErrorKind::Generic(msg.to_string()))
    }

    /// Creates an "I/O" error, mapping not-found to [`ErrorKind::PathNotFound`].
    pub fn io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Error::path_not_found()
        } else {
            Error::new(ErrorKind::Io(err))
        }
    }

    /// Creates a "path not found" error.
    pub fn path_not_found() -> Self {
        Error::new(ErrorKind::PathNotFound)
    }

    /// Creates a "not a directory" error.
    pub fn not_a_directory() -> Self {
        Error::new(ErrorKind::NotADirectory)
    }

    /// Creates a "service closed" error.
    pub fn service_closed() -> Self {
        Error::new(ErrorKind::ServiceClosed)
    }

    /// Creates a "key invalid" error.
    pub fn key_invalid() -> Self {
        Error::new(ErrorKind::KeyInvalid)
    }

    /// Adds a path to the error.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Generic(msg) => write!(f, "{}", msg)?,
            ErrorKind::Io(err) => write!(f, "I/O error: {}", err)?,
            ErrorKind::PathNotFound => write!(f, "no path was found")?,
            ErrorKind::NotADirectory => write!(f, "path is not a directory")?,
            ErrorKind::ServiceClosed => write!(f, "watch service is closed")?,
            ErrorKind::KeyInvalid => write!(f, "watch key is no longer valid")?,
        }
        if !self.paths.is_empty() {
            write!(f, " about {:?}", self.paths)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        Error::service_closed()
    }
}

impl From<crossbeam_channel::RecvError> for Error {
    fn from(_: crossbeam_channel::RecvError) -> Self {
        Error::service_closed()
    }
}
