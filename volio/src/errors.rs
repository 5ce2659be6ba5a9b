// SPDX-License-Identifier: MIT

use core::fmt;

/// Result type for VolIO operations.
pub type VolIOResult<T = ()> = core::result::Result<T, VolIOError>;

/// Error type for VolIO operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolIOError {
    /// Underlying device failure.
    Other(&'static str),
    /// Attempted to read or write out of bounds.
    OutOfBounds,
    /// Operation not supported by this backend.
    Unsupported,
    /// Caller-side misuse (bad length, zero chunk, ...).
    Invalid(&'static str),
}

impl VolIOError {
    pub fn msg(&self) -> &'static str {
        match self {
            VolIOError::Other(msg) => msg,
            VolIOError::OutOfBounds => "Out of bounds",
            VolIOError::Unsupported => "Unsupported operation",
            VolIOError::Invalid(msg) => msg,
        }
    }
}

impl From<&'static str> for VolIOError {
    #[inline]
    fn from(msg: &'static str) -> Self {
        VolIOError::Other(msg)
    }
}

impl fmt::Display for VolIOError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())?;
        Ok(())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for VolIOError {}

#[cfg(feature = "std")]
impl From<std::io::Error> for VolIOError {
    #[cold]
    #[inline(never)]
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::UnexpectedEof => VolIOError::OutOfBounds,
            ErrorKind::Unsupported => VolIOError::Unsupported,
            ErrorKind::InvalidInput => VolIOError::Invalid("invalid input"),
            ErrorKind::NotFound => VolIOError::Other("device not found"),
            ErrorKind::PermissionDenied => VolIOError::Other("permission denied"),
            ErrorKind::Interrupted => VolIOError::Other("interrupted"),
            _ => VolIOError::Other("device I/O error"),
        }
    }
}
