//! Error types for the dependency file.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DepFileError>;

/// Errors surfaced while reading or writing a dependency file.
#[derive(Debug)]
pub enum DepFileError {
    /// Underlying file I/O failed.
    Io(io::Error),
    /// The file does not start with the magic constant; carries what was
    /// found instead.
    BadMagic(u64),
    /// The file was written by a different build. Carries `(expected,
    /// found)` revisions.
    BuildRevisionMismatch(String, String),
    /// A record tag outside the contracted {row, done} set; the file was
    /// not produced by this writer. Fatal.
    Unreachable(u8),
    /// A row whose shape is impossible (ragged blob, non-UTF-8 revision).
    MalformedRow,
}

impl fmt::Display for DepFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepFileError::Io(e) => write!(f, "dependency file I/O failed: {}", e),
            DepFileError::BadMagic(found) => {
                write!(f, "not a dependency file (magic {:#x})", found)
            }
            DepFileError::BuildRevisionMismatch(expected, found) => write!(
                f,
                "dependency file was written by build {:?}, this is build {:?}",
                found, expected
            ),
            DepFileError::Unreachable(tag) => {
                write!(f, "unreachable record tag {} in dependency file", tag)
            }
            DepFileError::MalformedRow => write!(f, "malformed dependency file row"),
        }
    }
}

impl std::error::Error for DepFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DepFileError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DepFileError {
    fn from(e: io::Error) -> Self {
        DepFileError::Io(e)
    }
}
