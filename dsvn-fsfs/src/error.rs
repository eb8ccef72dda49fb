//! Error taxonomy for the FSFS read path
//!
//! Every failure is returned to the immediate caller. Nothing in the engine
//! logs-and-ignores an error or turns one into an empty result.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::ids::{ContainerId, Revnum};

/// Result type for read-path operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Where in the repository a corruption was detected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub container: ContainerId,
    pub offset: u64,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.container, self.offset)
    }
}

/// A violated format rule, with the place it was found when known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    pub detail: String,
    pub location: Option<Location>,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} ({})", self.detail, location),
            None => f.write_str(&self.detail),
        }
    }
}

/// Errors that can occur while reading a repository
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("No such revision {0}")]
    NoSuchRevision(Revnum),

    #[error("No such transaction '{0}'")]
    NoSuchTransaction(String),

    #[error("Reference to non-existent node '{0}'")]
    NoSuchNode(String),

    #[error("Corrupt filesystem: {0}")]
    Corrupt(Corruption),

    #[error("Checksum mismatch for {context}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Delta chain starting at {start} exceeds the maximum length of {max} links")]
    ChainTooLong { start: String, max: usize },

    #[error("I/O error while {op} '{}': {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl FsError {
    /// Corruption without a location; the I/O layer adds one via [`CorruptAt`].
    pub fn corrupt(detail: impl Into<String>) -> Self {
        FsError::Corrupt(Corruption {
            detail: detail.into(),
            location: None,
        })
    }

    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FsError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Fill in the path of an I/O error raised by a path-agnostic parser.
    pub fn with_path(self, file: &Path) -> Self {
        match self {
            FsError::Io { op, path, source } if path.as_os_str().is_empty() => FsError::Io {
                op,
                path: file.to_path_buf(),
                source,
            },
            other => other,
        }
    }

    /// Attach a location to a corruption error that has none.
    pub fn located(self, container: &ContainerId, offset: u64) -> Self {
        match self {
            FsError::Corrupt(Corruption {
                detail,
                location: None,
            }) => FsError::Corrupt(Corruption {
                detail,
                location: Some(Location {
                    container: container.clone(),
                    offset,
                }),
            }),
            other => other,
        }
    }

    /// True for the `NotFound` family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FsError::NoSuchRevision(_) | FsError::NoSuchTransaction(_) | FsError::NoSuchNode(_)
        )
    }

    /// True for malformed data, including runaway delta chains.
    pub fn is_corruption(&self) -> bool {
        matches!(self, FsError::Corrupt(_) | FsError::ChainTooLong { .. })
    }

    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, FsError::ChecksumMismatch { .. })
    }
}

/// Attach a repository location to corruption errors that lack one
pub trait CorruptAt {
    fn corrupt_at(self, container: &ContainerId, offset: u64) -> Self;
}

impl<T> CorruptAt for Result<T> {
    fn corrupt_at(self, container: &ContainerId, offset: u64) -> Self {
        self.map_err(|e| e.located(container, offset))
    }
}
