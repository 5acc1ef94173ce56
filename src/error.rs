//! Custom error types for the extension host.
//!
//! This module defines the primary error type, `HostError`, for the whole engine.
//! Using the `thiserror` crate, it provides a centralized and consistent way to report
//! everything that can go wrong while turning a script file into a running extension.
//!
//! ## Error Hierarchy
//!
//! Most variants are fatal to exactly one script. They are produced inside a load job,
//! logged together with the offending file name, and never reach the caller of
//! [`ExtensionManager`](crate::manager::ExtensionManager):
//!
//! - **`Compile`** / **`Evaluation`**: the toolchain rejected the script or its top-level
//!   code raised an error.
//! - **`CorruptCache`**, **`HeaderMismatch`**, **`ChecksumMismatch`**: a cache entry could not
//!   be trusted. The operator has to delete the stale file; entries are never patched.
//! - **`MalformedBundle`**: a bundle archive did not contain exactly one script and at most
//!   one library directory.
//! - **`ExtensionNotFound`** / **`AmbiguousExtension`**: evaluation succeeded but no single
//!   extension value could be extracted.
//! - **`DuplicateExtension`**: the same logical extension is already registered.
//!
//! The remaining variants describe misuse or misconfiguration of the engine itself
//! (unknown ids, unsupported files, a plugins path that is not a directory, I/O).
//!
//! Missing dependency libraries are not errors; see
//! [`MissingDependency`](crate::resolver::MissingDependency).

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the host error type.
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Position of a compile error inside the script source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    /// 1-based line
    pub line: usize,
    /// 1-based column, when the toolchain reports one
    pub column: Option<usize>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(column) => write!(f, "line {}, column {}", self.line, column),
            None => write!(f, "line {}", self.line),
        }
    }
}

/// Which registered property made a new extension collide with an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Same declared extension name
    Name(String),
    /// Same source checksum
    Checksum(String),
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::Name(name) => write!(f, "same name '{}'", name),
            Conflict::Checksum(sum) => write!(f, "same checksum {}", sum),
        }
    }
}

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum HostError {
    #[error("Compile error{}: {message}", location.map(|l| format!(" at {}", l)).unwrap_or_default())]
    Compile {
        message: String,
        location: Option<SourceLocation>,
    },

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Corrupt cache file {path:?}: {reason}")]
    CorruptCache { path: PathBuf, reason: String },

    #[error("Cache header mismatch in {path:?}: found '{found}', expected '{expected}'; delete the file")]
    HeaderMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error("Cache checksum mismatch in {path:?}: stored {stored}, source is {actual}; delete the file")]
    ChecksumMismatch {
        path: PathBuf,
        stored: String,
        actual: String,
    },

    #[error("Malformed bundle {path:?}: {reason}")]
    MalformedBundle { path: PathBuf, reason: String },

    #[error("No extension found in script output")]
    ExtensionNotFound,

    #[error("Ambiguous extension: {count} candidates found")]
    AmbiguousExtension { count: usize },

    #[error("Extension conflicts with already loaded '{existing}' ({conflict})")]
    DuplicateExtension { existing: String, conflict: Conflict },

    #[error("Extension id {0} does not exist")]
    UnknownExtension(u64),

    #[error("Not a loadable extension file: {0:?}")]
    UnsupportedFile(PathBuf),

    #[error("File {0:?} is already loaded or loading")]
    AlreadyLoaded(PathBuf),

    #[error("Host is shutting down")]
    ShuttingDown,

    #[error("Not a directory: {0:?}")]
    NotADirectory(PathBuf),

    #[error("Extension '{name}' cannot {action} while {state}")]
    InvalidState {
        name: String,
        action: &'static str,
        state: String,
    },

    #[error("Load job failed: {0}")]
    JobFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl HostError {
    /// Short, single-line rendering for the management interface.
    pub fn user_message(&self) -> String {
        match self {
            HostError::UnknownExtension(id) => format!("Id {} does not exist.", id),
            HostError::DuplicateExtension { existing, .. } => {
                format!("Conflicts with loaded extension \"{}\".", existing)
            }
            other => other.to_string(),
        }
    }
}
