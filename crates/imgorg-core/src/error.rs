use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a whole run before any candidate is processed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid {role} root {}: {reason}", .path.display())]
    InvalidRoot {
        role: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("invalid naming template {template:?}: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_root(role: &'static str, path: &std::path::Path, reason: impl ToString) -> Self {
        Error::InvalidRoot {
            role,
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Per-candidate failure kinds. These never abort a run; they are recorded
/// against the candidate in the report.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error("metadata could not be decoded")]
    MetadataDecode,
    #[error("file could not be read in full")]
    HashRead,
    #[error("destination could not be written")]
    DestinationWrite,
    #[error("no free destination name left")]
    ConflictResolutionExhausted,
    #[error("run was cancelled before this file was processed")]
    Cancelled,
    #[error("processing this file panicked")]
    Internal,
}

impl ErrorKind {
    /// Stable identifier used in machine-readable report lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MetadataDecode => "MetadataDecodeError",
            ErrorKind::HashRead => "HashReadError",
            ErrorKind::DestinationWrite => "DestinationWriteError",
            ErrorKind::ConflictResolutionExhausted => "ConflictResolutionExhausted",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "InternalError",
        }
    }
}
