use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDateTime};

use crate::error::ErrorKind;

/// A source file discovered by the walk.
#[derive(Debug, Clone)]
pub struct FileCandidate {
    /// Absolute path under the source root
    pub source_path: PathBuf,
    /// File size in bytes at discovery time
    pub size: u64,
    /// Filesystem modification time
    pub modified: SystemTime,
}

impl FileCandidate {
    pub fn new(source_path: PathBuf, size: u64, modified: SystemTime) -> Self {
        Self {
            source_path,
            size,
            modified,
        }
    }

    /// Just the filename. Bytes that are not valid UTF-8 become U+FFFD,
    /// so the extension survives.
    pub fn file_name(&self) -> Cow<'_, str> {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default()
    }

    pub fn path(&self) -> &Path {
        &self.source_path
    }

    /// Modification time as local naive datetime, the same frame EXIF dates use.
    pub fn modified_local(&self) -> NaiveDateTime {
        DateTime::<Local>::from(self.modified).naive_local()
    }
}

/// Descriptive metadata decoded from a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    pub capture_timestamp: Option<NaiveDateTime>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    /// Remaining tags by name (e.g. "LensModel")
    pub other_tags: BTreeMap<String, String>,
}

impl MetadataRecord {
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.other_tags.get(name).map(|s| s.as_str())
    }
}

/// What the relocator should do with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Move to the proposed canonical path
    Move,
    /// Content already organized; leave the source alone
    SkipDuplicate,
    /// Move to a suffixed variant of the proposed path
    Rename,
    /// No destination could be decided
    Fail(ErrorKind),
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Move => "move",
            Action::SkipDuplicate => "skip-duplicate",
            Action::Rename => "rename",
            Action::Fail(_) => "fail",
        }
    }
}

/// Final destination for one candidate, decided once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationDecision {
    /// Absolute destination path (for `SkipDuplicate`, where the content already is)
    pub canonical_path: Option<PathBuf>,
    pub action: Action,
}
