use std::path::{Path, PathBuf};

use crate::error::ErrorKind;
use crate::hash::Fingerprint;

pub const DEFAULT_MAX_SUFFIX: u32 = 9999;

/// What currently sits at a destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    Vacant,
    /// Identical content is already there
    Same,
    /// Unrelated content (on disk or claimed by another in-flight file)
    Different,
}

/// Answers occupancy questions for the resolver. Implemented by the
/// duplicate index, which knows both in-run claims and the disk.
pub trait SlotProbe {
    fn occupant(&mut self, path: &Path, fingerprint: &Fingerprint, size: u64) -> Occupant;
}

/// Outcome of probing for a destination slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// Free slot to write into
    Free(PathBuf),
    /// A slot that already holds identical content
    Existing(PathBuf),
}

/// Picks a non-colliding destination by appending `-1`, `-2`, … to the stem.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    dest_root: PathBuf,
    max_suffix: u32,
}

impl ConflictResolver {
    pub fn new(dest_root: impl Into<PathBuf>, max_suffix: u32) -> Self {
        Self {
            dest_root: dest_root.into(),
            max_suffix,
        }
    }

    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    /// Probe `proposed`, then its suffixed variants in order. The first slot
    /// that is vacant or already holds the same content wins, so the result
    /// only depends on which names are occupied.
    pub fn resolve(
        &self,
        proposed: &Path,
        fingerprint: &Fingerprint,
        size: u64,
        probe: &mut dyn SlotProbe,
    ) -> Result<Slot, ErrorKind> {
        let base = self.dest_root.join(proposed);
        for n in 0..=self.max_suffix {
            let candidate = if n == 0 { base.clone() } else { with_suffix(&base, n) };
            match probe.occupant(&candidate, fingerprint, size) {
                Occupant::Vacant => return Ok(Slot::Free(candidate)),
                Occupant::Same => return Ok(Slot::Existing(candidate)),
                Occupant::Different => continue,
            }
        }
        Err(ErrorKind::ConflictResolutionExhausted)
    }
}

/// `a/IMG_0001.jpg` + 2 -> `a/IMG_0001-2.jpg`; dotfiles and extensionless
/// names get the suffix at the end.
pub fn with_suffix(path: &Path, n: u32) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let new_name = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, n, ext),
        _ => format!("{}-{}", name, n),
    };
    path.with_file_name(new_name)
}
