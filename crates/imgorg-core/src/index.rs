use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::ErrorKind;
use crate::hash::{self, Fingerprint};
use crate::relocate::TEMP_PREFIX;
use crate::resolve::{ConflictResolver, Occupant, Slot, SlotProbe};

/// Result of [`DuplicateIndex::try_reserve`].
#[derive(Debug)]
pub enum Reservation<'a> {
    /// The caller owns this destination until the guard is committed or dropped.
    Reserved(ReservationGuard<'a>),
    /// The same content is already at (or committed to) this path.
    AlreadyPresent(PathBuf),
}

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    committed: bool,
}

#[derive(Debug, Default)]
struct IndexState {
    by_fingerprint: HashMap<Fingerprint, Entry>,
    /// In-run claims: destination path -> content reserved there
    claimed: HashMap<PathBuf, Fingerprint>,
    /// Sizes whose destination files have been folded into the index
    seeded_sizes: HashSet<u64>,
}

/// Fingerprints of files that were already in the destination tree. Each
/// path is hashed at most once, and never while the index lock is held.
#[derive(Debug, Default)]
struct DiskFingerprints {
    cells: Mutex<HashMap<PathBuf, Arc<OnceLock<Option<Fingerprint>>>>>,
}

impl DiskFingerprints {
    /// `None` if this path has not been hashed yet.
    fn cached(&self, path: &Path) -> Option<Option<Fingerprint>> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(path).and_then(|cell| cell.get().copied())
    }

    /// Concurrent callers for the same path wait on one hash.
    fn get_or_hash(&self, path: &Path, size: u64) -> Option<Fingerprint> {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cells.entry(path.to_path_buf()).or_default())
        };
        *cell.get_or_init(|| match hash::hash_file(path, Some(size)) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!("Cannot fingerprint existing {}: {}", path.display(), e);
                None
            }
        })
    }
}

/// Occupancy checks made while the index lock is held. A same-size disk file
/// that has not been hashed yet counts as `Different` and is queued in
/// `unhashed`; the caller hashes those after unlocking and resolves again.
struct LockedProbe<'a> {
    state: &'a IndexState,
    disk: &'a DiskFingerprints,
    unhashed: Vec<PathBuf>,
}

impl SlotProbe for LockedProbe<'_> {
    fn occupant(&mut self, path: &Path, fingerprint: &Fingerprint, size: u64) -> Occupant {
        if let Some(claimed) = self.state.claimed.get(path) {
            return if claimed == fingerprint {
                Occupant::Same
            } else {
                Occupant::Different
            };
        }
        match fs::symlink_metadata(path) {
            // Unreachable paths are left to the relocator, which never overwrites
            Err(_) => Occupant::Vacant,
            Ok(meta) if !meta.is_file() || meta.len() != size => Occupant::Different,
            Ok(_) => match self.disk.cached(path) {
                Some(Some(fp)) if fp == *fingerprint => Occupant::Same,
                Some(_) => Occupant::Different,
                None => {
                    self.unhashed.push(path.to_path_buf());
                    Occupant::Different
                }
            },
        }
    }
}

/// Destination files grouped by size, fingerprinted on demand.
#[derive(Debug, Default)]
struct SeedCatalog {
    by_size: HashMap<u64, Vec<PathBuf>>,
}

impl SeedCatalog {
    fn scan(dest_root: &Path) -> Self {
        let mut by_size: HashMap<u64, Vec<PathBuf>> = HashMap::new();
        if !dest_root.exists() {
            return Self { by_size };
        }
        for entry in WalkDir::new(dest_root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable destination entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                by_size.entry(meta.len()).or_default().push(entry.into_path());
            }
        }
        for paths in by_size.values_mut() {
            paths.sort();
        }
        Self { by_size }
    }

    fn file_count(&self) -> usize {
        self.by_size.values().map(Vec::len).sum()
    }
}

/// Fingerprint -> destination mapping shared by all workers.
///
/// Every check-and-reserve happens under one mutex, so two workers holding
/// the same content can never both be told to write it.
#[derive(Debug)]
pub struct DuplicateIndex {
    state: Mutex<IndexState>,
    changed: Condvar,
    disk: DiskFingerprints,
    seed: Option<SeedCatalog>,
}

impl DuplicateIndex {
    /// Index that only knows about the destination slots it probes.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IndexState::default()),
            changed: Condvar::new(),
            disk: DiskFingerprints::default(),
            seed: None,
        }
    }

    /// Index seeded from the files already under `dest_root`, so content
    /// organized by an earlier run is recognized wherever it lives.
    pub fn seeded_from(dest_root: &Path) -> Self {
        let catalog = SeedCatalog::scan(dest_root);
        debug!(
            "Catalogued {} existing destination files for seeding",
            catalog.file_count()
        );
        Self {
            seed: Some(catalog),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seed_paths(&self, size: u64) -> &[PathBuf] {
        self.seed
            .as_ref()
            .and_then(|seed| seed.by_size.get(&size))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Fold existing destination files of this size into the index. Only
    /// sizes that some candidate actually has are ever hashed, and the
    /// hashing is done by the caller before taking the lock.
    fn seed_size(&self, state: &mut IndexState, size: u64) {
        if self.seed.is_none() || !state.seeded_sizes.insert(size) {
            return;
        }
        for path in self.seed_paths(size) {
            if let Some(Some(fp)) = self.disk.cached(path) {
                state.by_fingerprint.entry(fp).or_insert_with(|| Entry {
                    path: path.clone(),
                    committed: true,
                });
            }
        }
    }

    /// Atomically check whether `fingerprint` already has a destination and,
    /// if not, claim a slot for it starting from `proposed` (relative to the
    /// resolver's destination root).
    ///
    /// If another worker holds an uncommitted reservation for the same
    /// content, this blocks until that reservation is committed or released.
    pub fn try_reserve(
        &self,
        fingerprint: Fingerprint,
        size: u64,
        proposed: &Path,
        resolver: &ConflictResolver,
    ) -> Result<Reservation<'_>, ErrorKind> {
        for path in self.seed_paths(size) {
            self.disk.get_or_hash(path, size);
        }

        let mut state = self.lock();
        self.seed_size(&mut state, size);

        let slot = loop {
            let existing = state
                .by_fingerprint
                .get(&fingerprint)
                .map(|e| (e.committed, e.path.clone()));
            match existing {
                Some((true, path)) => return Ok(Reservation::AlreadyPresent(path)),
                Some((false, _)) => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                    continue;
                }
                None => {}
            }

            let mut probe = LockedProbe {
                state: &state,
                disk: &self.disk,
                unhashed: Vec::new(),
            };
            let resolved = resolver.resolve(proposed, &fingerprint, size, &mut probe);
            let unhashed = probe.unhashed;
            if unhashed.is_empty() {
                break resolved?;
            }

            // Hash outside the lock, then check everything again since other
            // workers may have claimed slots in the meantime
            drop(state);
            for path in &unhashed {
                self.disk.get_or_hash(path, size);
            }
            state = self.lock();
        };

        match slot {
            Slot::Existing(path) => {
                state.by_fingerprint.insert(
                    fingerprint,
                    Entry {
                        path: path.clone(),
                        committed: true,
                    },
                );
                Ok(Reservation::AlreadyPresent(path))
            }
            Slot::Free(path) => {
                state.by_fingerprint.insert(
                    fingerprint,
                    Entry {
                        path: path.clone(),
                        committed: false,
                    },
                );
                state.claimed.insert(path.clone(), fingerprint);
                let renamed = path != resolver.dest_root().join(proposed);
                Ok(Reservation::Reserved(ReservationGuard {
                    index: self,
                    fingerprint,
                    path,
                    renamed,
                    committed: false,
                }))
            }
        }
    }

    /// Destination recorded for this content, committed or not.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        self.lock()
            .by_fingerprint
            .get(fingerprint)
            .map(|e| e.path.clone())
    }

    /// Number of committed entries.
    pub fn committed_len(&self) -> usize {
        self.lock()
            .by_fingerprint
            .values()
            .filter(|e| e.committed)
            .count()
    }

    fn finish(&self, fingerprint: &Fingerprint, path: &Path, commit: bool) {
        let mut state = self.lock();
        if commit {
            if let Some(entry) = state.by_fingerprint.get_mut(fingerprint) {
                entry.committed = true;
            }
        } else {
            state.by_fingerprint.remove(fingerprint);
            state.claimed.remove(path);
        }
        drop(state);
        self.changed.notify_all();
    }
}

impl Default for DuplicateIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// A provisional claim on a destination. Dropping it without calling
/// [`commit`](ReservationGuard::commit) releases the claim.
#[derive(Debug)]
pub struct ReservationGuard<'a> {
    index: &'a DuplicateIndex,
    fingerprint: Fingerprint,
    path: PathBuf,
    renamed: bool,
    committed: bool,
}

impl ReservationGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the slot is a suffixed variant of the proposed path.
    pub fn is_renamed(&self) -> bool {
        self.renamed
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Make the reservation durable for the rest of the run.
    pub fn commit(mut self) {
        self.committed = true;
        self.index.finish(&self.fingerprint, &self.path, true);
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.index.finish(&self.fingerprint, &self.path, false);
        }
    }
}
