use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::candidate::{Action, DestinationDecision};
use crate::error::ErrorKind;
use crate::index::ReservationGuard;

/// Prefix of in-progress files inside the destination tree.
pub const TEMP_PREFIX: &str = ".imgorg-";

const DEFAULT_BACKOFF_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Source is removed once the destination is complete
    #[default]
    Move,
    /// Source is kept; the destination is an independent copy
    Copy,
}

/// Commits relocation decisions to the filesystem.
///
/// A transfer either leaves the complete file at the destination (and, for
/// moves, removes the source) or leaves the source untouched and no file at
/// the destination.
#[derive(Debug, Clone)]
pub struct Relocator {
    mode: TransferMode,
    retry_backoff: Duration,
}

impl Default for Relocator {
    fn default() -> Self {
        Self::new(TransferMode::Move, Duration::from_millis(DEFAULT_BACKOFF_MS))
    }
}

impl Relocator {
    pub fn new(mode: TransferMode, retry_backoff: Duration) -> Self {
        Self {
            mode,
            retry_backoff,
        }
    }

    /// Execute `decision` for `source`. The reservation is committed on
    /// success and released on failure.
    pub fn commit(
        &self,
        source: &Path,
        decision: &DestinationDecision,
        reservation: Option<ReservationGuard<'_>>,
    ) -> Result<(), ErrorKind> {
        let dest = match decision.action {
            Action::SkipDuplicate => return Ok(()),
            Action::Fail(kind) => return Err(kind),
            Action::Move | Action::Rename => match &decision.canonical_path {
                Some(dest) => dest,
                None => return Err(ErrorKind::DestinationWrite),
            },
        };

        // One retry after a pause; anything past that is reported.
        for attempt in 1..=2 {
            match self.transfer(source, dest) {
                Ok(()) => {
                    if let Some(guard) = reservation {
                        guard.commit();
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Relocating {} -> {} failed (attempt {}): {}",
                        source.display(),
                        dest.display(),
                        attempt,
                        e
                    );
                    if attempt == 1 {
                        std::thread::sleep(self.retry_backoff);
                    }
                }
            }
        }

        // Dropping the guard releases the reservation
        drop(reservation);
        Err(ErrorKind::DestinationWrite)
    }

    fn transfer(&self, source: &Path, dest: &Path) -> io::Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if self.mode == TransferMode::Move {
            match fs::hard_link(source, dest) {
                Ok(()) => {
                    if let Err(e) = fs::remove_file(source) {
                        let _ = fs::remove_file(dest);
                        return Err(e);
                    }
                    debug!("Linked {} -> {}", source.display(), dest.display());
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(e),
                // Cross-device or no hard link support: fall back to copying
                Err(_) => {}
            }
        }

        copy_via_temp(source, dest)?;

        if self.mode == TransferMode::Move {
            if let Err(e) = fs::remove_file(source) {
                let _ = fs::remove_file(dest);
                return Err(e);
            }
        }
        debug!("Copied {} -> {}", source.display(), dest.display());
        Ok(())
    }
}

fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!("{}{}.part", TEMP_PREFIX, name))
}

/// Copy into a temp file next to `dest`, then publish it without ever
/// overwriting an existing file. The temp file is removed on every path.
fn copy_via_temp(source: &Path, dest: &Path) -> io::Result<()> {
    let tmp = temp_path_for(dest);
    let result = write_temp(source, &tmp).and_then(|()| publish(&tmp, dest));
    let _ = fs::remove_file(&tmp);
    result
}

fn write_temp(source: &Path, tmp: &Path) -> io::Result<()> {
    let mut input = File::open(source)?;
    let src_meta = input.metadata()?;

    let out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)?;
    let mut writer = BufWriter::new(out);
    let written = io::copy(&mut input, &mut writer)?;
    writer.flush()?;
    let out = writer.into_inner().map_err(|e| e.into_error())?;
    out.sync_all()?;

    if written != src_meta.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("copied {} of {} bytes", written, src_meta.len()),
        ));
    }

    filetime::set_file_mtime(tmp, FileTime::from_last_modification_time(&src_meta))?;
    Ok(())
}

fn publish(tmp: &Path, dest: &Path) -> io::Result<()> {
    match fs::hard_link(tmp, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(_) => {
            if dest.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} appeared during copy", dest.display()),
                ));
            }
            fs::rename(tmp, dest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{DuplicateIndex, Reservation};
    use crate::resolve::ConflictResolver;
    use crate::Fingerprint;
    use tempfile::tempdir;

    fn decision(dest: PathBuf, action: Action) -> DestinationDecision {
        DestinationDecision {
            canonical_path: Some(dest),
            action,
        }
    }

    fn fast() -> Relocator {
        Relocator::new(TransferMode::Move, Duration::from_millis(1))
    }

    #[test]
    fn test_move_creates_parents_and_removes_source() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.jpg");
        std::fs::write(&src, b"photo").unwrap();
        let dest = dir.path().join("out/2020/01/in.jpg");

        fast().commit(&src, &decision(dest.clone(), Action::Move), None).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"photo");
    }

    #[test]
    fn test_copy_mode_keeps_source_and_mtime() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.jpg");
        std::fs::write(&src, b"photo").unwrap();
        let mtime = FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_mtime(&src, mtime).unwrap();
        let dest = dir.path().join("out/in.jpg");

        let relocator = Relocator::new(TransferMode::Copy, Duration::from_millis(1));
        relocator.commit(&src, &decision(dest.clone(), Action::Move), None).unwrap();
        assert_eq!(std::fs::read(&src).unwrap(), b"photo");
        assert_eq!(std::fs::read(&dest).unwrap(), b"photo");
        let meta = std::fs::metadata(&dest).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta), mtime);
        assert!(!temp_path_for(&dest).exists());
    }

    #[test]
    fn test_never_overwrites() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.jpg");
        let dest = dir.path().join("taken.jpg");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dest, b"old").unwrap();

        let err = fast().commit(&src, &decision(dest.clone(), Action::Rename), None).unwrap_err();
        assert_eq!(err, ErrorKind::DestinationWrite);
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
        assert_eq!(std::fs::read(&src).unwrap(), b"new");
    }

    #[test]
    fn test_failure_leaves_source_and_releases_reservation() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.jpg");
        std::fs::write(&src, b"photo").unwrap();
        // A regular file where a directory is needed makes the write fail
        let dest_root = dir.path().join("dest");
        std::fs::create_dir_all(&dest_root).unwrap();
        std::fs::write(dest_root.join("2020"), b"blocker").unwrap();

        let resolver = ConflictResolver::new(&dest_root, 10);
        let index = DuplicateIndex::new();
        let content = Fingerprint::of_bytes(b"photo");
        let Reservation::Reserved(guard) = index
            .try_reserve(content, 5, Path::new("2020/in.jpg"), &resolver)
            .unwrap()
        else {
            panic!("expected reservation");
        };
        let dest = guard.path().to_path_buf();

        let err = fast().commit(&src, &decision(dest, Action::Move), Some(guard)).unwrap_err();
        assert_eq!(err, ErrorKind::DestinationWrite);
        assert_eq!(std::fs::read(&src).unwrap(), b"photo");
        assert!(index.lookup(&content).is_none());
    }

    #[test]
    fn test_retry_after_backoff_succeeds() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.jpg");
        std::fs::write(&src, b"photo").unwrap();
        let dest_root = dir.path().join("dest");
        std::fs::create_dir_all(&dest_root).unwrap();
        let blocker = dest_root.join("2020");
        std::fs::write(&blocker, b"blocker").unwrap();
        let dest = dest_root.join("2020/in.jpg");

        // The blocker goes away while the first attempt's backoff is running
        let relocator = Relocator::new(TransferMode::Move, Duration::from_millis(500));
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(100));
                std::fs::remove_file(&blocker).unwrap();
            });
            relocator
                .commit(&src, &decision(dest.clone(), Action::Move), None)
                .unwrap();
        });
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"photo");
    }

    #[test]
    fn test_copy_via_temp_cleans_up_when_publish_fails() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.jpg");
        let dest = dir.path().join("taken.jpg");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dest, b"old").unwrap();

        let err = copy_via_temp(&src, &dest).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(!temp_path_for(&dest).exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
        assert_eq!(std::fs::read(&src).unwrap(), b"new");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_success_commits_reservation() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("in.jpg");
        std::fs::write(&src, b"photo").unwrap();
        let resolver = ConflictResolver::new(dir.path().join("dest"), 10);
        let index = DuplicateIndex::new();
        let content = Fingerprint::of_bytes(b"photo");
        let Reservation::Reserved(guard) = index
            .try_reserve(content, 5, Path::new("a/in.jpg"), &resolver)
            .unwrap()
        else {
            panic!("expected reservation");
        };
        let dest = guard.path().to_path_buf();

        fast().commit(&src, &decision(dest.clone(), Action::Move), Some(guard)).unwrap();
        assert_eq!(index.committed_len(), 1);
        assert_eq!(index.lookup(&content), Some(dest));
    }

    #[test]
    fn test_skip_is_a_no_op() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("dup.jpg");
        std::fs::write(&src, b"photo").unwrap();
        let elsewhere = dir.path().join("dest/dup.jpg");

        fast()
            .commit(&src, &decision(elsewhere.clone(), Action::SkipDuplicate), None)
            .unwrap();
        assert!(src.exists());
        assert!(!elsewhere.exists());
    }
}
