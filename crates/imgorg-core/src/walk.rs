use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::candidate::FileCandidate;
use crate::cancel::CancellationToken;
use crate::relocate::TEMP_PREFIX;

#[derive(Debug, Default, Clone, Copy)]
pub struct WalkStats {
    pub discovered: u64,
    pub unreadable: u64,
    pub symlinks_skipped: u64,
}

/// Walk `root` without following symlinks and send every regular file as a
/// candidate. `exclude` (the destination, when nested in the source) is
/// pruned. Stops early when the token is cancelled or the receiver is gone.
/// `discovered` is bumped as files are sent, for live progress.
pub fn walk_sources(
    root: &Path,
    exclude: Option<&Path>,
    cancel: Option<&CancellationToken>,
    discovered: Option<&AtomicU64>,
    tx: SyncSender<FileCandidate>,
) -> WalkStats {
    let mut stats = WalkStats::default();
    let exclude: Option<PathBuf> = exclude.map(Path::to_path_buf);

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| match &exclude {
            Some(ex) => !e.path().starts_with(ex),
            None => true,
        });

    for entry in walker {
        if let Some(token) = cancel {
            if token.check().is_err() {
                debug!("Walk stopped by cancellation after {} files", stats.discovered);
                break;
            }
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable source entry: {}", e);
                stats.unreadable += 1;
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            stats.symlinks_skipped += 1;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            continue;
        }

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Cannot stat {}: {}", entry.path().display(), e);
                stats.unreadable += 1;
                continue;
            }
        };
        let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
        let candidate = FileCandidate::new(entry.into_path(), meta.len(), modified);

        if tx.send(candidate).is_err() {
            break;
        }
        stats.discovered += 1;
        if let Some(counter) = discovered {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    stats
}
