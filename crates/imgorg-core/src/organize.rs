use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::candidate::{Action, DestinationDecision, FileCandidate, MetadataRecord};
use crate::cancel::CancellationToken;
use crate::classify::PathClassifier;
use crate::error::{Error, ErrorKind};
use crate::hash;
use crate::index::{DuplicateIndex, Reservation};
use crate::metadata::{self, ExifReader, MetadataReader};
use crate::relocate::Relocator;
use crate::report::{Outcome, ReportEntry, RunReport};
use crate::resolve::ConflictResolver;
use crate::walk::{self, WalkStats};
use crate::{DecisionCallback, OrganizeControl, OrganizeOptions, ProgressCallback, ThrottledProgress};

/// Per-candidate pipeline stages, in the only order they may occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Discovered,
    MetadataRead,
    Classified,
    DedupChecked,
}

/// The organizing engine: one instance per run.
pub struct Organizer {
    source: PathBuf,
    dest: PathBuf,
    dry_run: bool,
    workers: usize,
    classifier: PathClassifier,
    resolver: ConflictResolver,
    relocator: Relocator,
    index: DuplicateIndex,
    reader: Box<dyn MetadataReader>,
}

impl Organizer {
    /// Validate roots and template and build every component. Nothing is
    /// processed yet; errors here are configuration errors.
    pub fn new(options: &OrganizeOptions) -> Result<Self, Error> {
        let classifier = PathClassifier::new(&options.template)?;
        let source = validate_source(&options.source)?;
        let dest = prepare_dest(&options.dest, options.dry_run)?;

        if dest == source {
            return Err(Error::invalid_root(
                "destination",
                &dest,
                "destination must differ from source",
            ));
        }
        if source.starts_with(&dest) {
            return Err(Error::invalid_root(
                "source",
                &source,
                "source must not be inside the destination",
            ));
        }

        let index = if options.seed_from_destination {
            DuplicateIndex::seeded_from(&dest)
        } else {
            DuplicateIndex::new()
        };

        Ok(Self {
            resolver: ConflictResolver::new(&dest, options.max_suffix),
            relocator: Relocator::new(
                options.mode,
                Duration::from_millis(options.retry_backoff_ms),
            ),
            workers: options.effective_workers(),
            dry_run: options.dry_run,
            classifier,
            index,
            source,
            dest,
            reader: Box::new(ExifReader),
        })
    }

    /// Replace the metadata decoder.
    pub fn with_reader(mut self, reader: impl MetadataReader + 'static) -> Self {
        self.reader = Box::new(reader);
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Walk, process and report. Per-file problems end up in the report;
    /// only failing to start the worker pool is an error.
    pub fn run(
        &self,
        control: &OrganizeControl,
        progress_callback: &ProgressCallback,
        decision_callback: &DecisionCallback,
    ) -> Result<RunReport, Error> {
        let start = Instant::now();
        let cancel = control.cancel_token.as_ref();
        let tp = ThrottledProgress::new(progress_callback);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("imgorg-worker-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("cannot start worker pool: {}", e)))?;

        info!(
            "Organizing {} -> {} with {} workers{}",
            self.source.display(),
            self.dest.display(),
            self.workers,
            if self.dry_run { " (dry run)" } else { "" }
        );

        let exclude = self.dest.starts_with(&self.source).then_some(self.dest.as_path());
        let discovered = AtomicU64::new(0);
        let mut report = RunReport::new(self.dry_run);

        let (candidate_tx, candidate_rx) = mpsc::sync_channel::<FileCandidate>(self.workers * 4);
        let (entry_tx, entry_rx) = mpsc::channel::<ReportEntry>();

        let walk_stats = std::thread::scope(|s| {
            let walker = s.spawn(|| {
                walk::walk_sources(&self.source, exclude, cancel, Some(&discovered), candidate_tx)
            });

            let workers = s.spawn(move || {
                pool.install(|| {
                    candidate_rx.into_iter().par_bridge().for_each_with(
                        entry_tx,
                        |tx, candidate| {
                            let _ = tx.send(self.process_isolated(candidate, cancel));
                        },
                    )
                })
            });

            // Aggregation runs here, off the worker pool
            let mut processed = 0u64;
            for entry in entry_rx {
                decision_callback(&entry);
                tp.report(
                    "organize",
                    processed,
                    discovered.load(Ordering::Relaxed),
                    entry.outcome.as_str(),
                );
                processed += 1;
                report.push(entry);
            }

            let mut incomplete = false;
            if workers.join().is_err() {
                error!("The worker pool panicked; some candidates are missing from the report");
                incomplete = true;
            }
            let stats = walker.join().unwrap_or_else(|_| {
                error!("The source walk panicked; some candidates were never discovered");
                incomplete = true;
                WalkStats::default()
            });
            report.incomplete = incomplete;
            stats
        });

        report.sort();
        report.cancelled = cancel.is_some_and(|t| t.is_cancelled());
        report.elapsed = start.elapsed();
        info!(
            "Walk found {} files ({} unreadable, {} symlinks skipped); {}",
            walk_stats.discovered,
            walk_stats.unreadable,
            walk_stats.symlinks_skipped,
            report.summary()
        );
        Ok(report)
    }

    /// [`process`](Self::process), with a panic turned into a failed entry so
    /// the rest of the batch keeps going. A reservation held at the time is
    /// released as the guard unwinds.
    fn process_isolated(
        &self,
        candidate: FileCandidate,
        cancel: Option<&CancellationToken>,
    ) -> ReportEntry {
        let path = candidate.source_path.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| self.process(candidate, cancel))) {
            Ok(entry) => entry,
            Err(_) => {
                error!("Processing {} panicked", path.display());
                ReportEntry::failed(path, ErrorKind::Internal)
            }
        }
    }

    /// Drive one candidate through every stage to a terminal outcome.
    fn process(&self, candidate: FileCandidate, cancel: Option<&CancellationToken>) -> ReportEntry {
        let path = candidate.source_path.clone();
        let mut stage = Stage::Discovered;

        if cancel.is_some_and(|t| t.is_cancelled()) {
            return ReportEntry::failed(path, ErrorKind::Cancelled);
        }

        let (metadata, warning) = match self.reader.read(&path) {
            Ok(metadata) => (metadata, None),
            Err(e) if !metadata::is_image_like(&path) => {
                debug!("{} is not an image: {}", path.display(), e);
                return ReportEntry::new(path, Outcome::NotAnImage);
            }
            Err(e) => {
                warn!("{}; falling back to modification time", e);
                (MetadataRecord::default(), Some(ErrorKind::MetadataDecode))
            }
        };
        advance(&mut stage, Stage::MetadataRead, &path);

        let proposed = self.classifier.classify(&candidate, &metadata);
        advance(&mut stage, Stage::Classified, &path);

        let fingerprint = match hash::hash_file(&path, Some(candidate.size)) {
            Ok(fp) => fp,
            Err(e) => {
                warn!("Cannot hash {}: {}", path.display(), e);
                return ReportEntry::failed(path, ErrorKind::HashRead);
            }
        };

        let reservation =
            match self
                .index
                .try_reserve(fingerprint, candidate.size, &proposed, &self.resolver)
            {
                Ok(r) => r,
                Err(kind) => {
                    warn!("No destination for {}: {}", path.display(), kind);
                    return ReportEntry::failed(path, kind);
                }
            };
        advance(&mut stage, Stage::DedupChecked, &path);

        let (decision, guard) = match reservation {
            Reservation::AlreadyPresent(existing) => (
                DestinationDecision {
                    canonical_path: Some(existing),
                    action: Action::SkipDuplicate,
                },
                None,
            ),
            Reservation::Reserved(guard) => (
                DestinationDecision {
                    canonical_path: Some(guard.path().to_path_buf()),
                    action: if guard.is_renamed() {
                        Action::Rename
                    } else {
                        Action::Move
                    },
                },
                Some(guard),
            ),
        };

        let mut entry = ReportEntry::new(path, Outcome::Skipped);
        entry.destination_path = decision.canonical_path.clone();
        entry.renamed = decision.action == Action::Rename;
        entry.fingerprint = Some(fingerprint.to_hex());
        entry.error_kind = warning;

        entry.outcome = match decision.action {
            Action::SkipDuplicate => Outcome::Skipped,
            _ if self.dry_run => {
                // Keep the claim so later duplicates see the same decisions
                // a real run would make.
                if let Some(guard) = guard {
                    guard.commit();
                }
                Outcome::Planned
            }
            _ => match self.relocator.commit(&entry.source_path, &decision, guard) {
                Ok(()) => Outcome::Relocated,
                Err(kind) => {
                    entry.error_kind = Some(kind);
                    Outcome::Failed
                }
            },
        };

        debug!(
            "{} -> {} ({})",
            entry.source_path.display(),
            entry
                .destination_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            decision.action.as_str()
        );
        entry
    }
}

fn advance(stage: &mut Stage, next: Stage, path: &Path) {
    debug_assert!(next > *stage, "stage {:?} after {:?}", next, stage);
    tracing::trace!("{}: {:?} -> {:?}", path.display(), stage, next);
    *stage = next;
}

fn validate_source(source: &Path) -> Result<PathBuf, Error> {
    let canonical = source
        .canonicalize()
        .map_err(|e| Error::invalid_root("source", source, e))?;
    if !canonical.is_dir() {
        return Err(Error::invalid_root("source", source, "not a directory"));
    }
    fs::read_dir(&canonical).map_err(|e| Error::invalid_root("source", source, e))?;
    Ok(canonical)
}

/// Canonical destination root. Created when missing, except in dry-run
/// where nothing may be touched.
fn prepare_dest(dest: &Path, dry_run: bool) -> Result<PathBuf, Error> {
    if !dest.exists() {
        if dry_run {
            return std::path::absolute(dest).map_err(|e| Error::invalid_root("destination", dest, e));
        }
        fs::create_dir_all(dest).map_err(|e| Error::invalid_root("destination", dest, e))?;
    }
    let canonical = dest
        .canonicalize()
        .map_err(|e| Error::invalid_root("destination", dest, e))?;
    if !canonical.is_dir() {
        return Err(Error::invalid_root("destination", dest, "not a directory"));
    }
    fs::read_dir(&canonical).map_err(|e| Error::invalid_root("destination", dest, e))?;
    Ok(canonical)
}
