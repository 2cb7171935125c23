use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Terminal state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Relocated,
    /// Dry-run only: would have been relocated
    Planned,
    /// Duplicate content; source left in place
    Skipped,
    NotAnImage,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Relocated => "relocated",
            Outcome::Planned => "planned",
            Outcome::Skipped => "skipped",
            Outcome::NotAnImage => "not-an-image",
            Outcome::Failed => "failed",
        }
    }
}

/// One line of the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub source_path: PathBuf,
    pub outcome: Outcome,
    /// Where the file went, or where its content already is
    pub destination_path: Option<PathBuf>,
    /// Failure reason, or a non-fatal warning (metadata decode) on success
    pub error_kind: Option<ErrorKind>,
    /// Destination is a suffixed variant of the canonical path
    #[serde(default)]
    pub renamed: bool,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl ReportEntry {
    pub fn new(source_path: PathBuf, outcome: Outcome) -> Self {
        Self {
            source_path,
            outcome,
            destination_path: None,
            error_kind: None,
            renamed: false,
            fingerprint: None,
        }
    }

    pub fn failed(source_path: PathBuf, kind: ErrorKind) -> Self {
        Self {
            error_kind: Some(kind),
            ..Self::new(source_path, Outcome::Failed)
        }
    }

    fn csv_fields(&self) -> [String; 4] {
        [
            self.source_path.display().to_string(),
            self.outcome.as_str().to_string(),
            self.destination_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.error_kind.map(|k| k.as_str().to_string()).unwrap_or_default(),
        ]
    }
}

pub const CSV_HEADER: [&str; 4] = ["source_path", "outcome", "destination_path", "error_kind"];

/// Everything that happened during one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub cancelled: bool,
    /// A walker or worker thread died, so some files may be missing
    #[serde(default)]
    pub incomplete: bool,
    pub entries: Vec<ReportEntry>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    pub fn push(&mut self, entry: ReportEntry) {
        self.entries.push(entry);
    }

    /// Order entries by source path for stable output.
    pub fn sort(&mut self) {
        self.entries.sort_by(|a, b| a.source_path.cmp(&b.source_path));
    }

    pub fn counts(&self) -> BTreeMap<Outcome, u64> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.outcome).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.entries.iter().filter(|e| e.outcome == outcome).count() as u64
    }

    pub fn has_failures(&self) -> bool {
        self.incomplete || self.entries.iter().any(|e| e.outcome == Outcome::Failed)
    }

    pub fn entry_for(&self, source: &Path) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.source_path == source)
    }

    /// Human-readable one-paragraph summary.
    pub fn summary(&self) -> String {
        let counts = self.counts();
        let get = |o: Outcome| counts.get(&o).copied().unwrap_or(0);
        let moved = if self.dry_run {
            format!("{} planned", get(Outcome::Planned))
        } else {
            format!("{} relocated", get(Outcome::Relocated))
        };
        let renamed = self.entries.iter().filter(|e| e.renamed).count();
        let degraded = self
            .entries
            .iter()
            .filter(|e| e.error_kind == Some(ErrorKind::MetadataDecode))
            .count();

        let mut out = format!(
            "{}{} candidates: {} ({} renamed), {} duplicates skipped, {} not images, {} failed",
            if self.dry_run { "[dry-run] " } else { "" },
            self.entries.len(),
            moved,
            renamed,
            get(Outcome::Skipped),
            get(Outcome::NotAnImage),
            get(Outcome::Failed),
        );
        if degraded > 0 {
            out.push_str(&format!(", {} without readable metadata", degraded));
        }
        out.push_str(&format!(" ({:.2}s)", self.elapsed.as_secs_f64()));
        if self.cancelled {
            out.push_str(" [cancelled]");
        }
        if self.incomplete {
            out.push_str(" [incomplete]");
        }
        out
    }

    /// Header plus one record per entry.
    pub fn write_csv<W: Write>(&self, writer: W) -> csv::Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(CSV_HEADER)?;
        for entry in &self.entries {
            csv.write_record(entry.csv_fields())?;
        }
        csv.flush()?;
        Ok(())
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let file = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(file, self).map_err(io::Error::from)
    }
}
