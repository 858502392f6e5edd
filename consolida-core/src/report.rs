//! Per-file and per-run consolidation reports.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::engine::Staging;
use crate::locator::SourceFile;
use crate::model::{Period, RecordKind};
use crate::ports::{ApplyOutcome, TableCount};
use crate::reader::RowError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// How processing of one file ended.
pub enum FileStatus {
    /// Every row was read and every batch committed.
    Completed,
    /// A previous run already drained the file.
    AlreadyConsolidated,
    /// Stopped at a batch boundary on request; resumes from its checkpoint.
    Cancelled,
    /// Unreadable file or a batch that failed twice; later files still ran.
    Failed(String),
}

impl fmt::Display for FileStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => formatter.write_str("completed"),
            Self::AlreadyConsolidated => formatter.write_str("already consolidated"),
            Self::Cancelled => formatter.write_str("cancelled"),
            Self::Failed(reason) => write!(formatter, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Counters of one source file.
pub struct FileReport {
    /// Source identifier (`<period>/<file name>`).
    pub source: String,
    /// Snapshot period.
    pub period: Period,
    /// Record kind.
    pub kind: RecordKind,
    /// Batches committed.
    pub batches: u64,
    /// Rows read from the file in this run.
    pub rows_read: u64,
    /// Rows inserted (or appended, for partners and reference codes).
    pub inserted: u64,
    /// Stored rows rewritten.
    pub updated: u64,
    /// Rows whose values the store already held.
    pub unchanged: u64,
    /// Partner rows already present.
    pub duplicates: u64,
    /// Rows merged into another row of the same batch.
    pub folded: u64,
    /// Rows that could not be decoded.
    pub decode_skipped: u64,
    /// Rows refused by the store.
    pub apply_skipped: u64,
    /// First skipped rows, for manual follow-up.
    pub samples: Vec<String>,
    /// Final status.
    pub status: FileStatus,
}

impl FileReport {
    /// Empty report for a file.
    #[must_use]
    pub fn new(source: &SourceFile) -> Self {
        Self {
            source: source.source_id(),
            period: source.period,
            kind: source.kind,
            batches: 0,
            rows_read: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            duplicates: 0,
            folded: 0,
            decode_skipped: 0,
            apply_skipped: 0,
            samples: Vec::new(),
            status: FileStatus::Completed,
        }
    }

    /// Rows skipped for any reason.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.decode_skipped + self.apply_skipped
    }

    /// Count decode failures of a batch, keeping up to `limit` samples.
    pub fn record_row_errors(&mut self, errors: &[RowError], limit: usize) {
        self.decode_skipped += errors.len() as u64;
        for error in errors {
            self.push_sample(limit, || {
                format!(
                    "line {} [{}]: {}",
                    error.line,
                    error.key.as_deref().unwrap_or("?"),
                    error.error
                )
            });
        }
    }

    /// Count the staging and apply results of a committed batch.
    pub fn record_batch(&mut self, staging: &Staging, outcome: &ApplyOutcome, limit: usize) {
        self.batches += 1;
        self.unchanged += staging.unchanged;
        self.duplicates += staging.duplicates;
        self.folded += staging.folded;
        self.record_outcome(outcome, limit);
    }

    /// Count a store outcome.
    pub fn record_outcome(&mut self, outcome: &ApplyOutcome, limit: usize) {
        self.inserted += outcome.inserted;
        self.updated += outcome.updated;
        self.apply_skipped += outcome.skipped;
        for failure in &outcome.failures {
            self.push_sample(limit, || {
                format!("line {} [{}]: {}", failure.line, failure.key, failure.reason)
            });
        }
    }

    fn push_sample(&mut self, limit: usize, sample: impl FnOnce() -> String) {
        if self.samples.len() < limit {
            self.samples.push(sample());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Outcome of one consolidation run.
pub struct RunSummary {
    /// When the run started.
    pub started_at: DateTime<Local>,
    /// When the run finished.
    pub finished_at: DateTime<Local>,
    /// One report per processed file, in processing order.
    pub files: Vec<FileReport>,
    /// Row counts after index build; empty when the run was cancelled.
    pub tables: Vec<TableCount>,
    /// Files found in period folders that matched no kind.
    pub unrecognized: usize,
    /// Period folders that could not be listed.
    pub unreadable_folders: usize,
    /// Whether the run stopped early on request.
    pub cancelled: bool,
}

impl RunSummary {
    /// Rows skipped across every file.
    #[must_use]
    pub fn skipped_records(&self) -> u64 {
        self.files.iter().map(FileReport::skipped).sum()
    }

    /// Files that failed.
    pub fn failed_files(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|file| matches!(file.status, FileStatus::Failed(_)))
    }

    /// Rows read across every file.
    #[must_use]
    pub fn rows_read(&self) -> u64 {
        self.files.iter().map(|file| file.rows_read).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            formatter,
            "{:<48} {:>10} {:>10} {:>10} {:>10} {:>8}  status",
            "source", "read", "inserted", "updated", "unchanged", "skipped"
        )?;
        for file in &self.files {
            writeln!(
                formatter,
                "{:<48} {:>10} {:>10} {:>10} {:>10} {:>8}  {}",
                file.source,
                file.rows_read,
                file.inserted,
                file.updated,
                file.unchanged + file.duplicates,
                file.skipped(),
                file.status
            )?;
        }
        if !self.tables.is_empty() {
            writeln!(formatter)?;
            for table in &self.tables {
                writeln!(formatter, "{:<24} {:>12}", table.table, table.rows)?;
            }
        }
        let elapsed = self.finished_at - self.started_at;
        write!(
            formatter,
            "\n{} rows read, {} skipped, {} failed files, {} unrecognized files, \
             {} unreadable folders in {}s{}",
            self.rows_read(),
            self.skipped_records(),
            self.failed_files().count(),
            self.unrecognized,
            self.unreadable_folders,
            elapsed.num_seconds(),
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}
