//! High-level consolidation service driving locator output through the engine.

use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;

use crate::config::ImportConfig;
use crate::engine::{Consolidate, Staging};
use crate::locator::{Inventory, SourceFile};
use crate::model::{Company, Establishment, Partner, RecordKind, ReferenceEntry, ReferenceTable};
use crate::ports::{ApplyOutcome, SourceCheckpoint, StoreError, StorePort, TableCount};
use crate::reader::{BatchReader, Checkpoint, ReadError};
use crate::reference::ReferenceLoader;
use crate::registry::{KindRegistry, Layout, RegistryError};
use crate::report::{FileReport, FileStatus, RunSummary};

/// Shared flag that asks long-running passes to stop at the next batch boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Fresh, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(thiserror::Error, Debug)]
enum FileError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("batch ending at line {line} failed after {attempts} attempts: {source}")]
    Apply {
        line: u64,
        attempts: u32,
        source: StoreError,
    },
}

/// Public entry point for consolidating located snapshots into a store.
pub struct ConsolidationService<S: StorePort> {
    store: S,
    registry: Arc<KindRegistry>,
    config: ImportConfig,
    owner: String,
}

impl<S: StorePort> ConsolidationService<S> {
    /// Create a service writing to `store`.
    #[must_use]
    pub fn new(store: S, registry: Arc<KindRegistry>, config: ImportConfig) -> Self {
        Self {
            store,
            registry,
            config,
            owner: format!("consolida pid {}", process::id()),
        }
    }

    /// Read access to the store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Give the store back.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Consolidate every file of `inventory`, in order.
    ///
    /// Row-level problems are counted and sampled in the per-file reports;
    /// a file that cannot be read or whose batch fails twice is reported as
    /// failed and the run continues with the next file. Indices are built and
    /// tables counted only when the run was not cancelled.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the schema cannot be created, the writer
    /// lock is held elsewhere, or the final index build fails.
    pub fn run(
        &mut self,
        inventory: &Inventory,
        cancel: &CancelFlag,
    ) -> Result<RunSummary, StoreError> {
        let started_at = Local::now();
        self.store.ensure_schema()?;
        self.store.acquire_lock(&self.owner)?;
        tracing::info!(
            owner = %self.owner,
            files = inventory.sources.len(),
            periods = inventory.periods().len(),
            "consolidation started"
        );

        let drained = self.drain(inventory, cancel);
        let released = self.store.release_lock();
        let (files, cancelled, tables) = drained?;
        released?;

        let summary = RunSummary {
            started_at,
            finished_at: Local::now(),
            files,
            tables,
            unrecognized: inventory.unrecognized.len(),
            unreadable_folders: inventory.unreadable.len(),
            cancelled,
        };
        tracing::info!(
            rows_read = summary.rows_read(),
            skipped = summary.skipped_records(),
            failed_files = summary.failed_files().count(),
            cancelled,
            "consolidation finished"
        );
        Ok(summary)
    }

    fn drain(
        &mut self,
        inventory: &Inventory,
        cancel: &CancelFlag,
    ) -> Result<(Vec<FileReport>, bool, Vec<TableCount>), StoreError> {
        let mut files = Vec::with_capacity(inventory.sources.len());
        let mut cancelled = false;
        for source in &inventory.sources {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let report = self.consolidate_file(source, cancel)?;
            cancelled = report.status == FileStatus::Cancelled;
            files.push(report);
            if cancelled {
                break;
            }
        }
        if cancelled {
            tracing::warn!("consolidation cancelled; rerun to resume from checkpoints");
            return Ok((files, true, Vec::new()));
        }
        self.store.build_indices()?;
        let tables = self.store.row_counts()?;
        Ok((files, false, tables))
    }

    /// Consolidate one file, turning recoverable failures into its report status.
    ///
    /// # Errors
    ///
    /// Only fatal store errors escape; everything else is reported.
    pub fn consolidate_file(
        &mut self,
        source: &SourceFile,
        cancel: &CancelFlag,
    ) -> Result<FileReport, StoreError> {
        let mut report = FileReport::new(source);
        let id = source.source_id();
        match self.process(source, cancel, &mut report) {
            Ok(status) => report.status = status,
            Err(FileError::Store(err) | FileError::Apply { source: err, .. })
                if err.is_fatal() =>
            {
                return Err(err);
            }
            Err(err) => {
                tracing::error!(source = %id, error = %err, "file failed, continuing");
                report.status = FileStatus::Failed(err.to_string());
            }
        }
        if report.skipped() > 0 {
            tracing::warn!(
                source = %id,
                decode_skipped = report.decode_skipped,
                apply_skipped = report.apply_skipped,
                "rows skipped"
            );
        }
        tracing::info!(
            source = %id,
            kind = %source.kind,
            rows_read = report.rows_read,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            status = %report.status,
            "file processed"
        );
        Ok(report)
    }

    fn process(
        &mut self,
        source: &SourceFile,
        cancel: &CancelFlag,
        report: &mut FileReport,
    ) -> Result<FileStatus, FileError> {
        let id = source.source_id();
        let progress = if self.config.reprocess {
            None
        } else {
            self.store.checkpoint(&id)?
        };
        if progress.is_some_and(|progress| progress.completed) {
            tracing::debug!(source = %id, "already consolidated, skipping");
            return Ok(FileStatus::AlreadyConsolidated);
        }
        let resume = progress
            .filter(|_| self.config.resume)
            .map(|progress| progress.position)
            .filter(|position| *position != Checkpoint::default());
        if let Some(position) = resume {
            tracing::info!(source = %id, line = position.line, "resuming from checkpoint");
        }

        let layout = self.registry.layout(source.kind)?.clone();
        let status = match source.kind {
            RecordKind::Reference(table) => {
                self.load_references(source, table, &layout, resume, cancel, report)?
            }
            RecordKind::Company => {
                self.consolidate::<Company>(source, &layout, resume, cancel, report)?
            }
            RecordKind::Establishment => {
                self.consolidate::<Establishment>(source, &layout, resume, cancel, report)?
            }
            RecordKind::Partner => {
                self.consolidate::<Partner>(source, &layout, resume, cancel, report)?
            }
        };
        if status == FileStatus::Completed {
            self.store.complete_source(&id)?;
        }
        Ok(status)
    }

    fn consolidate<R: Consolidate>(
        &mut self,
        source: &SourceFile,
        layout: &Layout,
        resume: Option<Checkpoint>,
        cancel: &CancelFlag,
        report: &mut FileReport,
    ) -> Result<FileStatus, FileError> {
        tracing::debug!(source = %source.source_id(), strategy = ?R::STRATEGY, "consolidating");
        let mut reader = BatchReader::<R>::open(source, layout, self.config.batch_size, resume)?;
        while let Some(batch) = reader.next_batch()? {
            report.rows_read += batch.len() as u64;
            report.record_row_errors(&batch.errors, self.config.error_samples);
            let checkpoint = checkpoint_for(source, batch.resume_from);
            let last_line = batch
                .records
                .last()
                .map_or(batch.resume_from.line, |row| row.line);

            let staging: Staging = R::stage(&self.store, batch.records)?;
            let outcome = self.apply_with_retry(last_line, |store| {
                store.apply_batch(&staging.batch, &checkpoint)
            })?;
            report.record_batch(&staging, &outcome, self.config.error_samples);
            tracing::debug!(
                source = %checkpoint.source,
                staged = staging.batch.len(),
                inserted = outcome.inserted,
                updated = outcome.updated,
                "batch committed"
            );
            if cancel.is_cancelled() {
                return Ok(FileStatus::Cancelled);
            }
        }
        Ok(FileStatus::Completed)
    }

    fn load_references(
        &mut self,
        source: &SourceFile,
        table: ReferenceTable,
        layout: &Layout,
        resume: Option<Checkpoint>,
        cancel: &CancelFlag,
        report: &mut FileReport,
    ) -> Result<FileStatus, FileError> {
        let mut reader =
            BatchReader::<ReferenceEntry>::open(source, layout, self.config.batch_size, resume)?;
        while let Some(batch) = reader.next_batch()? {
            report.rows_read += batch.len() as u64;
            report.record_row_errors(&batch.errors, self.config.error_samples);
            let checkpoint = checkpoint_for(source, batch.resume_from);
            let written = self.apply_with_retry(batch.resume_from.line, |store| {
                ReferenceLoader::new(store)
                    .load_batch(table, &batch, &checkpoint)
                    .map(|written| ApplyOutcome {
                        inserted: written as u64,
                        ..ApplyOutcome::default()
                    })
            })?;
            report.batches += 1;
            report.record_outcome(&written, self.config.error_samples);
            if cancel.is_cancelled() {
                return Ok(FileStatus::Cancelled);
            }
        }
        Ok(FileStatus::Completed)
    }

    fn apply_with_retry<F>(&mut self, line: u64, mut apply: F) -> Result<ApplyOutcome, FileError>
    where
        F: FnMut(&mut S) -> Result<ApplyOutcome, StoreError>,
    {
        let attempts = self.config.apply_retries + 1;
        let mut attempt = 1;
        loop {
            match apply(&mut self.store) {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_fatal() || attempt >= attempts => {
                    return Err(FileError::Apply {
                        line,
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    tracing::warn!(line, attempt, error = %err, "batch rolled back, retrying");
                    attempt += 1;
                }
            }
        }
    }
}

fn checkpoint_for(source: &SourceFile, position: Checkpoint) -> SourceCheckpoint {
    SourceCheckpoint {
        source: source.source_id(),
        period: source.period,
        kind: source.kind,
        position,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::locator::SnapshotLocator;
    use crate::model::BaseId;
    use crate::testing::MemoryStore;

    fn write(root: &Path, period: &str, name: &str, body: &str) {
        let folder = root.join(period);
        fs::create_dir_all(&folder).expect("create period folder");
        fs::write(folder.join(name), body).expect("write extract");
    }

    fn run(root: &Path, store: MemoryStore, config: ImportConfig) -> (RunSummary, MemoryStore) {
        let registry = Arc::new(KindRegistry::standard().expect("valid registry"));
        let inventory = SnapshotLocator::new(root, &registry)
            .locate()
            .expect("readable root");
        let mut service = ConsolidationService::new(store, registry, config);
        let summary = service
            .run(&inventory, &CancelFlag::new())
            .expect("memory store never fails");
        (summary, service.into_store())
    }

    #[test]
    fn later_period_merges_over_earlier_one() {
        let root = tempfile::tempdir().expect("temp dir");
        write(
            root.path(),
            "2023-05",
            "K3241.K03200Y0.D30513.EMPRECSV",
            "\"11222333\";\"ACME LTDA\";\"2062\";\"49\";\"1000,00\";\"03\";\"\"\n",
        );
        write(
            root.path(),
            "2023-07",
            "K3241.K03200Y0.D30708.EMPRECSV",
            "\"11222333\";\"ACME COMERCIO LTDA\";\"\";\"49\";\"0,00\";\"\";\"\"\n",
        );

        let (summary, store) = run(root.path(), MemoryStore::default(), ImportConfig::default());
        let company = store
            .company(&BaseId::parse("11222333").expect("valid id"))
            .expect("memory store never fails")
            .expect("company stored");
        assert_eq!(
            company.legal_name.as_deref(),
            Some("ACME COMERCIO LTDA"),
            "later name wins"
        );
        assert_eq!(company.legal_nature.as_deref(), Some("2062"), "gap kept");
        assert_eq!(
            company.share_capital.map(|capital| capital.cents()),
            Some(100_000),
            "zero capital ignored"
        );
        assert_eq!(summary.files.len(), 2, "both periods processed");
        assert!(!store.is_locked(), "lock released");
    }

    #[test]
    fn malformed_rows_are_skipped_and_drained_files_not_reread() {
        let root = tempfile::tempdir().expect("temp dir");
        write(
            root.path(),
            "2023-05",
            "K3241.K03200Y0.D30513.EMPRECSV",
            "\"1\";\"A\";\"\";\"\";\"\";\"\";\"\"\n\"X\";\"B\";\"\";\"\";\"\";\"\";\"\"\n\"3\";\"C\";\"\";\"\";\"\";\"\";\"\"\n",
        );

        let (first, store) = run(root.path(), MemoryStore::default(), ImportConfig::default());
        let report = first.files.first().expect("one file");
        assert_eq!(report.inserted, 2, "well-formed rows stored");
        assert_eq!(report.decode_skipped, 1, "bad id skipped");
        assert_eq!(first.skipped_records(), 1, "surfaced in the summary");

        let (second, _) = run(root.path(), store, ImportConfig::default());
        assert_eq!(
            second.files.first().map(|file| &file.status),
            Some(&FileStatus::AlreadyConsolidated),
            "completed files are skipped"
        );
    }

    #[test]
    fn cancelled_run_skips_index_build() {
        let root = tempfile::tempdir().expect("temp dir");
        write(
            root.path(),
            "2023-05",
            "K3241.K03200Y0.D30513.EMPRECSV",
            "\"1\";\"A\";\"\";\"\";\"\";\"\";\"\"\n",
        );
        let registry = Arc::new(KindRegistry::standard().expect("valid registry"));
        let inventory = SnapshotLocator::new(root.path(), &registry)
            .locate()
            .expect("readable root");
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut service =
            ConsolidationService::new(MemoryStore::default(), registry, ImportConfig::default());
        let summary = service.run(&inventory, &cancel).expect("run completes");
        assert!(summary.cancelled, "flag honoured");
        assert!(summary.files.is_empty(), "no file started");
        assert!(!service.store().indices_built(), "indices deferred");
    }
}
