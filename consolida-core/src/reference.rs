//! Code→label dimension data: the loader that writes it and the read-only map.

use std::collections::{BTreeMap, HashMap};

use crate::model::{ReferenceEntry, ReferenceTable};
use crate::ports::{SourceCheckpoint, StoreError, StorePort};
use crate::reader::Batch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Read-only code→label mapping of one reference table.
pub struct ReferenceMap {
    table: Option<ReferenceTable>,
    labels: HashMap<String, String>,
}

impl ReferenceMap {
    /// Build a map from stored entries.
    #[must_use]
    pub fn new(table: ReferenceTable, entries: impl IntoIterator<Item = ReferenceEntry>) -> Self {
        Self {
            table: Some(table),
            labels: entries
                .into_iter()
                .map(|entry| (entry.code, entry.label))
                .collect(),
        }
    }

    /// Table the map was loaded from.
    #[must_use]
    pub fn table(&self) -> Option<ReferenceTable> {
        self.table
    }

    /// Label of a code.
    #[must_use]
    pub fn label(&self, code: &str) -> Option<&str> {
        self.labels.get(code.trim()).map(String::as_str)
    }

    /// Label of a code, or the code itself when unknown.
    #[must_use]
    pub fn label_or_code<'map>(&'map self, code: &'map str) -> &'map str {
        self.label(code).unwrap_or(code)
    }

    /// Number of codes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Writes reference batches into the store, later periods relabeling codes.
pub struct ReferenceLoader<'store, S: StorePort + ?Sized> {
    store: &'store mut S,
}

impl<'store, S: StorePort + ?Sized> ReferenceLoader<'store, S> {
    /// Loader writing through `store`.
    pub fn new(store: &'store mut S) -> Self {
        Self { store }
    }

    /// Upsert one batch by code and advance the file checkpoint with it.
    ///
    /// A code repeated inside the batch keeps its last label.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the batch cannot be committed.
    pub fn load_batch(
        &mut self,
        table: ReferenceTable,
        batch: &Batch<ReferenceEntry>,
        checkpoint: &SourceCheckpoint,
    ) -> Result<usize, StoreError> {
        let entries = dedup_last(batch);
        let written = self.store.upsert_references(table, &entries, checkpoint)?;
        tracing::debug!(table = table.table_name(), written, "reference batch loaded");
        Ok(written)
    }

    /// Upsert every batch and return the number of codes written.
    ///
    /// Each batch is committed with the checkpoint `checkpoint` derives from it.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when a batch cannot be committed; earlier
    /// batches stay committed.
    pub fn load<I, C>(
        &mut self,
        table: ReferenceTable,
        batches: I,
        mut checkpoint: C,
    ) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = Batch<ReferenceEntry>>,
        C: FnMut(&Batch<ReferenceEntry>) -> SourceCheckpoint,
    {
        let mut loaded = 0;
        for batch in batches {
            loaded += self.load_batch(table, &batch, &checkpoint(&batch))?;
        }
        Ok(loaded)
    }
}

/// Keep the last label of every code, ordered by code.
#[must_use]
pub fn dedup_last(batch: &Batch<ReferenceEntry>) -> Vec<ReferenceEntry> {
    let latest: BTreeMap<&str, &str> = batch
        .records
        .iter()
        .map(|row| (row.record.code.as_str(), row.record.label.as_str()))
        .collect();
    latest
        .into_iter()
        .map(|(code, label)| ReferenceEntry {
            code: code.to_owned(),
            label: label.to_owned(),
        })
        .collect()
}
