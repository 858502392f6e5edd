//! Traits describing the store and geocoder backends, plus shared helper types.

use std::error::Error as StdError;

use async_trait::async_trait;
use reqwest::Error as ReqwestError;
use serde::{Deserialize, Serialize};

use crate::classify::WasteCategory;
use crate::engine::StagedBatch;
use crate::geocode::{Coordinates, GeocodeTarget, LocationOutcome};
use crate::model::{
    BaseId, Company, Establishment, EstablishmentKey, PartnerKey, Period, RecordKind,
    ReferenceEntry, ReferenceTable, StoredPartner,
};
use crate::reader::Checkpoint;
use crate::reference::ReferenceMap;

/// Boxed backend error carried by [`StoreError`].
pub type BackendError = Box<dyn StdError + Send + Sync>;

#[derive(thiserror::Error, Debug)]
/// Errors raised by a store backend.
pub enum StoreError {
    /// The store file could not be opened or created.
    #[error("Cannot open store: {0}")]
    Open(#[source] BackendError),
    /// The schema could not be created or migrated.
    #[error("Schema error: {0}")]
    Schema(#[source] BackendError),
    /// Another consolidation process holds the writer lock.
    #[error("Store is locked by `{holder}` since {since}")]
    Locked {
        /// Owner recorded by the running process.
        holder: String,
        /// When the lock was taken.
        since: String,
    },
    /// Any other storage fault.
    #[error("Storage fault: {0}")]
    Backend(#[source] BackendError),
}

impl StoreError {
    /// Whether the run cannot continue at all.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Open(_) | Self::Schema(_) | Self::Locked { .. })
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors that can occur while talking to a geocoding backend.
pub enum PortError {
    /// Network layer failed.
    #[error("Network error: {0}")]
    Network(#[from] ReqwestError),
    /// The backend answered with something we cannot read.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Where a source file stands after a committed batch.
pub struct SourceCheckpoint {
    /// Stable identifier of the source file (`<period>/<file name>`).
    pub source: String,
    /// Snapshot period of the file.
    pub period: Period,
    /// Record kind of the file.
    pub kind: RecordKind,
    /// Position of the next unread row.
    pub position: Checkpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Persisted progress of one source file.
pub struct SourceProgress {
    /// Position of the next unread row.
    pub position: Checkpoint,
    /// Whether the file was drained completely.
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A staged row the store refused, with enough context to retry it by hand.
pub struct RecordFailure {
    /// Line of the row in its source file.
    pub line: u64,
    /// Natural key of the row.
    pub key: String,
    /// Backend message.
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Result of applying one staged batch.
pub struct ApplyOutcome {
    /// New rows written.
    pub inserted: u64,
    /// Existing rows rewritten.
    pub updated: u64,
    /// Rows refused by a constraint, isolated from the rest of the batch.
    pub skipped: u64,
    /// Details of the refused rows.
    pub failures: Vec<RecordFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Row count of one table.
pub struct TableCount {
    /// Table name.
    pub table: String,
    /// Number of rows.
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Primary activity of one establishment, input of the classification pass.
pub struct ActivityRow {
    /// Establishment key.
    pub key: EstablishmentKey,
    /// Municipality code, when known.
    pub municipality: Option<String>,
    /// Primary CNAE code, when known.
    pub primary_activity: Option<String>,
}

/// Trait for the relational store that holds the consolidated registry.
///
/// Lookups return the current stored row for a key; `apply_batch` commits a
/// whole staged batch together with the file checkpoint, or nothing at all.
pub trait StorePort {
    /// Create or migrate the schema. Safe to call on every run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Schema`] when the schema cannot be created.
    fn ensure_schema(&mut self) -> Result<(), StoreError>;

    /// Take the single-writer lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] when another process holds it.
    fn acquire_lock(&mut self, owner: &str) -> Result<(), StoreError>;

    /// Release the lock taken by [`StorePort::acquire_lock`].
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the lock row cannot be removed.
    fn release_lock(&mut self) -> Result<(), StoreError>;

    /// Remove a stale lock left by a crashed process. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the lock row cannot be removed.
    fn break_lock(&mut self) -> Result<bool, StoreError>;

    /// Stored company row for a base identifier.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the lookup fails.
    fn company(&self, key: &BaseId) -> Result<Option<Company>, StoreError>;

    /// Stored establishment row for a composite key.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the lookup fails.
    fn establishment(&self, key: &EstablishmentKey) -> Result<Option<Establishment>, StoreError>;

    /// Stored partner rows sharing a weak key.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the lookup fails.
    fn partners(&self, key: &PartnerKey) -> Result<Vec<StoredPartner>, StoreError>;

    /// Apply a staged batch and advance the file checkpoint atomically.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the transaction had to be rolled back.
    fn apply_batch(
        &mut self,
        batch: &StagedBatch,
        checkpoint: &SourceCheckpoint,
    ) -> Result<ApplyOutcome, StoreError>;

    /// Insert or relabel reference entries and advance the file checkpoint.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the transaction had to be rolled back.
    fn upsert_references(
        &mut self,
        table: ReferenceTable,
        entries: &[ReferenceEntry],
        checkpoint: &SourceCheckpoint,
    ) -> Result<usize, StoreError>;

    /// Read-only code→label mapping of a reference table.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the table cannot be read.
    fn reference_map(&self, table: ReferenceTable) -> Result<ReferenceMap, StoreError>;

    /// Persisted progress of a source file.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the checkpoint cannot be read.
    fn checkpoint(&self, source: &str) -> Result<Option<SourceProgress>, StoreError>;

    /// Mark a source file as drained.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the checkpoint cannot be written.
    fn complete_source(&mut self, source: &str) -> Result<(), StoreError>;

    /// Build lookup indices once all periods are drained.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when an index cannot be created.
    fn build_indices(&mut self) -> Result<(), StoreError>;

    /// Row counts of every registry table.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when a table cannot be counted.
    fn row_counts(&self) -> Result<Vec<TableCount>, StoreError>;

    /// Page of establishments ordered by key, strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the query fails.
    fn activity_page(
        &self,
        municipality: Option<&str>,
        after: Option<&EstablishmentKey>,
        limit: usize,
    ) -> Result<Vec<ActivityRow>, StoreError>;

    /// Persist waste-generator categories, replacing earlier ones.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the transaction had to be rolled back.
    fn save_categories(
        &mut self,
        rows: &[(EstablishmentKey, WasteCategory)],
    ) -> Result<(), StoreError>;

    /// Establishments per persisted category, optionally for one municipality.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the query fails.
    fn category_counts(
        &self,
        municipality: Option<&str>,
    ) -> Result<Vec<(WasteCategory, u64)>, StoreError>;

    /// Establishments with street and number that have no stored location yet.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the query fails.
    fn pending_geocodes(
        &self,
        municipality: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GeocodeTarget>, StoreError>;

    /// Persist geocoding outcomes.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the transaction had to be rolled back.
    fn save_locations(
        &mut self,
        rows: &[(EstablishmentKey, LocationOutcome)],
    ) -> Result<(), StoreError>;
}

#[async_trait]
/// Trait for backends that turn a free-text address into coordinates.
pub trait GeocodePort: Send + Sync {
    /// Short name of the backend, for logs.
    fn name(&self) -> &str;

    /// Resolve an address. `Ok(None)` means the backend found nothing.
    ///
    /// # Errors
    ///
    /// Returns a [`PortError`] when the backend request fails.
    async fn locate(&self, query: &str) -> Result<Option<Coordinates>, PortError>;
}
