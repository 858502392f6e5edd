//! SQLite implementation of the consolida store gateway.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::Local;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params};

use consolida_core::{
    ActivityRow, ApplyOutcome, BaseId, Checkpoint, Company, Decision, Establishment, EstablishmentKey,
    GeocodeTarget, LocationOutcome, PartnerDecision, PartnerKey, RecordFailure, ReferenceEntry,
    ReferenceMap, ReferenceTable, SourceCheckpoint, SourceProgress, StagedBatch, StoreError,
    StorePort, StoredPartner, TableCount, WasteCategory,
};

mod rows;
mod schema;

pub use schema::{NewerSchema, SCHEMA_VERSION};

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(err))
}

fn schema_error(err: rusqlite::Error) -> StoreError {
    StoreError::Schema(Box::new(err))
}

fn row_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// What a single staged row did to the store.
enum Written {
    Inserted,
    Updated,
    Nothing,
}

impl Written {
    fn count(self, outcome: &mut ApplyOutcome) {
        match self {
            Self::Inserted => outcome.inserted += 1,
            Self::Updated => outcome.updated += 1,
            Self::Nothing => {}
        }
    }
}

/// Store gateway over a single SQLite file.
pub struct SqliteStore {
    conn: Connection,
    lock_owner: Option<String>,
}

impl SqliteStore {
    /// Open or create the store file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] when the file cannot be opened or tuned.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|err| StoreError::Open(Box::new(err)))?;
        tracing::debug!(path = %path.display(), "store opened");
        Self::with_connection(conn)
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] when SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|err| StoreError::Open(Box::new(err)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let tuned = schema::apply_pragmas(&conn)
            .and_then(|()| conn.busy_timeout(Duration::from_secs(5)));
        tuned.map_err(|err| StoreError::Open(Box::new(err)))?;
        Ok(Self {
            conn,
            lock_owner: None,
        })
    }

    /// Underlying connection, for ad-hoc queries.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Owner recorded in the current lock row, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the lock table cannot be read.
    pub fn lock_holder(&self) -> Result<Option<(String, String)>, StoreError> {
        self.conn
            .query_row("SELECT owner, since FROM import_lock WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(backend)
    }
}

/// Write one row inside its own savepoint so a constraint violation only drops that row.
fn isolated<W>(
    tx: &mut Transaction<'_>,
    line: u64,
    key: impl FnOnce() -> String,
    outcome: &mut ApplyOutcome,
    write: W,
) -> Result<(), StoreError>
where
    W: FnOnce(&Connection) -> rusqlite::Result<Written>,
{
    let savepoint = tx.savepoint().map_err(backend)?;
    match write(&savepoint) {
        Ok(written) => {
            savepoint.commit().map_err(backend)?;
            written.count(outcome);
            Ok(())
        }
        Err(err) if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
            savepoint.finish().map_err(backend)?;
            let key = key();
            tracing::warn!(line, key = %key, error = %err, "row refused by the store, skipped");
            outcome.skipped += 1;
            outcome.failures.push(RecordFailure {
                line,
                key,
                reason: err.to_string(),
            });
            Ok(())
        }
        Err(err) => Err(backend(err)),
    }
}

fn write_upsert<R>(
    conn: &Connection,
    decision: &Decision<R>,
    insert: fn(&Connection, &R) -> rusqlite::Result<usize>,
    update: fn(&Connection, &R) -> rusqlite::Result<usize>,
) -> rusqlite::Result<Written> {
    match decision {
        Decision::Insert(row) => insert(conn, row).map(|_| Written::Inserted),
        Decision::Replace(row) | Decision::Merge(row) => update(conn, row).map(|_| Written::Updated),
        Decision::Discard(_) => Ok(Written::Nothing),
    }
}

fn row_key<R>(decision: &Decision<R>, key: impl FnOnce(&R) -> String) -> String {
    decision.row().map(key).unwrap_or_default()
}

fn write_checkpoint(conn: &Connection, checkpoint: &SourceCheckpoint) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "INSERT INTO import_checkpoint (source, period, kind, byte, line, record, completed, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
         ON CONFLICT(source) DO UPDATE SET
             period = excluded.period, kind = excluded.kind,
             byte = excluded.byte, line = excluded.line, record = excluded.record,
             completed = 0, updated_at = excluded.updated_at",
    )?
    .execute(params![
        checkpoint.source,
        checkpoint.period.to_string(),
        checkpoint.kind.to_string(),
        rows::to_sql_int(checkpoint.position.byte),
        rows::to_sql_int(checkpoint.position.line),
        rows::to_sql_int(checkpoint.position.record),
        Local::now().to_rfc3339(),
    ])?;
    Ok(())
}

impl StorePort for SqliteStore {
    fn ensure_schema(&mut self) -> Result<(), StoreError> {
        match schema::create(&mut self.conn).map_err(schema_error)? {
            schema::Created::Current => {
                tracing::debug!(version = SCHEMA_VERSION, "schema ready");
                Ok(())
            }
            schema::Created::Newer(err) => Err(StoreError::Schema(Box::new(err))),
        }
    }

    fn acquire_lock(&mut self, owner: &str) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend)?;
        let holder: Option<(String, String)> = tx
            .query_row("SELECT owner, since FROM import_lock WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(backend)?;
        if let Some((holder, since)) = holder {
            return Err(StoreError::Locked { holder, since });
        }
        tx.execute(
            "INSERT INTO import_lock (id, owner, since) VALUES (1, ?1, ?2)",
            params![owner, Local::now().to_rfc3339()],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        tracing::debug!(owner, "writer lock acquired");
        self.lock_owner = Some(owner.to_owned());
        Ok(())
    }

    fn release_lock(&mut self) -> Result<(), StoreError> {
        if let Some(owner) = self.lock_owner.take() {
            self.conn
                .execute(
                    "DELETE FROM import_lock WHERE id = 1 AND owner = ?1",
                    params![owner],
                )
                .map_err(backend)?;
            tracing::debug!(owner, "writer lock released");
        }
        Ok(())
    }

    fn break_lock(&mut self) -> Result<bool, StoreError> {
        let holder = self.lock_holder()?;
        let removed = self
            .conn
            .execute("DELETE FROM import_lock WHERE id = 1", [])
            .map_err(backend)?;
        if let Some((holder, since)) = holder {
            tracing::warn!(holder, since, "stale writer lock removed");
        }
        Ok(removed > 0)
    }

    fn company(&self, key: &BaseId) -> Result<Option<Company>, StoreError> {
        self.conn
            .prepare_cached(rows::SELECT_COMPANY)
            .map_err(backend)?
            .query_row(params![key.as_str()], |row| rows::company_from_row(key, row))
            .optional()
            .map_err(backend)
    }

    fn establishment(&self, key: &EstablishmentKey) -> Result<Option<Establishment>, StoreError> {
        self.conn
            .prepare_cached(rows::SELECT_ESTABLISHMENT)
            .map_err(backend)?
            .query_row(
                params![key.base_id.as_str(), key.order, key.check_digits],
                rows::establishment_from_row,
            )
            .optional()
            .map_err(backend)
    }

    fn partners(&self, key: &PartnerKey) -> Result<Vec<StoredPartner>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(rows::SELECT_PARTNERS)
            .map_err(backend)?;
        let partners = stmt
            .query_map(
                params![key.base_id.as_str(), key.name, key.document],
                |row| rows::partner_from_row(key, row),
            )
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;
        Ok(partners)
    }

    fn apply_batch(
        &mut self,
        batch: &StagedBatch,
        checkpoint: &SourceCheckpoint,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut tx = self.conn.transaction().map_err(backend)?;
        let mut outcome = ApplyOutcome::default();
        match batch {
            StagedBatch::Companies(staged) => {
                for row in staged.iter().filter(|row| row.decision.row().is_some()) {
                    isolated(
                        &mut tx,
                        row.line,
                        || row_key(&row.decision, |company| company.base_id.to_string()),
                        &mut outcome,
                        |conn| {
                            write_upsert(conn, &row.decision, rows::insert_company, rows::update_company)
                        },
                    )?;
                }
            }
            StagedBatch::Establishments(staged) => {
                for row in staged.iter().filter(|row| row.decision.row().is_some()) {
                    isolated(
                        &mut tx,
                        row.line,
                        || row_key(&row.decision, |establishment| establishment.key.to_string()),
                        &mut outcome,
                        |conn| {
                            write_upsert(
                                conn,
                                &row.decision,
                                rows::insert_establishment,
                                rows::update_establishment,
                            )
                        },
                    )?;
                }
            }
            StagedBatch::Partners(staged) => {
                for row in staged {
                    let Some(partner) = row.decision.partner() else {
                        continue;
                    };
                    isolated(
                        &mut tx,
                        row.line,
                        || partner.key.to_string(),
                        &mut outcome,
                        |conn| match &row.decision {
                            PartnerDecision::Append(appended) => {
                                rows::insert_partner(conn, appended).map(|_| Written::Inserted)
                            }
                            PartnerDecision::Enrich(stored) => {
                                rows::update_partner(conn, stored).map(|_| Written::Updated)
                            }
                            PartnerDecision::Discard(_) => Ok(Written::Nothing),
                        },
                    )?;
                }
            }
        }
        write_checkpoint(&tx, checkpoint).map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(outcome)
    }

    fn upsert_references(
        &mut self,
        table: ReferenceTable,
        entries: &[ReferenceEntry],
        checkpoint: &SourceCheckpoint,
    ) -> Result<usize, StoreError> {
        let tx = self.conn.transaction().map_err(backend)?;
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "INSERT INTO {} (code, label) VALUES (?1, ?2)
                     ON CONFLICT(code) DO UPDATE SET label = excluded.label",
                    table.table_name()
                ))
                .map_err(backend)?;
            for entry in entries {
                stmt.execute(params![entry.code, entry.label])
                    .map_err(backend)?;
            }
        }
        write_checkpoint(&tx, checkpoint).map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(entries.len())
    }

    fn reference_map(&self, table: ReferenceTable) -> Result<ReferenceMap, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT code, label FROM {}", table.table_name()))
            .map_err(backend)?;
        let entries = stmt
            .query_map([], |row| {
                Ok(ReferenceEntry {
                    code: row.get(0)?,
                    label: row.get(1)?,
                })
            })
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;
        Ok(ReferenceMap::new(table, entries))
    }

    fn checkpoint(&self, source: &str) -> Result<Option<SourceProgress>, StoreError> {
        self.conn
            .query_row(
                "SELECT byte, line, record, completed FROM import_checkpoint WHERE source = ?1",
                params![source],
                |row| {
                    Ok(SourceProgress {
                        position: Checkpoint {
                            byte: rows::from_sql_int(row.get(0)?),
                            line: rows::from_sql_int(row.get(1)?),
                            record: rows::from_sql_int(row.get(2)?),
                        },
                        completed: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(backend)
    }

    fn complete_source(&mut self, source: &str) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO import_checkpoint (source, completed, updated_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(source) DO UPDATE SET completed = 1, updated_at = excluded.updated_at",
                params![source, Local::now().to_rfc3339()],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn build_indices(&mut self) -> Result<(), StoreError> {
        tracing::info!("building lookup indices");
        self.conn.execute_batch(schema::INDEX_SQL).map_err(backend)
    }

    fn row_counts(&self) -> Result<Vec<TableCount>, StoreError> {
        let references = ReferenceTable::ALL.map(ReferenceTable::table_name);
        schema::COUNTED_TABLES
            .iter()
            .chain(references.iter())
            .map(|table| {
                let total: i64 = self
                    .conn
                    .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                    .map_err(backend)?;
                Ok(TableCount {
                    table: (*table).to_owned(),
                    rows: rows::from_sql_int(total),
                })
            })
            .collect()
    }

    fn activity_page(
        &self,
        municipality: Option<&str>,
        after: Option<&EstablishmentKey>,
        limit: usize,
    ) -> Result<Vec<ActivityRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT base_id, order_suffix, check_digits, municipality, primary_activity
                 FROM establishment
                 WHERE (?1 IS NULL OR municipality = ?1)
                   AND (?2 IS NULL OR (base_id, order_suffix, check_digits) > (?2, ?3, ?4))
                 ORDER BY base_id, order_suffix, check_digits
                 LIMIT ?5",
            )
            .map_err(backend)?;
        let page = stmt
            .query_map(
                params![
                    municipality,
                    after.map(|key| key.base_id.as_str()),
                    after.map(|key| key.order.as_str()),
                    after.map(|key| key.check_digits.as_str()),
                    row_limit(limit),
                ],
                |row| {
                    Ok(ActivityRow {
                        key: rows::establishment_key(row)?,
                        municipality: row.get("municipality")?,
                        primary_activity: row.get("primary_activity")?,
                    })
                },
            )
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;
        Ok(page)
    }

    fn save_categories(
        &mut self,
        categories: &[(EstablishmentKey, WasteCategory)],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction().map_err(backend)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO establishment_category (base_id, order_suffix, check_digits, category)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(base_id, order_suffix, check_digits)
                     DO UPDATE SET category = excluded.category",
                )
                .map_err(backend)?;
            for (key, category) in categories {
                stmt.execute(params![
                    key.base_id.as_str(),
                    key.order,
                    key.check_digits,
                    category.slug()
                ])
                .map_err(backend)?;
            }
        }
        tx.commit().map_err(backend)
    }

    fn category_counts(
        &self,
        municipality: Option<&str>,
    ) -> Result<Vec<(WasteCategory, u64)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT c.category, COUNT(*)
                 FROM establishment_category c
                 JOIN establishment e USING (base_id, order_suffix, check_digits)
                 WHERE (?1 IS NULL OR e.municipality = ?1)
                 GROUP BY c.category",
            )
            .map_err(backend)?;
        let grouped = stmt
            .query_map(params![municipality], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;
        let mut counts = BTreeMap::new();
        for (slug, total) in grouped {
            match WasteCategory::from_slug(&slug) {
                Some(category) => {
                    counts.insert(category, rows::from_sql_int(total));
                }
                None => tracing::warn!(slug, "unknown category in store, ignored"),
            }
        }
        Ok(counts.into_iter().collect())
    }

    fn pending_geocodes(
        &self,
        municipality: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GeocodeTarget>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT e.base_id AS base_id, e.order_suffix AS order_suffix,
                        e.check_digits AS check_digits, e.street_type AS street_type,
                        e.street AS street, e.number AS number
                 FROM establishment e
                 LEFT JOIN establishment_location l
                     ON l.base_id = e.base_id
                    AND l.order_suffix = e.order_suffix
                    AND l.check_digits = e.check_digits
                 WHERE l.location IS NULL
                   AND e.street IS NOT NULL AND e.street <> ''
                   AND e.number IS NOT NULL
                   AND (?1 IS NULL OR e.municipality = ?1)
                 ORDER BY e.base_id, e.order_suffix, e.check_digits
                 LIMIT ?2",
            )
            .map_err(backend)?;
        let targets = stmt
            .query_map(params![municipality, row_limit(limit)], |row| {
                Ok(GeocodeTarget {
                    key: rows::establishment_key(row)?,
                    street_type: row.get("street_type")?,
                    street: row.get("street")?,
                    number: row.get("number")?,
                })
            })
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;
        Ok(targets)
    }

    fn save_locations(
        &mut self,
        locations: &[(EstablishmentKey, LocationOutcome)],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction().map_err(backend)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO establishment_location (base_id, order_suffix, check_digits, location)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(base_id, order_suffix, check_digits)
                     DO UPDATE SET location = excluded.location",
                )
                .map_err(backend)?;
            for (key, outcome) in locations {
                stmt.execute(params![
                    key.base_id.as_str(),
                    key.order,
                    key.check_digits,
                    outcome.stored_value()
                ])
                .map_err(backend)?;
            }
        }
        tx.commit().map_err(backend)
    }
}
