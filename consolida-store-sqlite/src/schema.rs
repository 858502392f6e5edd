//! DDL of the consolidated store.

use rusqlite::{Connection, OptionalExtension, params};

use consolida_core::ReferenceTable;

/// Version written to `schema_version` by this build.
pub const SCHEMA_VERSION: i64 = 1;

const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = 100000;
PRAGMA foreign_keys = OFF;
";

const REGISTRY_TABLES: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS company (
    base_id                   TEXT PRIMARY KEY,
    legal_name                TEXT,
    legal_nature              TEXT,
    responsible_qualification TEXT,
    share_capital_cents       INTEGER,
    size_class                TEXT,
    federative_entity         TEXT,
    last_update               TEXT,
    field_stamps              TEXT
);

CREATE TABLE IF NOT EXISTS establishment (
    base_id              TEXT NOT NULL,
    order_suffix         TEXT NOT NULL,
    check_digits         TEXT NOT NULL,
    branch_type          TEXT,
    trade_name           TEXT,
    status               TEXT,
    status_date          TEXT,
    status_reason        TEXT,
    special_status       TEXT,
    special_status_date  TEXT,
    started_on           TEXT,
    primary_activity     TEXT,
    secondary_activities TEXT,
    street_type          TEXT,
    street               TEXT,
    number               TEXT,
    complement           TEXT,
    district             TEXT,
    postal_code          TEXT,
    state                TEXT,
    municipality         TEXT,
    foreign_city         TEXT,
    country              TEXT,
    phone1_area          TEXT,
    phone1               TEXT,
    phone2_area          TEXT,
    phone2               TEXT,
    fax_area             TEXT,
    fax                  TEXT,
    email                TEXT,
    last_update          TEXT,
    field_stamps         TEXT,
    PRIMARY KEY (base_id, order_suffix, check_digits)
);

CREATE TABLE IF NOT EXISTS partner (
    partner_id                   INTEGER PRIMARY KEY,
    base_id                      TEXT NOT NULL,
    name                         TEXT NOT NULL,
    document                     TEXT NOT NULL,
    partner_type                 TEXT,
    qualification                TEXT,
    joined_on                    TEXT,
    country                      TEXT,
    representative_document      TEXT,
    representative_name          TEXT,
    representative_qualification TEXT,
    age_band                     TEXT,
    last_update                  TEXT
);

-- Partner lookups by weak key run on every staged row.
CREATE INDEX IF NOT EXISTS idx_partner_weak_key ON partner (base_id, name, document);

CREATE TABLE IF NOT EXISTS import_lock (
    id    INTEGER PRIMARY KEY CHECK (id = 1),
    owner TEXT NOT NULL,
    since TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS import_checkpoint (
    source     TEXT PRIMARY KEY,
    period     TEXT,
    kind       TEXT,
    byte       INTEGER NOT NULL DEFAULT 0,
    line       INTEGER NOT NULL DEFAULT 0,
    record     INTEGER NOT NULL DEFAULT 0,
    completed  INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS establishment_category (
    base_id      TEXT NOT NULL,
    order_suffix TEXT NOT NULL,
    check_digits TEXT NOT NULL,
    category     TEXT NOT NULL,
    PRIMARY KEY (base_id, order_suffix, check_digits)
);

CREATE TABLE IF NOT EXISTS establishment_location (
    base_id      TEXT NOT NULL,
    order_suffix TEXT NOT NULL,
    check_digits TEXT NOT NULL,
    location     TEXT NOT NULL,
    PRIMARY KEY (base_id, order_suffix, check_digits)
);
";

/// Lookup indices built once every period has drained.
pub(crate) const INDEX_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_establishment_base_id ON establishment (base_id);
CREATE INDEX IF NOT EXISTS idx_establishment_activity ON establishment (primary_activity);
CREATE INDEX IF NOT EXISTS idx_establishment_state ON establishment (state);
CREATE INDEX IF NOT EXISTS idx_establishment_municipality ON establishment (municipality);
CREATE INDEX IF NOT EXISTS idx_partner_base_id ON partner (base_id);
CREATE INDEX IF NOT EXISTS idx_category_category ON establishment_category (category);
";

/// Tables reported by `row_counts`, in report order.
pub(crate) const COUNTED_TABLES: [&str; 5] = [
    "company",
    "establishment",
    "partner",
    "establishment_category",
    "establishment_location",
];

#[derive(thiserror::Error, Debug)]
#[error("store schema version {found} is newer than supported version {SCHEMA_VERSION}")]
/// The file was written by a newer build.
pub struct NewerSchema {
    /// Version found in the file.
    pub found: i64,
}

/// Connection tuning applied on open.
pub(crate) fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(PRAGMAS)
}

fn reference_ddl(table: ReferenceTable) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (code TEXT PRIMARY KEY, label TEXT NOT NULL);",
        table.table_name()
    )
}

/// Outcome of [`create`].
pub(crate) enum Created {
    /// Tables are present at the current version.
    Current,
    /// The file belongs to a newer build.
    Newer(NewerSchema),
}

/// Create every table and record the schema version.
pub(crate) fn create(conn: &mut Connection) -> rusqlite::Result<Created> {
    let tx = conn.transaction()?;
    tx.execute_batch(REGISTRY_TABLES)?;
    for table in ReferenceTable::ALL {
        tx.execute_batch(&reference_ddl(table))?;
    }
    let found: Option<i64> = tx
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    match found {
        Some(found) if found > SCHEMA_VERSION => return Ok(Created::Newer(NewerSchema { found })),
        Some(found) if found == SCHEMA_VERSION => {}
        _ => {
            tx.execute("DELETE FROM schema_version", [])?;
            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
    }
    tx.commit()?;
    Ok(Created::Current)
}
