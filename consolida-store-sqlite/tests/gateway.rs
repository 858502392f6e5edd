//! Store-level guarantees: locking, batch atomicity, partners and downstream tables.

use std::fs;
use std::sync::Arc;

use chrono::NaiveDate;
use consolida_core::{
    BaseId, CancelFlag, Checkpoint, ClassificationPass, ClassifyConfig, Company,
    ConsolidationService, Coordinates, Decision, DivisionRangeClassifier, EstablishmentKey,
    ImportConfig, KindRegistry, LocationOutcome, Partner, PartnerDecision, PartnerKey, RecordKind,
    SnapshotLocator, SourceCheckpoint, StagedBatch, StagedRow, StoreError, StorePort,
    WasteCategory,
};
use consolida_store_sqlite::SqliteStore;

fn memory_store() -> SqliteStore {
    let mut store = SqliteStore::open_in_memory().expect("memory store");
    store.ensure_schema().expect("schema");
    store
}

fn checkpoint(line: u64) -> SourceCheckpoint {
    SourceCheckpoint {
        source: "2023-05/K3241.K03200Y0.D30513.EMPRECSV".to_owned(),
        period: "2023-05".parse().expect("valid period"),
        kind: RecordKind::Company,
        position: Checkpoint {
            byte: line * 40,
            line,
            record: line - 1,
        },
    }
}

fn company(base_id: &str, name: &str) -> Company {
    let mut company = Company::new(BaseId::parse(base_id).expect("valid id"));
    company.legal_name = Some(name.to_owned());
    company.last_update = NaiveDate::from_ymd_opt(2023, 5, 1);
    company
}

fn inserts(companies: Vec<Company>) -> StagedBatch {
    StagedBatch::Companies(
        companies
            .into_iter()
            .zip(1..)
            .map(|(company, line)| StagedRow {
                line,
                decision: Decision::Insert(company),
            })
            .collect(),
    )
}

#[test]
fn schema_creation_is_idempotent() {
    let mut store = memory_store();
    store.ensure_schema().expect("second call succeeds");
    let version: i64 = store
        .connection()
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .expect("version recorded");
    assert_eq!(version, consolida_store_sqlite::SCHEMA_VERSION, "current version");
}

#[test]
fn newer_schema_is_refused() {
    let mut store = memory_store();
    store
        .connection()
        .execute("UPDATE schema_version SET version = version + 1", [])
        .expect("bump version");
    assert!(
        matches!(store.ensure_schema(), Err(StoreError::Schema(_))),
        "newer files are not touched"
    );
}

#[test]
fn on_disk_store_keeps_commits_durable_under_wal() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = SqliteStore::open(&dir.path().join("registry.sqlite")).expect("open");
    let connection = store.connection();
    let journal: String = connection
        .pragma_query_value(None, "journal_mode", |row| row.get(0))
        .expect("journal mode");
    let synchronous: i64 = connection
        .pragma_query_value(None, "synchronous", |row| row.get(0))
        .expect("synchronous");
    assert_eq!(journal, "wal", "write-ahead log");
    assert_eq!(synchronous, 1, "NORMAL, never OFF");
}

#[test]
fn second_writer_is_refused_until_the_lock_is_broken() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("registry.sqlite");
    let mut first = SqliteStore::open(&path).expect("open first");
    first.ensure_schema().expect("schema");
    first.acquire_lock("consolida pid 1").expect("free lock");

    let mut second = SqliteStore::open(&path).expect("open second");
    match second.acquire_lock("consolida pid 2") {
        Err(StoreError::Locked { holder, .. }) => {
            assert_eq!(holder, "consolida pid 1", "holder named");
        }
        other => panic!("expected a lock error, got {other:?}"),
    }

    assert!(second.break_lock().expect("break"), "stale lock removed");
    assert!(!second.break_lock().expect("break"), "nothing left to break");
    second.acquire_lock("consolida pid 2").expect("lock free again");
    second.release_lock().expect("release");
    assert_eq!(second.lock_holder().expect("read lock"), None, "released");
}

#[test]
fn locked_store_fails_the_run_fast() {
    let dir = tempfile::tempdir().expect("temp dir");
    fs::create_dir_all(dir.path().join("data").join("2023-05")).expect("period folder");
    let path = dir.path().join("registry.sqlite");
    let mut holder = SqliteStore::open(&path).expect("open holder");
    holder.ensure_schema().expect("schema");
    holder.acquire_lock("another run").expect("free lock");

    let registry = Arc::new(KindRegistry::standard().expect("valid registry"));
    let inventory = SnapshotLocator::new(dir.path().join("data"), &registry)
        .locate()
        .expect("readable root");
    let store = SqliteStore::open(&path).expect("open");
    let mut service = ConsolidationService::new(store, registry, ImportConfig::default());
    let result = service.run(&inventory, &CancelFlag::new());
    assert!(
        matches!(&result, Err(error) if error.is_fatal()),
        "locked store is fatal: {result:?}"
    );
}

#[test]
fn constraint_violation_skips_only_the_offending_row() {
    let mut store = memory_store();
    store
        .connection()
        .execute_batch(
            "CREATE TRIGGER refuse_company BEFORE INSERT ON company
             WHEN NEW.legal_name = 'RECUSADA'
             BEGIN SELECT RAISE(ABORT, 'refused by test trigger'); END;",
        )
        .expect("create trigger");

    let batch = inserts(vec![
        company("1", "ACEITA UM"),
        company("2", "RECUSADA"),
        company("3", "ACEITA DOIS"),
    ]);
    let outcome = store.apply_batch(&batch, &checkpoint(4)).expect("batch commits");
    assert_eq!(outcome.inserted, 2, "neighbours committed");
    assert_eq!(outcome.skipped, 1, "one row refused");
    let failure = outcome.failures.first().expect("failure recorded");
    assert_eq!((failure.line, failure.key.as_str()), (2, "00000002"), "line and key kept");
    assert!(
        store
            .company(&BaseId::parse("2").expect("valid id"))
            .expect("lookup")
            .is_none(),
        "refused row absent"
    );
    assert_eq!(
        store
            .checkpoint(&checkpoint(4).source)
            .expect("read checkpoint")
            .map(|progress| progress.position),
        Some(checkpoint(4).position),
        "checkpoint committed with the batch"
    );
}

#[test]
fn storage_fault_rolls_back_the_whole_batch() {
    let mut store = memory_store();
    store
        .connection()
        .execute_batch("DROP TABLE import_checkpoint;")
        .expect("break bookkeeping");

    let batch = inserts(vec![company("1", "UM"), company("2", "DOIS")]);
    let result = store.apply_batch(&batch, &checkpoint(3));
    assert!(
        matches!(result, Err(StoreError::Backend(_))),
        "missing table is not a row-level problem"
    );
    let companies: i64 = store
        .connection()
        .query_row("SELECT COUNT(*) FROM company", [], |row| row.get(0))
        .expect("count");
    assert_eq!(companies, 0, "nothing from the batch survived");
}

fn partner(document: &str, qualification: Option<&str>, age_band: Option<&str>) -> Partner {
    let mut partner = Partner::new(PartnerKey {
        base_id: BaseId::parse("12345678").expect("valid id"),
        name: "MARIA SILVA".to_owned(),
        document: document.to_owned(),
    });
    partner.qualification = qualification.map(str::to_owned);
    partner.age_band = age_band.map(str::to_owned);
    partner.last_update = NaiveDate::from_ymd_opt(2023, 5, 1);
    partner
}

#[test]
fn partners_are_appended_enriched_and_looked_up_by_weak_key() {
    let mut store = memory_store();
    let first = StagedBatch::Partners(vec![
        StagedRow {
            line: 1,
            decision: PartnerDecision::Append(partner("***123456**", Some("49"), None)),
        },
        StagedRow {
            line: 2,
            decision: PartnerDecision::Append(partner("***654321**", Some("22"), None)),
        },
    ]);
    let outcome = store.apply_batch(&first, &checkpoint(3)).expect("apply");
    assert_eq!(outcome.inserted, 2, "both appended");

    let key = partner("***123456**", None, None).key;
    let mut stored = store.partners(&key).expect("lookup");
    assert_eq!(stored.len(), 1, "weak key selects one row");
    let mut enriched = stored.remove(0);
    enriched.partner.age_band = Some("4".to_owned());

    let second = StagedBatch::Partners(vec![StagedRow {
        line: 1,
        decision: PartnerDecision::Enrich(enriched.clone()),
    }]);
    let outcome = store.apply_batch(&second, &checkpoint(2)).expect("apply");
    assert_eq!(outcome.updated, 1, "enriched in place");

    let stored = store.partners(&key).expect("lookup");
    assert_eq!(stored, vec![enriched], "same row id, gap filled");
}

#[test]
fn classification_is_persisted_and_counted_per_municipality() {
    let dir = tempfile::tempdir().expect("temp dir");
    let period = dir.path().join("data").join("2023-05");
    fs::create_dir_all(&period).expect("period folder");
    let row = |base_id: &str, cnae: &str, municipality: &str| {
        let mut fields = vec![String::new(); 30];
        for (index, value) in [(0, base_id), (1, "0001"), (2, "00"), (11, cnae), (20, municipality)] {
            if let Some(slot) = fields.get_mut(index) {
                value.clone_into(slot);
            }
        }
        format!("{}\n", fields.join(";"))
    };
    let body = [
        row("1", "4711302", "8345"),
        row("2", "8610101", "8345"),
        row("3", "1091101", "8105"),
    ]
    .concat();
    fs::write(period.join("K3241.K03200Y0.D30513.ESTABELE"), body).expect("write extract");

    let registry = Arc::new(KindRegistry::standard().expect("valid registry"));
    let inventory = SnapshotLocator::new(dir.path().join("data"), &registry)
        .locate()
        .expect("readable root");
    let store = SqliteStore::open(dir.path().join("registry.sqlite")).expect("open");
    let mut service = ConsolidationService::new(store, registry, ImportConfig::default());
    service
        .run(&inventory, &CancelFlag::new())
        .expect("import");
    let mut store = service.into_store();

    let config = ClassifyConfig {
        municipality: Some("8345".to_owned()),
        page_size: 1,
    };
    let classifier = DivisionRangeClassifier::standard();
    let summary = ClassificationPass::new(&mut store, &classifier, &config)
        .run(&CancelFlag::new())
        .expect("classify");
    assert_eq!(summary.classified, 2, "only the filtered municipality");

    let counts = store.category_counts(Some("8345")).expect("counts");
    assert_eq!(
        counts,
        vec![(WasteCategory::Commercial, 1), (WasteCategory::Health, 1)],
        "persisted per category"
    );
    assert!(
        store.category_counts(Some("8105")).expect("counts").is_empty(),
        "other municipality untouched"
    );
}

#[test]
fn geocoded_rows_leave_the_pending_list() {
    let mut store = memory_store();
    store
        .connection()
        .execute_batch(
            "INSERT INTO establishment (base_id, order_suffix, check_digits, street_type, street, number, municipality)
             VALUES ('00000001', '0001', '00', 'RUA', 'DAS FLORES', '10', '8345'),
                    ('00000002', '0001', '00', 'RUA', 'DO SOL', NULL, '8345'),
                    ('00000003', '0001', '00', 'AVENIDA', 'BRASIL', '200', '8345'),
                    ('00000004', '0001', '00', 'RUA', 'CENTRAL', '5', '8105');",
        )
        .expect("seed establishments");

    let pending = store.pending_geocodes(Some("8345"), 10).expect("pending");
    let keys: Vec<String> = pending.iter().map(|target| target.key.to_string()).collect();
    assert_eq!(
        keys,
        vec!["00000001000100", "00000003000100"],
        "rows with street and number, in key order"
    );

    let first = EstablishmentKey::parse("1", "1", "0").expect("valid key");
    let third = EstablishmentKey::parse("3", "1", "0").expect("valid key");
    store
        .save_locations(&[
            (
                first,
                LocationOutcome::Found(Coordinates {
                    latitude: -28.0253,
                    longitude: -48.6194,
                }),
            ),
            (third, LocationOutcome::NotFound),
        ])
        .expect("save");

    assert!(
        store.pending_geocodes(Some("8345"), 10).expect("pending").is_empty(),
        "markers count as processed"
    );
    let location: String = store
        .connection()
        .query_row(
            "SELECT location FROM establishment_location WHERE base_id = '00000001'",
            [],
            |row| row.get(0),
        )
        .expect("stored location");
    assert_eq!(location, "POINT(-48.6194 -28.0253)", "WKT longitude first");
}

#[test]
fn older_field_stamps_are_stored_with_the_row() {
    let mut store = memory_store();
    let mut merged = company("1", "UM");
    merged.last_update = NaiveDate::from_ymd_opt(2023, 7, 1);
    merged.size_class = Some("03".to_owned());
    merged
        .field_stamps
        .insert("legal_name", NaiveDate::from_ymd_opt(2023, 5, 1).expect("valid date"));
    store
        .apply_batch(&inserts(vec![merged.clone()]), &checkpoint(2))
        .expect("apply");

    let stored = store
        .company(&BaseId::parse("1").expect("valid id"))
        .expect("lookup")
        .expect("company stored");
    assert_eq!(stored, merged, "stamps read back with the row");
    let raw: Option<String> = store
        .connection()
        .query_row("SELECT field_stamps FROM company", [], |row| row.get(0))
        .expect("raw stamps");
    assert_eq!(raw.as_deref(), Some("legal_name=2023-05-01"), "persisted text");
}

#[test]
fn row_counts_cover_registry_and_reference_tables() {
    let mut store = memory_store();
    store
        .apply_batch(&inserts(vec![company("1", "UM")]), &checkpoint(2))
        .expect("apply");
    store.build_indices().expect("indices");
    let counts = store.row_counts().expect("counts");
    let company = counts
        .iter()
        .find(|count| count.table == "company")
        .map(|count| count.rows);
    assert_eq!(company, Some(1), "company counted");
    assert!(
        counts.iter().any(|count| count.table == "cnae"),
        "reference tables listed"
    );
}
