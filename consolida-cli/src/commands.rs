//! Subcommand runners.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use consolida_core::{
    CancelFlag, ClassificationPass, ConsolidationService, DivisionRangeClassifier, GeocodePass,
    KindRegistry, ReferenceTable, SnapshotLocator, StorePort,
};
use consolida_geocoder_nominatim::NominatimGeocoder;
use consolida_store_sqlite::SqliteStore;

use crate::cli::{ClassifyArgs, GeocodeArgs, ImportArgs, ReportArgs};

fn open_store(db: &Path) -> Result<SqliteStore> {
    let mut store = SqliteStore::open(db)
        .with_context(|| format!("cannot open store {}", db.display()))?;
    store
        .ensure_schema()
        .with_context(|| format!("cannot prepare schema of {}", db.display()))?;
    Ok(store)
}

/// Stop long passes at the next batch boundary on Ctrl-C.
fn cancel_on_interrupt() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current batch");
            flag.cancel();
        }
    });
    cancel
}

pub(crate) async fn import(db: &Path, args: ImportArgs) -> Result<()> {
    let config = args.config();
    config.validate().context("invalid import settings")?;
    let registry = Arc::new(KindRegistry::standard().context("invalid kind registry")?);
    let inventory = SnapshotLocator::new(&args.data_dir, &registry)
        .locate()
        .with_context(|| format!("cannot read data folder {}", args.data_dir.display()))?;
    if inventory.sources.is_empty() {
        tracing::warn!(root = %args.data_dir.display(), "no recognised extracts found");
    }

    let mut store = open_store(db)?;
    if args.break_lock && store.break_lock().context("cannot clear writer lock")? {
        tracing::warn!("previous writer lock cleared");
    }

    let unreadable = inventory.unreadable.clone();
    let cancel = cancel_on_interrupt();
    let summary = tokio::task::spawn_blocking(move || {
        let mut service = ConsolidationService::new(store, registry, config);
        service.run(&inventory, &cancel)
    })
    .await
    .context("import thread stopped unexpectedly")?
    .context("consolidation aborted")?;

    let mut out = io::stdout().lock();
    writeln!(out, "{summary}")?;
    for folder in &unreadable {
        writeln!(out, "unreadable: {}", folder.display())?;
    }
    for file in summary.failed_files() {
        writeln!(out, "failed: {} ({})", file.source, file.status)?;
    }
    for file in summary.files.iter().filter(|file| !file.samples.is_empty()) {
        writeln!(out, "skipped rows in {}:", file.source)?;
        for sample in &file.samples {
            writeln!(out, "  {sample}")?;
        }
    }
    Ok(())
}

pub(crate) fn classify(db: &Path, args: &ClassifyArgs) -> Result<()> {
    let config = args.config();
    config.validate().context("invalid classification settings")?;
    let mut store = open_store(db)?;
    let classifier = DivisionRangeClassifier::standard();
    let summary = ClassificationPass::new(&mut store, &classifier, &config)
        .run(&CancelFlag::new())
        .context("classification failed")?;
    writeln!(io::stdout().lock(), "{summary}")?;
    Ok(())
}

pub(crate) async fn geocode(db: &Path, args: GeocodeArgs) -> Result<()> {
    let config = args.config();
    config.validate().context("invalid geocoding settings")?;
    let mut store = open_store(db)?;
    let client = consolida_geocoder_nominatim::client().context("cannot build HTTP client")?;
    let geocoder = NominatimGeocoder::new(client)
        .with_base_url(args.nominatim_url)
        .with_country_codes(args.country_codes);

    let cancel = cancel_on_interrupt();
    let summary = GeocodePass::new(&mut store, &geocoder, &config)
        .run(&cancel)
        .await
        .context("geocoding failed")?;
    writeln!(io::stdout().lock(), "{summary}")?;
    Ok(())
}

pub(crate) fn report(db: &Path, args: &ReportArgs) -> Result<()> {
    let store = open_store(db)?;
    let counts = store.row_counts().context("cannot count rows")?;
    let categories = store
        .category_counts(args.municipality.as_deref())
        .context("cannot count categories")?;
    let municipalities = store
        .reference_map(ReferenceTable::Municipality)
        .context("cannot read municipalities")?;

    let mut out = io::stdout().lock();
    for count in &counts {
        writeln!(out, "{:<24} {:>12}", count.table, count.rows)?;
    }
    if !categories.is_empty() {
        writeln!(out)?;
        match args.municipality.as_deref() {
            Some(code) => writeln!(out, "categories in {}", municipalities.label_or_code(code))?,
            None => writeln!(out, "categories")?,
        }
        for (category, total) in &categories {
            writeln!(out, "  {:<20} {total:>10}", category.slug())?;
        }
    }
    Ok(())
}
