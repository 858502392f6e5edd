//! Command-line arguments and their mapping onto the core configuration.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use consolida_core::{ClassifyConfig, GeocodeConfig, ImportConfig};

/// Consolidate monthly CNPJ registry snapshots into a single SQLite store.
#[derive(Debug, Parser)]
#[command(name = "consolida", version, about)]
pub(crate) struct Cli {
    /// SQLite store to create or update.
    #[arg(long, env = "CONSOLIDA_DB", default_value = "cnpj.sqlite", global = true)]
    pub(crate) db: PathBuf,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Merge every period folder into the store, oldest first.
    Import(ImportArgs),
    /// Assign a waste-generator category to each establishment.
    Classify(ClassifyArgs),
    /// Resolve establishment addresses to coordinates.
    Geocode(GeocodeArgs),
    /// Print table sizes and category counts of the store.
    Report(ReportArgs),
}

#[derive(Debug, Args)]
pub(crate) struct ImportArgs {
    /// Root folder holding one `YYYY-MM` folder per snapshot.
    #[arg(long, env = "CONSOLIDA_DATA_DIR", default_value = "dados")]
    pub(crate) data_dir: PathBuf,

    /// Rows per committed batch.
    #[arg(long, env = "CONSOLIDA_BATCH_SIZE", default_value_t = ImportConfig::default().batch_size)]
    pub(crate) batch_size: usize,

    /// Extra attempts for a batch whose transaction was rolled back.
    #[arg(long, env = "CONSOLIDA_APPLY_RETRIES", default_value_t = 1)]
    pub(crate) apply_retries: u32,

    /// Ignore checkpoints of partially consolidated files and read them from the start.
    #[arg(long)]
    pub(crate) no_resume: bool,

    /// Read files already marked as consolidated again.
    #[arg(long)]
    pub(crate) reprocess: bool,

    /// Remove a writer lock left behind by a crashed run before starting.
    #[arg(long)]
    pub(crate) break_lock: bool,

    /// Skipped rows kept per file in the summary.
    #[arg(long, default_value_t = 20)]
    pub(crate) error_samples: usize,
}

impl ImportArgs {
    pub(crate) fn config(&self) -> ImportConfig {
        ImportConfig {
            batch_size: self.batch_size,
            apply_retries: self.apply_retries,
            resume: !self.no_resume,
            reprocess: self.reprocess,
            error_samples: self.error_samples,
        }
    }
}

#[derive(Debug, Args)]
pub(crate) struct ClassifyArgs {
    /// Only classify establishments of this municipality code.
    #[arg(long, env = "CONSOLIDA_MUNICIPALITY")]
    pub(crate) municipality: Option<String>,

    /// Establishments read and written per page.
    #[arg(long, default_value_t = 10_000)]
    pub(crate) page_size: usize,
}

impl ClassifyArgs {
    pub(crate) fn config(&self) -> ClassifyConfig {
        ClassifyConfig {
            municipality: self.municipality.clone(),
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Args)]
pub(crate) struct GeocodeArgs {
    /// Appended to every query, usually `"<city>, <state>"`.
    #[arg(long, env = "CONSOLIDA_LOCALITY", default_value = "Garopaba, SC")]
    pub(crate) locality: String,

    /// Only geocode establishments of this municipality code.
    #[arg(long, env = "CONSOLIDA_MUNICIPALITY")]
    pub(crate) municipality: Option<String>,

    /// Minimum delay between two requests, in milliseconds.
    #[arg(long, env = "CONSOLIDA_GEOCODE_DELAY_MS", default_value_t = 1_100)]
    pub(crate) min_delay_ms: u64,

    /// Outcomes persisted per commit.
    #[arg(long, default_value_t = 10)]
    pub(crate) commit_every: usize,

    /// Stop after this many establishments.
    #[arg(long)]
    pub(crate) limit: Option<usize>,

    /// Nominatim instance to query.
    #[arg(long, env = "CONSOLIDA_NOMINATIM_URL", default_value = consolida_geocoder_nominatim::DEFAULT_BASE_URL)]
    pub(crate) nominatim_url: String,

    /// Restrict hits to these ISO country codes.
    #[arg(long, default_value = "br")]
    pub(crate) country_codes: String,
}

impl GeocodeArgs {
    pub(crate) fn config(&self) -> GeocodeConfig {
        GeocodeConfig {
            locality: self.locality.clone(),
            municipality: self.municipality.clone(),
            min_delay_ms: self.min_delay_ms,
            commit_every: self.commit_every,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Args)]
pub(crate) struct ReportArgs {
    /// Only count categories of this municipality code.
    #[arg(long, env = "CONSOLIDA_MUNICIPALITY")]
    pub(crate) municipality: Option<String>,
}
