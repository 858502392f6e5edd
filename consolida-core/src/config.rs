//! Tunables of the import, classification, and geocoding passes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reader::DEFAULT_BATCH_SIZE;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// A setting outside its valid range.
pub enum ConfigError {
    /// A count that must be positive is zero.
    #[error("`{0}` must be at least 1")]
    Zero(&'static str),
}

fn require_positive(value: usize, name: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero(name));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Settings of the consolidation pass.
pub struct ImportConfig {
    /// Rows per batch; bounds memory and the size of each transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Extra attempts for a batch whose transaction was rolled back.
    #[serde(default = "default_apply_retries")]
    pub apply_retries: u32,
    /// Resume partially consolidated files from their checkpoint.
    #[serde(default = "default_resume")]
    pub resume: bool,
    /// Re-read files already marked as drained.
    #[serde(default)]
    pub reprocess: bool,
    /// Row errors kept per file in the report.
    #[serde(default = "default_error_samples")]
    pub error_samples: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_apply_retries() -> u32 {
    1
}

fn default_resume() -> bool {
    true
}

fn default_error_samples() -> usize {
    20
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            apply_retries: default_apply_retries(),
            resume: default_resume(),
            reprocess: false,
            error_samples: default_error_samples(),
        }
    }
}

impl ImportConfig {
    /// Check ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] for a zero batch size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive(self.batch_size, "batch_size")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Settings of the waste-generator classification pass.
pub struct ClassifyConfig {
    /// Only classify establishments of this municipality code.
    #[serde(default)]
    pub municipality: Option<String>,
    /// Establishments read and written per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    10_000
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            municipality: None,
            page_size: default_page_size(),
        }
    }
}

impl ClassifyConfig {
    /// Check ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] for a zero page size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive(self.page_size, "page_size")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Settings of the geocoding pass.
pub struct GeocodeConfig {
    /// Suffix appended to every query, usually `"<city>, <state>"`.
    #[serde(default = "default_locality")]
    pub locality: String,
    /// Only geocode establishments of this municipality code.
    #[serde(default)]
    pub municipality: Option<String>,
    /// Minimum delay between two backend requests, in milliseconds.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Outcomes persisted per commit.
    #[serde(default = "default_commit_every")]
    pub commit_every: usize,
    /// Stop after this many establishments.
    #[serde(default)]
    pub limit: Option<usize>,
}

fn default_locality() -> String {
    "Garopaba, SC".to_owned()
}

fn default_min_delay_ms() -> u64 {
    1_100
}

fn default_commit_every() -> usize {
    10
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            locality: default_locality(),
            municipality: None,
            min_delay_ms: default_min_delay_ms(),
            commit_every: default_commit_every(),
            limit: None,
        }
    }
}

impl GeocodeConfig {
    /// Minimum delay between two requests.
    #[must_use]
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    /// Check ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] for a zero commit interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive(self.commit_every, "commit_every")
    }
}
