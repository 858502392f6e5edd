//! Geocoding of consolidated establishment addresses.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::GeocodeConfig;
use crate::model::EstablishmentKey;
use crate::ports::{GeocodePort, StoreError, StorePort};
use crate::service::CancelFlag;

/// Marker persisted when the backend found nothing.
pub const NOT_FOUND: &str = "NOT FOUND";

/// Prefix of the marker persisted when the request failed.
pub const FAILED_PREFIX: &str = "ERROR: ";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// WGS84 point.
pub struct Coordinates {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl Coordinates {
    /// Well-known-text form, longitude first.
    #[must_use]
    pub fn to_wkt(self) -> String {
        format!("POINT({} {})", self.longitude, self.latitude)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Establishment address awaiting coordinates.
pub struct GeocodeTarget {
    /// Establishment key.
    pub key: EstablishmentKey,
    /// Street type (RUA, AVENIDA, ...).
    pub street_type: Option<String>,
    /// Street name.
    pub street: String,
    /// House number as published.
    pub number: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
/// Result of geocoding one establishment.
pub enum LocationOutcome {
    /// Coordinates found.
    Found(Coordinates),
    /// The backend has no match for the address.
    NotFound,
    /// The request failed; the message is persisted for later inspection.
    Failed(String),
}

impl LocationOutcome {
    /// Value persisted in the location column.
    #[must_use]
    pub fn stored_value(&self) -> String {
        match self {
            Self::Found(coordinates) => coordinates.to_wkt(),
            Self::NotFound => NOT_FOUND.to_owned(),
            Self::Failed(message) => format!("{FAILED_PREFIX}{message}"),
        }
    }
}

/// Free-text query for a target: `"<street>, <number>, <locality>"`.
///
/// Numbers that are not purely numeric (`S/N`, `KM 12`) are dropped.
#[must_use]
pub fn build_query(target: &GeocodeTarget, locality: &str) -> String {
    let mut parts = Vec::with_capacity(3);
    let street = match target.street_type.as_deref().map(str::trim) {
        Some(kind) if !kind.is_empty() => format!("{kind} {}", target.street.trim()),
        _ => target.street.trim().to_owned(),
    };
    if !street.is_empty() {
        parts.push(street);
    }
    if let Some(number) = target.number.as_deref().map(str::trim)
        && !number.is_empty()
        && number.bytes().all(|byte| byte.is_ascii_digit())
    {
        parts.push(number.to_owned());
    }
    parts.push(locality.to_owned());
    parts.join(", ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Totals of a geocoding pass.
pub struct GeocodeSummary {
    /// Establishments sent to the backend.
    pub attempted: u64,
    /// Coordinates found.
    pub found: u64,
    /// Backend had no match.
    pub not_found: u64,
    /// Requests that failed.
    pub failed: u64,
    /// Whether the pass stopped early on cancellation.
    pub cancelled: bool,
}

impl fmt::Display for GeocodeSummary {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "attempted {}, found {}, not found {}, failed {}{}",
            self.attempted,
            self.found,
            self.not_found,
            self.failed,
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}

/// Resolves pending establishment addresses through a [`GeocodePort`].
pub struct GeocodePass<'run, S: StorePort + ?Sized> {
    store: &'run mut S,
    geocoder: &'run dyn GeocodePort,
    config: &'run GeocodeConfig,
}

impl<'run, S: StorePort + ?Sized> GeocodePass<'run, S> {
    /// Pass writing through `store` and resolving with `geocoder`.
    pub fn new(
        store: &'run mut S,
        geocoder: &'run dyn GeocodePort,
        config: &'run GeocodeConfig,
    ) -> Self {
        Self {
            store,
            geocoder,
            config,
        }
    }

    /// Geocode pending establishments, committing every `commit_every` outcomes.
    ///
    /// Requests are spaced by the configured minimum delay. A failed request
    /// is persisted as an error marker and never retried by a later run.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when outcomes cannot be read or saved.
    pub async fn run(&mut self, cancel: &CancelFlag) -> Result<GeocodeSummary, StoreError> {
        let mut summary = GeocodeSummary::default();
        let page_size = self.config.commit_every.max(1);
        let delay = self.config.min_delay();
        let mut remaining = self.config.limit;

        loop {
            let wanted = remaining.map_or(page_size, |left| left.min(page_size));
            if wanted == 0 {
                break;
            }
            let targets = self
                .store
                .pending_geocodes(self.config.municipality.as_deref(), wanted)?;
            if targets.is_empty() {
                break;
            }

            let mut outcomes = Vec::with_capacity(targets.len());
            for target in targets {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    break;
                }
                if summary.attempted > 0 && !delay.is_zero() {
                    pause(delay).await;
                }
                let query = build_query(&target, &self.config.locality);
                let outcome = match self.geocoder.locate(&query).await {
                    Ok(Some(coordinates)) => {
                        summary.found += 1;
                        LocationOutcome::Found(coordinates)
                    }
                    Ok(None) => {
                        summary.not_found += 1;
                        LocationOutcome::NotFound
                    }
                    Err(err) => {
                        tracing::warn!(
                            backend = self.geocoder.name(),
                            key = %target.key,
                            query = %query,
                            error = %err,
                            "geocoding request failed"
                        );
                        summary.failed += 1;
                        LocationOutcome::Failed(err.to_string())
                    }
                };
                summary.attempted += 1;
                outcomes.push((target.key, outcome));
            }

            self.store.save_locations(&outcomes)?;
            tracing::info!(
                attempted = summary.attempted,
                found = summary.found,
                "geocoding progress committed"
            );
            if let Some(left) = remaining.as_mut() {
                *left = left.saturating_sub(outcomes.len());
            }
            if summary.cancelled {
                break;
            }
        }
        Ok(summary)
    }
}

async fn pause(delay: Duration) {
    tokio::time::sleep(delay).await;
}
