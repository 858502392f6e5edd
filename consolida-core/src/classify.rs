//! Waste-generator classification of establishments by primary activity.
//!
//! The category of an establishment follows from the division (first two
//! digits) of its primary CNAE code, looked up in a static range table.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ClassifyConfig;
use crate::model::{EstablishmentKey, ReferenceTable};
use crate::ports::{StoreError, StorePort};
use crate::service::CancelFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Source category of the solid waste an establishment generates.
pub enum WasteCategory {
    /// Agriculture, livestock, forestry, fishing.
    Agrosilvopastoral,
    /// Extractive industries.
    Mining,
    /// Manufacturing and utilities.
    Industrial,
    /// Water, sewage, and waste management services.
    Sanitation,
    /// Civil construction.
    Construction,
    /// Trade, lodging, and food service.
    Commercial,
    /// Transport terminals, storage, and postal services.
    Transport,
    /// Health care.
    Health,
    /// Every other service activity.
    Services,
    /// No usable activity code.
    Unclassified,
}

impl WasteCategory {
    /// All categories in report order.
    pub const ALL: [Self; 10] = [
        Self::Agrosilvopastoral,
        Self::Mining,
        Self::Industrial,
        Self::Sanitation,
        Self::Construction,
        Self::Commercial,
        Self::Transport,
        Self::Health,
        Self::Services,
        Self::Unclassified,
    ];

    /// Stable identifier persisted in the store.
    #[must_use]
    pub fn slug(self) -> &'static str {
        match self {
            Self::Agrosilvopastoral => "agrosilvopastoral",
            Self::Mining => "mining",
            Self::Industrial => "industrial",
            Self::Sanitation => "sanitation",
            Self::Construction => "construction",
            Self::Commercial => "commercial",
            Self::Transport => "transport",
            Self::Health => "health",
            Self::Services => "services",
            Self::Unclassified => "unclassified",
        }
    }

    /// Parse a persisted identifier.
    #[must_use]
    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.slug() == slug)
    }
}

impl fmt::Display for WasteCategory {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.slug())
    }
}

/// Maps an activity code to a waste category.
pub trait Classifier {
    /// Category of a primary activity code.
    fn classify(&self, activity: Option<&str>) -> WasteCategory;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Inclusive range of CNAE divisions mapped to one category.
pub struct DivisionRange {
    /// First division of the range.
    pub first: u8,
    /// Last division of the range.
    pub last: u8,
    /// Category of the range.
    pub category: WasteCategory,
}

const STANDARD_RANGES: &[(u8, u8, WasteCategory)] = &[
    (1, 3, WasteCategory::Agrosilvopastoral),
    (5, 9, WasteCategory::Mining),
    (10, 33, WasteCategory::Industrial),
    (35, 35, WasteCategory::Industrial),
    (36, 39, WasteCategory::Sanitation),
    (41, 43, WasteCategory::Construction),
    (45, 47, WasteCategory::Commercial),
    (49, 53, WasteCategory::Transport),
    (55, 56, WasteCategory::Commercial),
    (75, 75, WasteCategory::Health),
    (86, 86, WasteCategory::Health),
];

/// Range-table classifier over CNAE divisions. Divisions outside every range are services.
#[derive(Debug, Clone)]
pub struct DivisionRangeClassifier {
    ranges: Vec<DivisionRange>,
}

impl DivisionRangeClassifier {
    /// Classifier with the given ranges; the first matching range wins.
    #[must_use]
    pub fn new(ranges: Vec<DivisionRange>) -> Self {
        Self { ranges }
    }

    /// Standard table for municipal waste-generator surveys.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(
            STANDARD_RANGES
                .iter()
                .map(|&(first, last, category)| DivisionRange {
                    first,
                    last,
                    category,
                })
                .collect(),
        )
    }
}

/// Division of an activity code such as `4711-3/02` or `4711302`.
#[must_use]
pub fn division(activity: &str) -> Option<u8> {
    let digits: String = activity
        .chars()
        .filter(char::is_ascii_digit)
        .take(2)
        .collect();
    if digits.len() < 2 || !activity.trim_start().starts_with(|ch: char| ch.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl Classifier for DivisionRangeClassifier {
    fn classify(&self, activity: Option<&str>) -> WasteCategory {
        let Some(division) = activity.and_then(division) else {
            return WasteCategory::Unclassified;
        };
        self.ranges
            .iter()
            .find(|range| (range.first..=range.last).contains(&division))
            .map_or(WasteCategory::Services, |range| range.category)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Establishments per category after a classification pass.
pub struct ClassificationSummary {
    /// Municipality filter, if any.
    pub municipality: Option<String>,
    /// Label of the filtered municipality.
    pub municipality_label: Option<String>,
    /// Establishments classified.
    pub classified: u64,
    /// Counts per category, in [`WasteCategory::ALL`] order.
    pub counts: Vec<(WasteCategory, u64)>,
    /// Whether the pass stopped early on cancellation.
    pub cancelled: bool,
}

impl fmt::Display for ClassificationSummary {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.municipality, &self.municipality_label) {
            (Some(code), Some(label)) => writeln!(formatter, "Municipality {code} ({label})")?,
            (Some(code), None) => writeln!(formatter, "Municipality {code}")?,
            (None, _) => writeln!(formatter, "All municipalities")?,
        }
        for (category, count) in &self.counts {
            writeln!(formatter, "  {:<20} {count:>10}", category.slug())?;
        }
        write!(formatter, "  {:<20} {:>10}", "total", self.classified)
    }
}

/// Pages through consolidated establishments and persists their category.
pub struct ClassificationPass<'run, S: StorePort + ?Sized, C: Classifier> {
    store: &'run mut S,
    classifier: &'run C,
    config: &'run ClassifyConfig,
}

impl<'run, S: StorePort + ?Sized, C: Classifier> ClassificationPass<'run, S, C> {
    /// Pass over `store` using `classifier`.
    pub fn new(store: &'run mut S, classifier: &'run C, config: &'run ClassifyConfig) -> Self {
        Self {
            store,
            classifier,
            config,
        }
    }

    /// Classify every matching establishment, one committed page at a time.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when a page cannot be read or written.
    pub fn run(&mut self, cancel: &CancelFlag) -> Result<ClassificationSummary, StoreError> {
        let municipality = self.config.municipality.as_deref();
        let municipalities = self.store.reference_map(ReferenceTable::Municipality)?;
        let mut counts: BTreeMap<WasteCategory, u64> = BTreeMap::new();
        let mut after: Option<EstablishmentKey> = None;
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let page =
                self.store
                    .activity_page(municipality, after.as_ref(), self.config.page_size)?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.key.clone());
            let categories: Vec<(EstablishmentKey, WasteCategory)> = page
                .into_iter()
                .map(|row| {
                    let category = self.classifier.classify(row.primary_activity.as_deref());
                    (row.key, category)
                })
                .collect();
            for (_, category) in &categories {
                *counts.entry(*category).or_default() += 1;
            }
            self.store.save_categories(&categories)?;
            tracing::debug!(page = categories.len(), "classification page saved");
        }

        let summary = ClassificationSummary {
            municipality: municipality.map(str::to_owned),
            municipality_label: municipality
                .and_then(|code| municipalities.label(code))
                .map(str::to_owned),
            classified: counts.values().sum(),
            counts: WasteCategory::ALL
                .into_iter()
                .map(|category| (category, counts.get(&category).copied().unwrap_or(0)))
                .collect(),
            cancelled,
        };
        tracing::info!(
            classified = summary.classified,
            municipality = municipality.unwrap_or("all"),
            cancelled,
            "classification finished"
        );
        Ok(summary)
    }
}
