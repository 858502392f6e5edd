//! In-memory store backing the unit tests of the core crate.

use std::collections::{BTreeMap, HashMap};

use crate::classify::WasteCategory;
use crate::engine::StagedBatch;
use crate::geocode::{GeocodeTarget, LocationOutcome};
use crate::merge::{Decision, PartnerDecision};
use crate::model::{
    BaseId, Company, Establishment, EstablishmentKey, Partner, PartnerKey, ReferenceEntry,
    ReferenceTable, StoredPartner,
};
use crate::ports::{
    ActivityRow, ApplyOutcome, SourceCheckpoint, SourceProgress, StoreError, StorePort,
    TableCount,
};
use crate::reference::ReferenceMap;

#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    companies: BTreeMap<BaseId, Company>,
    establishments: BTreeMap<EstablishmentKey, Establishment>,
    partners: BTreeMap<i64, Partner>,
    references: HashMap<ReferenceTable, BTreeMap<String, String>>,
    checkpoints: HashMap<String, SourceProgress>,
    categories: BTreeMap<EstablishmentKey, WasteCategory>,
    locations: BTreeMap<EstablishmentKey, String>,
    lock: Option<String>,
    indices: bool,
}

fn key_of(base_id: &str) -> EstablishmentKey {
    EstablishmentKey::parse(base_id, "0001", "00").expect("fixture key")
}

impl MemoryStore {
    pub(crate) fn put_company(&mut self, company: Company) {
        self.companies.insert(company.base_id.clone(), company);
    }

    pub(crate) fn put_establishment(&mut self, establishment: Establishment) {
        self.establishments
            .insert(establishment.key.clone(), establishment);
    }

    pub(crate) fn put_partner(&mut self, partner: Partner) -> i64 {
        let row_id = self.partners.keys().next_back().map_or(1, |last| last + 1);
        self.partners.insert(row_id, partner);
        row_id
    }

    pub(crate) fn put_reference(&mut self, table: ReferenceTable, code: &str, label: &str) {
        self.references
            .entry(table)
            .or_default()
            .insert(code.to_owned(), label.to_owned());
    }

    pub(crate) fn put_activity(&mut self, base_id: &str, municipality: &str, activity: &str) {
        let mut row = Establishment::new(key_of(base_id));
        row.address.municipality = Some(municipality.to_owned());
        row.activity.primary = Some(activity.to_owned());
        self.put_establishment(row);
    }

    pub(crate) fn put_address(&mut self, base_id: &str, street: &str, number: Option<&str>) {
        let mut row = Establishment::new(key_of(base_id));
        row.address.street_type = Some("RUA".to_owned());
        row.address.street = Some(street.to_owned());
        row.address.number = number.map(str::to_owned);
        self.put_establishment(row);
    }

    pub(crate) fn categories(&self) -> Vec<WasteCategory> {
        self.categories.values().copied().collect()
    }

    pub(crate) fn locations(&self) -> Vec<String> {
        self.locations.values().cloned().collect()
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub(crate) fn indices_built(&self) -> bool {
        self.indices
    }

    fn in_municipality(row: &Establishment, municipality: Option<&str>) -> bool {
        municipality.is_none_or(|code| row.address.municipality.as_deref() == Some(code))
    }

    fn advance(&mut self, checkpoint: &SourceCheckpoint) {
        self.checkpoints.insert(
            checkpoint.source.clone(),
            SourceProgress {
                position: checkpoint.position,
                completed: false,
            },
        );
    }
}

fn count<R>(decision: &Decision<R>, outcome: &mut ApplyOutcome) {
    match decision {
        Decision::Insert(_) => outcome.inserted += 1,
        Decision::Replace(_) | Decision::Merge(_) => outcome.updated += 1,
        Decision::Discard(_) => {}
    }
}

impl StorePort for MemoryStore {
    fn ensure_schema(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn acquire_lock(&mut self, owner: &str) -> Result<(), StoreError> {
        if let Some(holder) = &self.lock {
            return Err(StoreError::Locked {
                holder: holder.clone(),
                since: "earlier".to_owned(),
            });
        }
        self.lock = Some(owner.to_owned());
        Ok(())
    }

    fn release_lock(&mut self) -> Result<(), StoreError> {
        self.lock = None;
        Ok(())
    }

    fn break_lock(&mut self) -> Result<bool, StoreError> {
        Ok(self.lock.take().is_some())
    }

    fn company(&self, key: &BaseId) -> Result<Option<Company>, StoreError> {
        Ok(self.companies.get(key).cloned())
    }

    fn establishment(&self, key: &EstablishmentKey) -> Result<Option<Establishment>, StoreError> {
        Ok(self.establishments.get(key).cloned())
    }

    fn partners(&self, key: &PartnerKey) -> Result<Vec<StoredPartner>, StoreError> {
        Ok(self
            .partners
            .iter()
            .filter(|(_, partner)| partner.key == *key)
            .map(|(row_id, partner)| StoredPartner {
                row_id: *row_id,
                partner: partner.clone(),
            })
            .collect())
    }

    fn apply_batch(
        &mut self,
        batch: &StagedBatch,
        checkpoint: &SourceCheckpoint,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut outcome = ApplyOutcome::default();
        match batch {
            StagedBatch::Companies(rows) => {
                for row in rows {
                    count(&row.decision, &mut outcome);
                    if let Some(company) = row.decision.row() {
                        self.put_company(company.clone());
                    }
                }
            }
            StagedBatch::Establishments(rows) => {
                for row in rows {
                    count(&row.decision, &mut outcome);
                    if let Some(establishment) = row.decision.row() {
                        self.put_establishment(establishment.clone());
                    }
                }
            }
            StagedBatch::Partners(rows) => {
                for row in rows {
                    match &row.decision {
                        PartnerDecision::Append(partner) => {
                            self.put_partner(partner.clone());
                            outcome.inserted += 1;
                        }
                        PartnerDecision::Enrich(stored) => {
                            self.partners.insert(stored.row_id, stored.partner.clone());
                            outcome.updated += 1;
                        }
                        PartnerDecision::Discard(_) => {}
                    }
                }
            }
        }
        self.advance(checkpoint);
        Ok(outcome)
    }

    fn upsert_references(
        &mut self,
        table: ReferenceTable,
        entries: &[ReferenceEntry],
        checkpoint: &SourceCheckpoint,
    ) -> Result<usize, StoreError> {
        for entry in entries {
            self.put_reference(table, &entry.code, &entry.label);
        }
        self.advance(checkpoint);
        Ok(entries.len())
    }

    fn reference_map(&self, table: ReferenceTable) -> Result<ReferenceMap, StoreError> {
        let entries = self.references.get(&table).into_iter().flatten().map(
            |(code, label)| ReferenceEntry {
                code: code.clone(),
                label: label.clone(),
            },
        );
        Ok(ReferenceMap::new(table, entries))
    }

    fn checkpoint(&self, source: &str) -> Result<Option<SourceProgress>, StoreError> {
        Ok(self.checkpoints.get(source).copied())
    }

    fn complete_source(&mut self, source: &str) -> Result<(), StoreError> {
        self.checkpoints
            .entry(source.to_owned())
            .or_insert(SourceProgress {
                position: Default::default(),
                completed: false,
            })
            .completed = true;
        Ok(())
    }

    fn build_indices(&mut self) -> Result<(), StoreError> {
        self.indices = true;
        Ok(())
    }

    fn row_counts(&self) -> Result<Vec<TableCount>, StoreError> {
        Ok(vec![
            TableCount {
                table: "company".to_owned(),
                rows: self.companies.len() as u64,
            },
            TableCount {
                table: "establishment".to_owned(),
                rows: self.establishments.len() as u64,
            },
            TableCount {
                table: "partner".to_owned(),
                rows: self.partners.len() as u64,
            },
        ])
    }

    fn activity_page(
        &self,
        municipality: Option<&str>,
        after: Option<&EstablishmentKey>,
        limit: usize,
    ) -> Result<Vec<ActivityRow>, StoreError> {
        Ok(self
            .establishments
            .values()
            .filter(|row| after.is_none_or(|after| row.key > *after))
            .filter(|row| Self::in_municipality(row, municipality))
            .take(limit)
            .map(|row| ActivityRow {
                key: row.key.clone(),
                municipality: row.address.municipality.clone(),
                primary_activity: row.activity.primary.clone(),
            })
            .collect())
    }

    fn save_categories(
        &mut self,
        rows: &[(EstablishmentKey, WasteCategory)],
    ) -> Result<(), StoreError> {
        self.categories.extend(rows.iter().cloned());
        Ok(())
    }

    fn category_counts(
        &self,
        municipality: Option<&str>,
    ) -> Result<Vec<(WasteCategory, u64)>, StoreError> {
        let mut counts: BTreeMap<WasteCategory, u64> = BTreeMap::new();
        for (key, category) in &self.categories {
            let matches = self
                .establishments
                .get(key)
                .is_some_and(|row| Self::in_municipality(row, municipality));
            if matches {
                *counts.entry(*category).or_default() += 1;
            }
        }
        Ok(counts.into_iter().collect())
    }

    fn pending_geocodes(
        &self,
        municipality: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GeocodeTarget>, StoreError> {
        Ok(self
            .establishments
            .values()
            .filter(|row| !self.locations.contains_key(&row.key))
            .filter(|row| Self::in_municipality(row, municipality))
            .filter(|row| row.address.number.is_some())
            .filter_map(|row| {
                Some(GeocodeTarget {
                    key: row.key.clone(),
                    street_type: row.address.street_type.clone(),
                    street: row.address.street.clone()?,
                    number: row.address.number.clone(),
                })
            })
            .take(limit)
            .collect())
    }

    fn save_locations(
        &mut self,
        rows: &[(EstablishmentKey, LocationOutcome)],
    ) -> Result<(), StoreError> {
        for (key, outcome) in rows {
            self.locations.insert(key.clone(), outcome.stored_value());
        }
        Ok(())
    }
}
