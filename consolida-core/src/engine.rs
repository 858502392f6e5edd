//! Consolidation engine: turns a decoded batch into staged write decisions.
//!
//! Staging only reads the store. The staged batch is then handed to
//! [`StorePort::apply_batch`], which writes every decision and the file
//! checkpoint in one transaction. Keys repeated inside a batch are merged
//! against the staged row, never staged twice.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::decode::FromRow;
use crate::merge::{
    Decision, MergeStrategy, PartnerDecision, Placement, Upsertable, decide_upsert,
    place_partner,
};
use crate::model::{Company, Establishment, Partner, PartnerKey, RecordKind, StoredPartner};
use crate::ports::{StoreError, StorePort};
use crate::reader::SourceRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A decision together with the source line it came from.
pub struct StagedRow<D> {
    /// Line of the last source row folded into the decision.
    pub line: u64,
    /// What to write.
    pub decision: D,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Write decisions of one batch, ready for the store. Discards are never staged.
pub enum StagedBatch {
    /// Company upserts.
    Companies(Vec<StagedRow<Decision<Company>>>),
    /// Establishment upserts.
    Establishments(Vec<StagedRow<Decision<Establishment>>>),
    /// Partner appends and enrichments.
    Partners(Vec<StagedRow<PartnerDecision>>),
}

impl StagedBatch {
    /// Record kind of the batch.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Companies(_) => RecordKind::Company,
            Self::Establishments(_) => RecordKind::Establishment,
            Self::Partners(_) => RecordKind::Partner,
        }
    }

    /// Number of staged writes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Companies(rows) => rows.len(),
            Self::Establishments(rows) => rows.len(),
            Self::Partners(rows) => rows.len(),
        }
    }

    /// Whether nothing needs writing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A staged batch plus the rows that produced no write.
pub struct Staging {
    /// Decisions to apply.
    pub batch: StagedBatch,
    /// Rows whose values the stored row already held.
    pub unchanged: u64,
    /// Partner rows already present.
    pub duplicates: u64,
    /// Repeats of a key already staged in the same batch that changed the staged row.
    pub folded: u64,
}

/// Transactional record kinds the engine knows how to stage.
pub trait Consolidate: FromRow {
    /// How rows of this kind meet stored rows.
    const STRATEGY: MergeStrategy;

    /// Decide what to write for every row of a batch.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when a lookup fails.
    fn stage<S: StorePort + ?Sized>(
        store: &S,
        rows: Vec<SourceRecord<Self>>,
    ) -> Result<Staging, StoreError>;
}

impl Consolidate for Company {
    const STRATEGY: MergeStrategy = MergeStrategy::UpsertByKey;

    fn stage<S: StorePort + ?Sized>(
        store: &S,
        rows: Vec<SourceRecord<Self>>,
    ) -> Result<Staging, StoreError> {
        let upserts = stage_upserts(rows, |key| store.company(key))?;
        Ok(upserts.into_staging(StagedBatch::Companies))
    }
}

impl Consolidate for Establishment {
    const STRATEGY: MergeStrategy = MergeStrategy::UpsertByKey;

    fn stage<S: StorePort + ?Sized>(
        store: &S,
        rows: Vec<SourceRecord<Self>>,
    ) -> Result<Staging, StoreError> {
        let upserts = stage_upserts(rows, |key| store.establishment(key))?;
        Ok(upserts.into_staging(StagedBatch::Establishments))
    }
}

impl Consolidate for Partner {
    const STRATEGY: MergeStrategy = MergeStrategy::AppendIfNotDuplicate;

    fn stage<S: StorePort + ?Sized>(
        store: &S,
        rows: Vec<SourceRecord<Self>>,
    ) -> Result<Staging, StoreError> {
        let mut stager = PartnerStager::default();
        for row in rows {
            stager.offer(store, row)?;
        }
        Ok(Staging {
            batch: StagedBatch::Partners(stager.staged),
            unchanged: 0,
            duplicates: stager.duplicates,
            folded: stager.folded,
        })
    }
}

struct Upserts<R> {
    staged: Vec<StagedRow<Decision<R>>>,
    unchanged: u64,
    folded: u64,
}

impl<R> Upserts<R> {
    fn into_staging(self, wrap: fn(Vec<StagedRow<Decision<R>>>) -> StagedBatch) -> Staging {
        Staging {
            batch: wrap(self.staged),
            unchanged: self.unchanged,
            duplicates: 0,
            folded: self.folded,
        }
    }
}

fn stage_upserts<R, F>(rows: Vec<SourceRecord<R>>, mut lookup: F) -> Result<Upserts<R>, StoreError>
where
    R: Upsertable,
    F: FnMut(&R::Key) -> Result<Option<R>, StoreError>,
{
    let mut upserts = Upserts {
        staged: Vec::with_capacity(rows.len()),
        unchanged: 0,
        folded: 0,
    };
    let mut slots: HashMap<R::Key, usize> = HashMap::with_capacity(rows.len());

    for SourceRecord { line, record } in rows {
        let staged_row = slots
            .get(record.key())
            .and_then(|slot| upserts.staged.get_mut(*slot));
        if let Some(staged_row) = staged_row {
            let Some(previous) = staged_row.decision.row() else {
                continue;
            };
            match decide_upsert(Some(previous), record) {
                Decision::Insert(row) | Decision::Replace(row) | Decision::Merge(row) => {
                    staged_row.decision = match staged_row.decision {
                        Decision::Insert(_) => Decision::Insert(row),
                        _ => Decision::Merge(row),
                    };
                    staged_row.line = line;
                    upserts.folded += 1;
                }
                Decision::Discard(_) => upserts.unchanged += 1,
            }
            continue;
        }

        let stored = lookup(record.key())?;
        let decision = decide_upsert(stored.as_ref(), record);
        match decision.row() {
            Some(row) => {
                slots.insert(row.key().clone(), upserts.staged.len());
                upserts.staged.push(StagedRow { line, decision });
            }
            None => upserts.unchanged += 1,
        }
    }
    Ok(upserts)
}

enum SlotTarget {
    Stored(i64),
    StoredStaged(i64, usize),
    Appended(usize),
}

struct Slot {
    partner: Partner,
    target: SlotTarget,
}

#[derive(Default)]
struct PartnerStager {
    candidates: HashMap<PartnerKey, Vec<Slot>>,
    staged: Vec<StagedRow<PartnerDecision>>,
    duplicates: u64,
    folded: u64,
}

impl PartnerStager {
    fn offer<S: StorePort + ?Sized>(
        &mut self,
        store: &S,
        row: SourceRecord<Partner>,
    ) -> Result<(), StoreError> {
        let SourceRecord { line, record } = row;
        let slots = match self.candidates.entry(record.key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let stored = store.partners(entry.key())?;
                entry.insert(
                    stored
                        .into_iter()
                        .map(|StoredPartner { row_id, partner }| Slot {
                            partner,
                            target: SlotTarget::Stored(row_id),
                        })
                        .collect(),
                )
            }
        };

        match place_partner(slots.iter().map(|slot| &slot.partner), &record) {
            Placement::Duplicate => self.duplicates += 1,
            Placement::New => {
                slots.push(Slot {
                    partner: record.clone(),
                    target: SlotTarget::Appended(self.staged.len()),
                });
                self.staged.push(StagedRow {
                    line,
                    decision: PartnerDecision::Append(record),
                });
            }
            Placement::Enrich { index, partner } => {
                let Some(slot) = slots.get_mut(index) else {
                    return Ok(());
                };
                slot.partner = partner.clone();
                match slot.target {
                    SlotTarget::Stored(row_id) => {
                        slot.target = SlotTarget::StoredStaged(row_id, self.staged.len());
                        self.staged.push(StagedRow {
                            line,
                            decision: PartnerDecision::Enrich(StoredPartner { row_id, partner }),
                        });
                    }
                    SlotTarget::StoredStaged(row_id, staged) => {
                        if let Some(staged_row) = self.staged.get_mut(staged) {
                            staged_row.line = line;
                            staged_row.decision =
                                PartnerDecision::Enrich(StoredPartner { row_id, partner });
                        }
                        self.folded += 1;
                    }
                    SlotTarget::Appended(staged) => {
                        if let Some(staged_row) = self.staged.get_mut(staged) {
                            staged_row.line = line;
                            staged_row.decision = PartnerDecision::Append(partner);
                        }
                        self.folded += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::model::{BaseId, EstablishmentKey, Period};
    use crate::testing::MemoryStore;

    fn stamp(period: &str) -> Option<NaiveDate> {
        period.parse::<Period>().ok().map(Period::first_day)
    }

    fn company(name: &str, period: &str) -> Company {
        let mut row = Company::new(BaseId::parse("11222333").expect("valid id"));
        row.legal_name = Some(name.to_owned());
        row.last_update = stamp(period);
        row
    }

    fn rows<R>(records: Vec<R>) -> Vec<SourceRecord<R>> {
        records
            .into_iter()
            .zip(1..)
            .map(|(record, line)| SourceRecord { line, record })
            .collect()
    }

    #[test]
    fn repeated_key_in_a_batch_stages_one_insert() {
        let store = MemoryStore::default();
        let mut early = company("ACME", "2023-05");
        early.size_class = None;
        let mut later = company("ACME", "2023-05");
        later.size_class = Some("03".to_owned());

        let staging = Company::stage(&store, rows(vec![early, later])).expect("lookups succeed");
        let StagedBatch::Companies(staged) = &staging.batch else {
            panic!("company batch expected");
        };
        assert_eq!(staged.len(), 1, "one row per key");
        let Some(StagedRow {
            line: 2,
            decision: Decision::Insert(row),
        }) = staged.first()
        else {
            panic!("repeat folds into the staged insert");
        };
        assert_eq!(row.size_class.as_deref(), Some("03"), "gap filled");
        assert_eq!(staging.folded, 1, "fold counted");
    }

    #[test]
    fn stored_row_with_same_values_is_not_staged() {
        let mut store = MemoryStore::default();
        store.put_company(company("ACME", "2023-05"));

        let staging = Company::stage(&store, rows(vec![company("ACME", "2023-05")]))
            .expect("lookups succeed");
        assert!(staging.batch.is_empty(), "nothing to write");
        assert_eq!(staging.unchanged, 1, "counted as unchanged");
    }

    #[test]
    fn establishment_gap_fill_is_staged_as_merge() {
        let mut store = MemoryStore::default();
        let key = EstablishmentKey::parse("11222333", "0001", "81").expect("valid key");
        let mut may = Establishment::new(key.clone());
        may.address.street = Some("RUA A".to_owned());
        may.last_update = stamp("2023-05");
        store.put_establishment(may);

        let mut july = Establishment::new(key);
        july.trade_name = Some("LOJA X".to_owned());
        july.last_update = stamp("2023-07");

        let staging = Establishment::stage(&store, rows(vec![july])).expect("lookups succeed");
        assert!(
            matches!(
                &staging.batch,
                StagedBatch::Establishments(staged)
                    if matches!(staged.as_slice(), [StagedRow { decision: Decision::Merge(_), .. }])
            ),
            "field-level merge staged"
        );
    }

    fn partner(qualification: Option<&str>) -> Partner {
        let mut row = Partner::new(PartnerKey {
            base_id: BaseId::parse("11222333").expect("valid id"),
            name: "JOAO DA SILVA".to_owned(),
            document: "***456789**".to_owned(),
        });
        row.qualification = qualification.map(str::to_owned);
        row.last_update = stamp("2023-05");
        row
    }

    #[test]
    fn partner_repeats_inside_a_batch_are_not_appended_twice() {
        let store = MemoryStore::default();
        let staging = Partner::stage(
            &store,
            rows(vec![partner(None), partner(Some("49")), partner(Some("49"))]),
        )
        .expect("lookups succeed");

        let StagedBatch::Partners(staged) = &staging.batch else {
            panic!("partner batch expected");
        };
        assert_eq!(staged.len(), 1, "single append");
        assert_eq!(
            staged.first().and_then(|row| row.decision.partner()),
            Some(&partner(Some("49"))),
            "append enriched in place"
        );
        assert_eq!(staging.folded, 1, "enrichment folded");
        assert_eq!(staging.duplicates, 1, "exact repeat discarded");
    }

    #[test]
    fn stored_partner_is_enriched_once_per_batch() {
        let mut store = MemoryStore::default();
        let row_id = store.put_partner(partner(None));

        let staging =
            Partner::stage(&store, rows(vec![partner(Some("49"))])).expect("lookups succeed");
        let StagedBatch::Partners(staged) = &staging.batch else {
            panic!("partner batch expected");
        };
        assert!(
            matches!(
                staged.as_slice(),
                [StagedRow { decision: PartnerDecision::Enrich(StoredPartner { row_id: target, .. }), .. }]
                    if *target == row_id
            ),
            "stored row enriched"
        );
    }
}
