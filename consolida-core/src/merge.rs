//! Record-level merge policy applied when a snapshot row meets the stored row.
//!
//! Company and establishment rows are upserted by key with a field-level,
//! non-destructive merge: an empty incoming value never overwrites a populated
//! one, and when both sides are populated the value from the strictly later
//! snapshot wins. Every field is dated on its own ([`FieldStamps`]), so a gap
//! filled from an old snapshot still yields to a newer one arriving later, and
//! the result does not depend on the order periods are applied in. Equal
//! periods keep the stored value, so re-applying a snapshot is a no-op.
//!
//! Partner rows have no durable key and are appended unless an existing row
//! with the same weak key already carries the same information. This is weaker
//! than the upsert: a partner whose document changes between periods ends up
//! with one row per variant, and reordering periods can change which rows
//! exist.

use std::fmt;
use std::hash::Hash;
use std::mem;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{
    Activity, Address, BaseId, Company, Contact, Establishment, EstablishmentKey, FieldStamps,
    Partner, RecordKind, Registration, ShareCapital, StoredPartner,
};

/// Whether a value carries information.
pub trait Presence {
    /// `false` for values that must never overwrite a populated field.
    fn is_present(&self) -> bool;
}

impl Presence for String {
    fn is_present(&self) -> bool {
        !self.trim().is_empty()
    }
}

impl Presence for NaiveDate {
    fn is_present(&self) -> bool {
        true
    }
}

impl Presence for ShareCapital {
    fn is_present(&self) -> bool {
        self.cents() != 0
    }
}

/// Accumulates field-level merge results for one row.
#[derive(Debug)]
pub struct Merger {
    incoming: Option<NaiveDate>,
    fallback: Option<NaiveDate>,
    previous: FieldStamps,
    stamps: FieldStamps,
    changed: bool,
}

impl Merger {
    /// Merge a snapshot dated `incoming` into a row dated `stored`, whose
    /// older fields are listed in `previous`.
    #[must_use]
    pub fn dated(
        stored: Option<NaiveDate>,
        previous: FieldStamps,
        incoming: Option<NaiveDate>,
    ) -> Self {
        Self {
            incoming,
            fallback: stored,
            previous,
            stamps: FieldStamps::default(),
            changed: false,
        }
    }

    /// Only fill gaps; populated values are never replaced.
    #[must_use]
    pub fn gap_fill() -> Self {
        Self::dated(None, FieldStamps::default(), None)
    }

    /// Fold one incoming value into the stored slot named `name`.
    ///
    /// A missing stamp is older than any stamp.
    pub fn field<T: Presence + Clone + PartialEq>(
        &mut self,
        name: &str,
        stored: &mut Option<T>,
        incoming: &Option<T>,
    ) {
        let current = self.previous.get(name).or(self.fallback);
        let (replace, stamp) = match (
            stored.as_ref().filter(|value| value.is_present()),
            incoming.as_ref().filter(|value| value.is_present()),
        ) {
            (None, None) => (false, None),
            (Some(_), None) => (false, current),
            (None, Some(_)) => (true, self.incoming),
            (Some(held), Some(offered)) if held == offered => (false, current.max(self.incoming)),
            (Some(_), Some(_)) if self.incoming > current => (true, self.incoming),
            (Some(_), Some(_)) => (false, current),
        };
        if replace {
            stored.clone_from(incoming);
            self.changed = true;
        }
        if let Some(stamp) = stamp {
            self.stamps.insert(name, stamp);
        }
    }

    /// Field stamps of the merged row once it is dated `row_stamp`.
    #[must_use]
    pub fn into_stamps(mut self, row_stamp: Option<NaiveDate>) -> FieldStamps {
        self.stamps.retain_older_than(row_stamp);
        self.stamps
    }

    /// Whether any field changed so far.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.changed
    }
}

/// Both values populated and different.
#[must_use]
pub fn conflicting<T: Presence + PartialEq>(left: &Option<T>, right: &Option<T>) -> bool {
    matches!(
        (left, right),
        (Some(left), Some(right)) if left.is_present() && right.is_present() && left != right
    )
}

/// Field-by-field merge over the non-key attributes of a record.
pub trait FieldMerge {
    /// Fold every attribute of `incoming` into `self`.
    fn merge_fields(&mut self, incoming: &Self, merger: &mut Merger);

    /// Whether some attribute is populated on both sides with different values.
    fn conflicts_with(&self, other: &Self) -> bool;
}

impl FieldMerge for Registration {
    fn merge_fields(&mut self, incoming: &Self, merger: &mut Merger) {
        merger.field("status", &mut self.status, &incoming.status);
        merger.field("status_date", &mut self.status_date, &incoming.status_date);
        merger.field("status_reason", &mut self.status_reason, &incoming.status_reason);
        merger.field("special_status", &mut self.special_status, &incoming.special_status);
        merger.field(
            "special_status_date",
            &mut self.special_status_date,
            &incoming.special_status_date,
        );
    }

    fn conflicts_with(&self, other: &Self) -> bool {
        conflicting(&self.status, &other.status)
            || conflicting(&self.status_date, &other.status_date)
            || conflicting(&self.status_reason, &other.status_reason)
            || conflicting(&self.special_status, &other.special_status)
            || conflicting(&self.special_status_date, &other.special_status_date)
    }
}

impl FieldMerge for Activity {
    fn merge_fields(&mut self, incoming: &Self, merger: &mut Merger) {
        merger.field("activity_start", &mut self.started_on, &incoming.started_on);
        merger.field("primary_activity", &mut self.primary, &incoming.primary);
        merger.field("secondary_activities", &mut self.secondary, &incoming.secondary);
    }

    fn conflicts_with(&self, other: &Self) -> bool {
        conflicting(&self.started_on, &other.started_on)
            || conflicting(&self.primary, &other.primary)
            || conflicting(&self.secondary, &other.secondary)
    }
}

impl FieldMerge for Address {
    fn merge_fields(&mut self, incoming: &Self, merger: &mut Merger) {
        merger.field("street_type", &mut self.street_type, &incoming.street_type);
        merger.field("street", &mut self.street, &incoming.street);
        merger.field("number", &mut self.number, &incoming.number);
        merger.field("complement", &mut self.complement, &incoming.complement);
        merger.field("district", &mut self.district, &incoming.district);
        merger.field("postal_code", &mut self.postal_code, &incoming.postal_code);
        merger.field("state", &mut self.state, &incoming.state);
        merger.field("municipality", &mut self.municipality, &incoming.municipality);
        merger.field("foreign_city", &mut self.foreign_city, &incoming.foreign_city);
        merger.field("country", &mut self.country, &incoming.country);
    }

    fn conflicts_with(&self, other: &Self) -> bool {
        conflicting(&self.street_type, &other.street_type)
            || conflicting(&self.street, &other.street)
            || conflicting(&self.number, &other.number)
            || conflicting(&self.complement, &other.complement)
            || conflicting(&self.district, &other.district)
            || conflicting(&self.postal_code, &other.postal_code)
            || conflicting(&self.state, &other.state)
            || conflicting(&self.municipality, &other.municipality)
            || conflicting(&self.foreign_city, &other.foreign_city)
            || conflicting(&self.country, &other.country)
    }
}

impl FieldMerge for Contact {
    fn merge_fields(&mut self, incoming: &Self, merger: &mut Merger) {
        merger.field("phone1_area", &mut self.phone1_area, &incoming.phone1_area);
        merger.field("phone1", &mut self.phone1, &incoming.phone1);
        merger.field("phone2_area", &mut self.phone2_area, &incoming.phone2_area);
        merger.field("phone2", &mut self.phone2, &incoming.phone2);
        merger.field("fax_area", &mut self.fax_area, &incoming.fax_area);
        merger.field("fax", &mut self.fax, &incoming.fax);
        merger.field("email", &mut self.email, &incoming.email);
    }

    fn conflicts_with(&self, other: &Self) -> bool {
        conflicting(&self.phone1_area, &other.phone1_area)
            || conflicting(&self.phone1, &other.phone1)
            || conflicting(&self.phone2_area, &other.phone2_area)
            || conflicting(&self.phone2, &other.phone2)
            || conflicting(&self.fax_area, &other.fax_area)
            || conflicting(&self.fax, &other.fax)
            || conflicting(&self.email, &other.email)
    }
}

impl FieldMerge for Company {
    fn merge_fields(&mut self, incoming: &Self, merger: &mut Merger) {
        merger.field("legal_name", &mut self.legal_name, &incoming.legal_name);
        merger.field("legal_nature", &mut self.legal_nature, &incoming.legal_nature);
        merger.field(
            "responsible_qualification",
            &mut self.responsible_qualification,
            &incoming.responsible_qualification,
        );
        merger.field("share_capital", &mut self.share_capital, &incoming.share_capital);
        merger.field("size_class", &mut self.size_class, &incoming.size_class);
        merger.field("federative_entity", &mut self.federative_entity, &incoming.federative_entity);
    }

    fn conflicts_with(&self, other: &Self) -> bool {
        conflicting(&self.legal_name, &other.legal_name)
            || conflicting(&self.legal_nature, &other.legal_nature)
            || conflicting(
                &self.responsible_qualification,
                &other.responsible_qualification,
            )
            || conflicting(&self.share_capital, &other.share_capital)
            || conflicting(&self.size_class, &other.size_class)
            || conflicting(&self.federative_entity, &other.federative_entity)
    }
}

impl FieldMerge for Establishment {
    fn merge_fields(&mut self, incoming: &Self, merger: &mut Merger) {
        merger.field("branch_type", &mut self.branch_type, &incoming.branch_type);
        merger.field("trade_name", &mut self.trade_name, &incoming.trade_name);
        self.registration.merge_fields(&incoming.registration, merger);
        self.activity.merge_fields(&incoming.activity, merger);
        self.address.merge_fields(&incoming.address, merger);
        self.contact.merge_fields(&incoming.contact, merger);
    }

    fn conflicts_with(&self, other: &Self) -> bool {
        conflicting(&self.branch_type, &other.branch_type)
            || conflicting(&self.trade_name, &other.trade_name)
            || self.registration.conflicts_with(&other.registration)
            || self.activity.conflicts_with(&other.activity)
            || self.address.conflicts_with(&other.address)
            || self.contact.conflicts_with(&other.contact)
    }
}

impl FieldMerge for Partner {
    fn merge_fields(&mut self, incoming: &Self, merger: &mut Merger) {
        merger.field("partner_type", &mut self.partner_type, &incoming.partner_type);
        merger.field("qualification", &mut self.qualification, &incoming.qualification);
        merger.field("joined_on", &mut self.joined_on, &incoming.joined_on);
        merger.field("country", &mut self.country, &incoming.country);
        merger.field(
            "representative_document",
            &mut self.representative_document,
            &incoming.representative_document,
        );
        merger.field(
            "representative_name",
            &mut self.representative_name,
            &incoming.representative_name,
        );
        merger.field(
            "representative_qualification",
            &mut self.representative_qualification,
            &incoming.representative_qualification,
        );
        merger.field("age_band", &mut self.age_band, &incoming.age_band);
    }

    fn conflicts_with(&self, other: &Self) -> bool {
        conflicting(&self.partner_type, &other.partner_type)
            || conflicting(&self.qualification, &other.qualification)
            || conflicting(&self.joined_on, &other.joined_on)
            || conflicting(&self.country, &other.country)
            || conflicting(
                &self.representative_document,
                &other.representative_document,
            )
            || conflicting(&self.representative_name, &other.representative_name)
            || conflicting(
                &self.representative_qualification,
                &other.representative_qualification,
            )
            || conflicting(&self.age_band, &other.age_band)
    }
}

/// A record kind that is upserted by its natural key.
pub trait Upsertable: FieldMerge + Clone + PartialEq {
    /// Natural key.
    type Key: Clone + Eq + Hash + fmt::Display;

    /// Natural key of this row.
    fn key(&self) -> &Self::Key;

    /// Recency stamp of this row.
    fn last_update(&self) -> Option<NaiveDate>;

    /// Overwrite the recency stamp.
    fn set_last_update(&mut self, stamp: Option<NaiveDate>);

    /// Stamps of the fields older than the row.
    fn field_stamps_mut(&mut self) -> &mut FieldStamps;
}

impl Upsertable for Company {
    type Key = BaseId;

    fn key(&self) -> &BaseId {
        &self.base_id
    }

    fn last_update(&self) -> Option<NaiveDate> {
        self.last_update
    }

    fn set_last_update(&mut self, stamp: Option<NaiveDate>) {
        self.last_update = stamp;
    }

    fn field_stamps_mut(&mut self) -> &mut FieldStamps {
        &mut self.field_stamps
    }
}

impl Upsertable for Establishment {
    type Key = EstablishmentKey;

    fn key(&self) -> &EstablishmentKey {
        &self.key
    }

    fn last_update(&self) -> Option<NaiveDate> {
        self.last_update
    }

    fn set_last_update(&mut self, stamp: Option<NaiveDate>) {
        self.last_update = stamp;
    }

    fn field_stamps_mut(&mut self) -> &mut FieldStamps {
        &mut self.field_stamps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// How incoming rows of a kind are reconciled with stored rows.
pub enum MergeStrategy {
    /// One row per natural key, merged field by field.
    UpsertByKey,
    /// Rows are appended unless a stored row already holds the same data.
    AppendIfNotDuplicate,
}

impl MergeStrategy {
    /// Strategy for a transactional kind; reference kinds have none.
    #[must_use]
    pub fn for_kind(kind: RecordKind) -> Option<Self> {
        match kind {
            RecordKind::Company | RecordKind::Establishment => Some(Self::UpsertByKey),
            RecordKind::Partner => Some(Self::AppendIfNotDuplicate),
            RecordKind::Reference(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Why an incoming row was not written.
pub enum DiscardReason {
    /// The stored row already holds every incoming value.
    Unchanged,
    /// A partner row with the same content already exists.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of reconciling one incoming row with the stored row.
pub enum Decision<R> {
    /// No stored row: write the incoming row as is.
    Insert(R),
    /// The incoming row supersedes every stored value.
    Replace(R),
    /// Stored and incoming values combined field by field.
    Merge(R),
    /// Nothing to write.
    Discard(DiscardReason),
}

impl<R> Decision<R> {
    /// Row to persist, if any.
    #[must_use]
    pub fn row(&self) -> Option<&R> {
        match self {
            Self::Insert(row) | Self::Replace(row) | Self::Merge(row) => Some(row),
            Self::Discard(_) => None,
        }
    }
}

/// Reconcile an incoming row with the stored row under the same key.
///
/// Every value of `incoming` is dated by its `last_update`.
#[must_use]
pub fn decide_upsert<R: Upsertable>(stored: Option<&R>, incoming: R) -> Decision<R> {
    let Some(stored) = stored else {
        return Decision::Insert(incoming);
    };
    let row_stamp = stored.last_update().max(incoming.last_update());
    let mut merged = stored.clone();
    let previous = mem::take(merged.field_stamps_mut());
    let mut merger = Merger::dated(stored.last_update(), previous, incoming.last_update());
    merged.merge_fields(&incoming, &mut merger);
    merged.set_last_update(row_stamp);
    *merged.field_stamps_mut() = merger.into_stamps(row_stamp);

    if merged == *stored {
        Decision::Discard(DiscardReason::Unchanged)
    } else if merged == incoming {
        Decision::Replace(merged)
    } else {
        Decision::Merge(merged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of offering an incoming partner row to one candidate row.
pub enum Absorb {
    /// Different weak key, or some attribute disagrees: not a duplicate.
    Conflict,
    /// The candidate already holds every incoming value.
    Duplicate,
    /// The candidate is a duplicate that gains the returned values.
    Enriched(Partner),
}

/// Offer `incoming` to a candidate partner row.
#[must_use]
pub fn absorb_partner(candidate: &Partner, incoming: &Partner) -> Absorb {
    if candidate.key != incoming.key || candidate.conflicts_with(incoming) {
        return Absorb::Conflict;
    }
    let mut enriched = candidate.clone();
    let mut merger = Merger::gap_fill();
    enriched.merge_fields(incoming, &mut merger);
    if !merger.changed() {
        return Absorb::Duplicate;
    }
    enriched.last_update = candidate.last_update.max(incoming.last_update);
    Absorb::Enriched(enriched)
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Where an incoming partner lands among the rows sharing its weak key.
pub enum Placement {
    /// No candidate is a duplicate.
    New,
    /// The candidate at `index` is a duplicate that gains values.
    Enrich {
        /// Position of the candidate.
        index: usize,
        /// Candidate with the gaps filled.
        partner: Partner,
    },
    /// Some candidate already holds every incoming value.
    Duplicate,
}

/// Place `incoming` among candidates. An exact duplicate anywhere wins over
/// enrichment; otherwise the first enrichable candidate is chosen.
#[must_use]
pub fn place_partner<'row>(
    candidates: impl IntoIterator<Item = &'row Partner>,
    incoming: &Partner,
) -> Placement {
    let mut placement = Placement::New;
    for (index, candidate) in candidates.into_iter().enumerate() {
        match absorb_partner(candidate, incoming) {
            Absorb::Duplicate => return Placement::Duplicate,
            Absorb::Enriched(partner) if placement == Placement::New => {
                placement = Placement::Enrich { index, partner };
            }
            Absorb::Enriched(_) | Absorb::Conflict => {}
        }
    }
    placement
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of the append-if-not-duplicate policy.
pub enum PartnerDecision {
    /// No duplicate candidate: add a new row.
    Append(Partner),
    /// Fill gaps of an existing duplicate row.
    Enrich(StoredPartner),
    /// An existing row already holds the data.
    Discard(DiscardReason),
}

impl PartnerDecision {
    /// Row to persist, if any.
    #[must_use]
    pub fn partner(&self) -> Option<&Partner> {
        match self {
            Self::Append(partner) => Some(partner),
            Self::Enrich(stored) => Some(&stored.partner),
            Self::Discard(_) => None,
        }
    }
}

/// Reconcile an incoming partner with the stored rows sharing its weak key.
#[must_use]
pub fn decide_append(candidates: &[StoredPartner], incoming: Partner) -> PartnerDecision {
    let placement = place_partner(
        candidates.iter().map(|candidate| &candidate.partner),
        &incoming,
    );
    match placement {
        Placement::New => PartnerDecision::Append(incoming),
        Placement::Duplicate => PartnerDecision::Discard(DiscardReason::Duplicate),
        Placement::Enrich { index, partner } => match candidates.get(index) {
            Some(candidate) => PartnerDecision::Enrich(StoredPartner {
                row_id: candidate.row_id,
                partner,
            }),
            None => PartnerDecision::Append(incoming),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartnerKey;

    fn date(raw: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
    }

    fn establishment(stamp: &str) -> Establishment {
        let key = EstablishmentKey::parse("12345678", "0001", "90").expect("valid key");
        let mut row = Establishment::new(key);
        row.last_update = date(stamp);
        row
    }

    fn company(stamp: &str, name: Option<&str>) -> Company {
        let mut row = Company::new(BaseId::parse("12345678").expect("valid id"));
        row.legal_name = name.map(str::to_owned);
        row.last_update = date(stamp);
        row
    }

    #[test]
    fn absent_row_is_inserted_unchanged() {
        let incoming = company("2023-05-01", Some("ACME"));
        assert_eq!(
            decide_upsert(None, incoming.clone()),
            Decision::Insert(incoming),
            "first sighting inserts"
        );
    }

    #[test]
    fn sparse_later_snapshot_merges_instead_of_overwriting() {
        let mut may = establishment("2023-05-01");
        may.address.street = Some("Rua A".to_owned());
        let mut july = establishment("2023-07-01");
        july.trade_name = Some("Loja X".to_owned());

        let Decision::Merge(merged) = decide_upsert(Some(&may), july) else {
            panic!("expected a field-level merge");
        };
        assert_eq!(merged.trade_name.as_deref(), Some("Loja X"), "gap filled");
        assert_eq!(merged.address.street.as_deref(), Some("Rua A"), "kept");
        assert_eq!(merged.last_update, date("2023-07-01"), "recency advances");
    }

    #[test]
    fn later_period_wins_when_both_populated() {
        let stored = company("2023-05-01", Some("OLD NAME"));
        let incoming = company("2023-07-01", Some("NEW NAME"));
        assert_eq!(
            decide_upsert(Some(&stored), incoming.clone()),
            Decision::Replace(incoming),
            "strictly later snapshot replaces"
        );
    }

    #[test]
    fn earlier_period_only_fills_gaps() {
        let mut stored = company("2023-07-01", Some("NEW NAME"));
        stored.size_class = None;
        let mut incoming = company("2023-05-01", Some("OLD NAME"));
        incoming.size_class = Some("03".to_owned());

        let Decision::Merge(merged) = decide_upsert(Some(&stored), incoming) else {
            panic!("expected a merge");
        };
        assert_eq!(merged.legal_name.as_deref(), Some("NEW NAME"), "later kept");
        assert_eq!(merged.size_class.as_deref(), Some("03"), "gap filled");
        assert_eq!(merged.last_update, date("2023-07-01"), "recency kept");
    }

    #[test]
    fn same_period_is_a_no_op() {
        let stored = company("2023-05-01", Some("ONE"));
        let incoming = company("2023-05-01", Some("TWO"));
        assert_eq!(
            decide_upsert(Some(&stored), incoming),
            Decision::Discard(DiscardReason::Unchanged),
            "equal periods keep the stored value"
        );
    }

    #[test]
    fn zero_capital_never_overwrites() {
        let mut stored = company("2023-05-01", Some("ACME"));
        stored.share_capital = Some(ShareCapital(100_000));
        let mut incoming = company("2023-07-01", Some("ACME"));
        incoming.share_capital = Some(ShareCapital(0));

        let Decision::Merge(merged) = decide_upsert(Some(&stored), incoming) else {
            panic!("expected a merge that only advances recency");
        };
        assert_eq!(merged.share_capital, Some(ShareCapital(100_000)), "kept");
        assert_eq!(merged.last_update, date("2023-07-01"), "recency advances");
        assert_eq!(
            merged.field_stamps.get("share_capital"),
            date("2023-05-01"),
            "capital still dated from its own snapshot"
        );
    }

    fn apply_in_order(rows: &[Company]) -> Company {
        rows.iter()
            .cloned()
            .fold(None, |stored: Option<Company>, incoming| {
                match decide_upsert(stored.as_ref(), incoming) {
                    Decision::Insert(row) | Decision::Replace(row) | Decision::Merge(row) => {
                        Some(row)
                    }
                    Decision::Discard(_) => stored,
                }
            })
            .expect("at least one row")
    }

    #[test]
    fn backfilled_periods_converge_field_by_field() {
        let may = company("2023-05-01", Some("MAY"));
        let june = company("2023-06-01", Some("JUNE"));
        let july = company("2023-07-01", None);

        let chronological = apply_in_order(&[may.clone(), june.clone(), july.clone()]);
        assert_eq!(chronological.legal_name.as_deref(), Some("JUNE"), "newest value");
        assert_eq!(chronological.last_update, date("2023-07-01"), "row recency");

        let orders = [
            [july.clone(), may.clone(), june.clone()],
            [july.clone(), june.clone(), may.clone()],
            [june.clone(), may.clone(), july.clone()],
            [june.clone(), july.clone(), may.clone()],
            [may.clone(), july.clone(), june.clone()],
        ];
        for order in &orders {
            assert_eq!(
                apply_in_order(order),
                chronological,
                "same row whatever the arrival order"
            );
        }
    }

    #[test]
    fn equal_values_carry_the_newest_stamp() {
        let may = company("2023-05-01", Some("ACME"));
        let july = company("2023-07-01", Some("ACME"));
        let june = company("2023-06-01", Some("ACME INDUSTRIA"));

        let merged = apply_in_order(&[may, july, june]);
        assert_eq!(merged.legal_name.as_deref(), Some("ACME"), "july confirmed the name");
        assert!(merged.field_stamps.is_empty(), "every field dates from july");
    }

    #[test]
    fn strategies_are_tagged_per_kind() {
        assert_eq!(
            MergeStrategy::for_kind(RecordKind::Partner),
            Some(MergeStrategy::AppendIfNotDuplicate),
            "partners append"
        );
        assert_eq!(
            MergeStrategy::for_kind(RecordKind::Company),
            Some(MergeStrategy::UpsertByKey),
            "companies upsert"
        );
    }

    fn partner(document: &str, qualification: Option<&str>) -> Partner {
        let mut row = Partner::new(PartnerKey {
            base_id: BaseId::parse("12345678").expect("valid id"),
            name: "MARIA".to_owned(),
            document: document.to_owned(),
        });
        row.qualification = qualification.map(str::to_owned);
        row.last_update = date("2023-05-01");
        row
    }

    #[test]
    fn partner_duplicates_are_discarded_and_gaps_enriched() {
        let stored = vec![StoredPartner {
            row_id: 7,
            partner: partner("***123456**", None),
        }];

        let enriched = decide_append(&stored, partner("***123456**", Some("49")));
        let PartnerDecision::Enrich(row) = enriched else {
            panic!("expected enrichment");
        };
        assert_eq!(row.row_id, 7, "targets the stored row");
        assert_eq!(row.partner.qualification.as_deref(), Some("49"), "gap filled");

        assert_eq!(
            decide_append(&stored, partner("***123456**", None)),
            PartnerDecision::Discard(DiscardReason::Duplicate),
            "identical row discarded"
        );
    }

    #[test]
    fn partner_with_different_material_value_is_appended() {
        let stored = vec![StoredPartner {
            row_id: 7,
            partner: partner("***123456**", Some("22")),
        }];
        let incoming = partner("***123456**", Some("49"));
        assert_eq!(
            decide_append(&stored, incoming.clone()),
            PartnerDecision::Append(incoming),
            "conflicting qualification makes a new row"
        );
    }
}
