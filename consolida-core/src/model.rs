//! Domain data structures for registry snapshots, keys, and consolidated records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
/// One dated registry extract, named `YYYY-MM`.
///
/// Stored as the first day of the month so ordering is chronological.
pub struct Period(NaiveDate);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid period `{0}`, expected YYYY-MM")]
/// A folder or string that is not a `YYYY-MM` period.
pub struct PeriodParseError(pub String);

impl Period {
    /// Build a period from a year and a month (1–12).
    #[must_use]
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(Self)
    }

    /// Calendar year of the snapshot.
    #[must_use]
    pub fn year(self) -> i32 {
        self.0.year()
    }

    /// Calendar month of the snapshot.
    #[must_use]
    pub fn month(self) -> u32 {
        self.0.month()
    }

    /// First day of the period, used as the `last_update` stamp of its records.
    #[must_use]
    pub fn first_day(self) -> NaiveDate {
        self.0
    }
}

impl FromStr for Period {
    type Err = PeriodParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || PeriodParseError(raw.to_owned());
        let (year, month) = raw.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4
            || month.len() != 2
            || !year.bytes().all(|byte| byte.is_ascii_digit())
            || !month.bytes().all(|byte| byte.is_ascii_digit())
        {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).ok_or_else(invalid)
    }
}

impl TryFrom<String> for Period {
    type Error = PeriodParseError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{:04}-{:02}", self.year(), self.month())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Code→label dimension tables published alongside the registry.
pub enum ReferenceTable {
    /// Economic activity codes (CNAE).
    Cnae,
    /// Municipalities.
    Municipality,
    /// Legal nature of a company.
    LegalNature,
    /// Countries.
    Country,
    /// Partner and responsible-party qualifications.
    PartnerQualification,
    /// Reasons for a registration status.
    StatusReason,
}

impl ReferenceTable {
    /// Every reference table, in load order.
    pub const ALL: [Self; 6] = [
        Self::Cnae,
        Self::Municipality,
        Self::LegalNature,
        Self::Country,
        Self::PartnerQualification,
        Self::StatusReason,
    ];

    /// Name of the backing table in the store.
    #[must_use]
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Cnae => "cnae",
            Self::Municipality => "municipality",
            Self::LegalNature => "legal_nature",
            Self::Country => "country",
            Self::PartnerQualification => "partner_qualification",
            Self::StatusReason => "status_reason",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Logical kind of a source file. Reference kinds sort before transactional ones.
pub enum RecordKind {
    /// A code→label dimension table.
    Reference(ReferenceTable),
    /// Company (base identifier level) records.
    Company,
    /// Establishment (branch) records.
    Establishment,
    /// Partner/owner records.
    Partner,
}

impl RecordKind {
    /// Whether records of this kind go through the consolidation engine.
    #[must_use]
    pub fn is_transactional(self) -> bool {
        !matches!(self, Self::Reference(_))
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reference(table) => table.table_name(),
            Self::Company => "company",
            Self::Establishment => "establishment",
            Self::Partner => "partner",
        };
        write!(formatter, "{name}")
    }
}

/// Left-pad a purely numeric field to `width` digits.
fn padded_digits(raw: &str, width: usize) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.len() > width || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some(format!("{raw:0>width$}"))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Eight-digit root identifier shared by a company and all its establishments.
pub struct BaseId(String);

impl BaseId {
    /// Parse a numeric identifier of up to eight digits, zero-padding it.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        padded_digits(raw, 8).map(Self)
    }

    /// The eight-digit identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BaseId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Composite key of a single establishment: base id, order suffix, check digits.
pub struct EstablishmentKey {
    /// Company root identifier.
    pub base_id: BaseId,
    /// Four-digit branch order.
    pub order: String,
    /// Two check digits.
    pub check_digits: String,
}

impl EstablishmentKey {
    /// Parse the three key columns of an establishment row.
    #[must_use]
    pub fn parse(base_id: &str, order: &str, check_digits: &str) -> Option<Self> {
        Some(Self {
            base_id: BaseId::parse(base_id)?,
            order: padded_digits(order, 4)?,
            check_digits: padded_digits(check_digits, 2)?,
        })
    }
}

impl fmt::Display for EstablishmentKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}{}{}",
            self.base_id, self.order, self.check_digits
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Weak identity of a partner row. Not unique across periods.
pub struct PartnerKey {
    /// Company the partner belongs to.
    pub base_id: BaseId,
    /// Partner name or legal name.
    pub name: String,
    /// Masked CPF or full CNPJ of the partner; empty when not published.
    pub document: String,
}

impl fmt::Display for PartnerKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}/{}", self.base_id, self.name, self.document)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Share capital in centavos. A zero capital carries no information.
pub struct ShareCapital(pub i64);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid share capital `{0}`")]
/// Share capital that is not a decimal number.
pub struct ShareCapitalParseError(pub String);

impl ShareCapital {
    /// Value in centavos.
    #[must_use]
    pub fn cents(self) -> i64 {
        self.0
    }
}

impl FromStr for ShareCapital {
    type Err = ShareCapitalParseError;

    // Source values look like `000000001500,00`. When a comma is present dots
    // are thousands separators, otherwise the last dot is the decimal point.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ShareCapitalParseError(raw.to_owned());
        let trimmed = raw.trim();
        let (units, fraction) = match trimmed.rsplit_once(',') {
            Some((units, fraction)) => (units.replace('.', ""), fraction),
            None => match trimmed.rsplit_once('.') {
                Some((units, fraction)) => (units.to_owned(), fraction),
                None => (trimmed.to_owned(), ""),
            },
        };
        let all_digits = |part: &str| part.bytes().all(|byte| byte.is_ascii_digit());
        if units.is_empty() || !all_digits(&units) || !all_digits(fraction) {
            return Err(invalid());
        }
        let units: i64 = units.parse().map_err(|_| invalid())?;

        // Rounded half up to centavos.
        let mut digits = fraction.bytes().map(|byte| i64::from(byte - b'0'));
        let tenths = digits.next().unwrap_or(0);
        let hundredths = digits.next().unwrap_or(0);
        let round_up = i64::from(digits.next().is_some_and(|digit| digit >= 5));
        units
            .checked_mul(100)
            .and_then(|cents| cents.checked_add(tenths * 10 + hundredths + round_up))
            .map(Self)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for ShareCapital {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}.{:02}", self.0 / 100, (self.0 % 100).abs())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Snapshot date of each field whose value is older than its row.
///
/// A populated field without an entry dates from the row's `last_update`.
/// Rows keep only the exceptions, so a row written by a single snapshot
/// carries an empty map.
pub struct FieldStamps(BTreeMap<String, NaiveDate>);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid field stamps `{0}`, expected name=YYYY-MM-DD pairs")]
/// Persisted field stamps that cannot be read back.
pub struct FieldStampsParseError(pub String);

impl FieldStamps {
    /// Stamp recorded for `field`, if it differs from the row's.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<NaiveDate> {
        self.0.get(field).copied()
    }

    /// Record the stamp of `field`.
    pub fn insert(&mut self, field: &str, stamp: NaiveDate) {
        self.0.insert(field.to_owned(), stamp);
    }

    /// Drop the entries that equal the row stamp.
    pub fn retain_older_than(&mut self, row_stamp: Option<NaiveDate>) {
        self.0.retain(|_, stamp| Some(*stamp) != row_stamp);
    }

    /// Whether every field dates from the row's `last_update`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FieldStamps {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (field, stamp)) in self.0.iter().enumerate() {
            if index > 0 {
                formatter.write_str(";")?;
            }
            write!(formatter, "{field}={}", stamp.format("%Y-%m-%d"))?;
        }
        Ok(())
    }
}

impl FromStr for FieldStamps {
    type Err = FieldStampsParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || FieldStampsParseError(raw.to_owned());
        raw.split(';')
            .filter(|pair| !pair.trim().is_empty())
            .map(|pair| {
                let (field, stamp) = pair.split_once('=').ok_or_else(invalid)?;
                let stamp =
                    NaiveDate::parse_from_str(stamp.trim(), "%Y-%m-%d").map_err(|_| invalid())?;
                Ok((field.trim().to_owned(), stamp))
            })
            .collect::<Result<_, _>>()
            .map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Company-level registry data, one row per base identifier.
pub struct Company {
    /// Root identifier.
    pub base_id: BaseId,
    /// Legal (registered) name.
    pub legal_name: Option<String>,
    /// Legal nature code.
    pub legal_nature: Option<String>,
    /// Qualification code of the responsible party.
    pub responsible_qualification: Option<String>,
    /// Declared share capital.
    pub share_capital: Option<ShareCapital>,
    /// Size class code.
    pub size_class: Option<String>,
    /// Responsible federative entity, for public bodies.
    pub federative_entity: Option<String>,
    /// First day of the snapshot that last touched the row.
    pub last_update: Option<NaiveDate>,
    /// Fields holding values from an older snapshot than `last_update`.
    #[serde(default)]
    pub field_stamps: FieldStamps,
}

impl Company {
    /// Empty company row for a base identifier.
    #[must_use]
    pub fn new(base_id: BaseId) -> Self {
        Self {
            base_id,
            legal_name: None,
            legal_nature: None,
            responsible_qualification: None,
            share_capital: None,
            size_class: None,
            federative_entity: None,
            last_update: None,
            field_stamps: FieldStamps::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Registration status block of an establishment.
pub struct Registration {
    /// Registration status code (active, suspended, ...).
    pub status: Option<String>,
    /// Date of the current status.
    pub status_date: Option<NaiveDate>,
    /// Reason code for the current status.
    pub status_reason: Option<String>,
    /// Special status text.
    pub special_status: Option<String>,
    /// Date of the special status.
    pub special_status_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Economic activity block of an establishment.
pub struct Activity {
    /// Date the establishment started operating.
    pub started_on: Option<NaiveDate>,
    /// Primary CNAE code.
    pub primary: Option<String>,
    /// Comma separated secondary CNAE codes.
    pub secondary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Postal address of an establishment.
pub struct Address {
    /// Street type (RUA, AVENIDA, ...).
    pub street_type: Option<String>,
    /// Street name.
    pub street: Option<String>,
    /// House number, often `S/N`.
    pub number: Option<String>,
    /// Address complement.
    pub complement: Option<String>,
    /// District.
    pub district: Option<String>,
    /// Postal code (CEP).
    pub postal_code: Option<String>,
    /// Federative unit (UF).
    pub state: Option<String>,
    /// Municipality code.
    pub municipality: Option<String>,
    /// City name for establishments abroad.
    pub foreign_city: Option<String>,
    /// Country code for establishments abroad.
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Contact fields of an establishment.
pub struct Contact {
    /// Area code of the first phone.
    pub phone1_area: Option<String>,
    /// First phone.
    pub phone1: Option<String>,
    /// Area code of the second phone.
    pub phone2_area: Option<String>,
    /// Second phone.
    pub phone2: Option<String>,
    /// Area code of the fax.
    pub fax_area: Option<String>,
    /// Fax number.
    pub fax: Option<String>,
    /// Email address.
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A single establishment (head office or branch) of a company.
pub struct Establishment {
    /// Composite key.
    pub key: EstablishmentKey,
    /// `1` head office, `2` branch.
    pub branch_type: Option<String>,
    /// Trade name, frequently absent.
    pub trade_name: Option<String>,
    /// Registration status block.
    pub registration: Registration,
    /// Activity block.
    pub activity: Activity,
    /// Address block.
    pub address: Address,
    /// Contact block.
    pub contact: Contact,
    /// First day of the snapshot that last touched the row.
    pub last_update: Option<NaiveDate>,
    /// Fields holding values from an older snapshot than `last_update`.
    #[serde(default)]
    pub field_stamps: FieldStamps,
}

impl Establishment {
    /// Empty establishment row for a key.
    #[must_use]
    pub fn new(key: EstablishmentKey) -> Self {
        Self {
            key,
            branch_type: None,
            trade_name: None,
            registration: Registration::default(),
            activity: Activity::default(),
            address: Address::default(),
            contact: Contact::default(),
            last_update: None,
            field_stamps: FieldStamps::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Partner or owner of a company.
pub struct Partner {
    /// Weak identity (base id, name, document).
    pub key: PartnerKey,
    /// `1` legal entity, `2` natural person, `3` foreigner.
    pub partner_type: Option<String>,
    /// Qualification code.
    pub qualification: Option<String>,
    /// Date the partner joined the company.
    pub joined_on: Option<NaiveDate>,
    /// Country code for foreign partners.
    pub country: Option<String>,
    /// Masked document of the legal representative.
    pub representative_document: Option<String>,
    /// Name of the legal representative.
    pub representative_name: Option<String>,
    /// Qualification code of the legal representative.
    pub representative_qualification: Option<String>,
    /// Age band code.
    pub age_band: Option<String>,
    /// First day of the snapshot that last touched the row.
    pub last_update: Option<NaiveDate>,
}

impl Partner {
    /// Empty partner row for a key.
    #[must_use]
    pub fn new(key: PartnerKey) -> Self {
        Self {
            key,
            partner_type: None,
            qualification: None,
            joined_on: None,
            country: None,
            representative_document: None,
            representative_name: None,
            representative_qualification: None,
            age_band: None,
            last_update: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Partner row as persisted, with its surrogate row id.
pub struct StoredPartner {
    /// Surrogate id assigned by the store.
    pub row_id: i64,
    /// Row content.
    pub partner: Partner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One code→label pair of a reference table.
pub struct ReferenceEntry {
    /// Stable domain code.
    pub code: String,
    /// Human-readable description.
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_parses_and_orders_chronologically() {
        let may: Period = "2023-05".parse().expect("valid period");
        let july: Period = "2023-07".parse().expect("valid period");
        let january: Period = "2024-01".parse().expect("valid period");
        assert!(may < july && july < january, "periods must sort by date");
        assert_eq!(may.to_string(), "2023-05", "display is YYYY-MM");
        assert_eq!(
            may.first_day(),
            NaiveDate::from_ymd_opt(2023, 5, 1).expect("valid date"),
            "first day stamps the period"
        );
    }

    #[test]
    fn period_rejects_other_folder_names() {
        for raw in ["2023-13", "2023-5", "23-05", "2023_05", "abcd-ef", "2023-05-01"] {
            assert!(raw.parse::<Period>().is_err(), "{raw} must be rejected");
        }
    }

    #[test]
    fn keys_are_zero_padded() {
        let key = EstablishmentKey::parse("1234567", "1", "9").expect("numeric key");
        assert_eq!(key.to_string(), "01234567000109", "14 digit cnpj");
        assert!(BaseId::parse("12a45678").is_none(), "letters rejected");
        assert!(BaseId::parse("123456789").is_none(), "too long");
        assert!(BaseId::parse("").is_none(), "empty rejected");
    }

    #[test]
    fn share_capital_parses_comma_decimals() {
        let parse = |raw: &str| raw.parse::<ShareCapital>().map(ShareCapital::cents);
        assert_eq!(parse("1500,00"), Ok(150_000), "comma separator");
        assert_eq!(parse("1500.5"), Ok(150_050), "single fraction digit");
        assert_eq!(parse("0000000010"), Ok(1000), "no fraction");
        assert!(parse("1,500,00").is_err(), "two decimal commas rejected");
        assert!(parse("abc").is_err(), "not a number");
        assert_eq!(ShareCapital(150_050).to_string(), "1500.50", "display");
    }

    #[test]
    fn share_capital_accepts_thousands_dots_and_long_fractions() {
        let parse = |raw: &str| raw.parse::<ShareCapital>().map(ShareCapital::cents);
        assert_eq!(parse("1.234,56"), Ok(123_456), "dots group thousands");
        assert_eq!(parse("1.234.567,8"), Ok(123_456_780), "several groups");
        assert_eq!(parse("1500,000"), Ok(150_000), "third decimal dropped");
        assert_eq!(parse("10,005"), Ok(1001), "rounded half up");
        assert!(parse("1.234.567").is_err(), "dotted units without comma");
    }

    #[test]
    fn field_stamps_keep_only_older_fields_and_read_back() {
        let may = NaiveDate::from_ymd_opt(2023, 5, 1).expect("valid date");
        let june = NaiveDate::from_ymd_opt(2023, 6, 1).expect("valid date");
        let mut stamps = FieldStamps::default();
        stamps.insert("trade_name", may);
        stamps.insert("legal_name", june);
        stamps.retain_older_than(Some(june));
        assert_eq!(stamps.get("trade_name"), Some(may), "older field kept");
        assert_eq!(stamps.get("legal_name"), None, "row-dated field dropped");

        let text = stamps.to_string();
        assert_eq!(text, "trade_name=2023-05-01", "persisted form");
        assert_eq!(text.parse::<FieldStamps>(), Ok(stamps), "reads back");
        assert_eq!("".parse::<FieldStamps>(), Ok(FieldStamps::default()), "empty");
        assert!("trade_name".parse::<FieldStamps>().is_err(), "missing date");
    }
}
