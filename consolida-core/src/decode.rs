//! Column layouts of the registry extracts and per-kind row decoding.

use chrono::NaiveDate;

use crate::model::{
    Activity, Address, BaseId, Company, Contact, Establishment, EstablishmentKey, FieldStamps,
    Partner, PartnerKey, Period, ReferenceEntry, Registration, ShareCapital,
};

/// Columns of a company extract.
pub const COMPANY_COLUMNS: &[&str] = &[
    "base_id",
    "legal_name",
    "legal_nature",
    "responsible_qualification",
    "share_capital",
    "size_class",
    "federative_entity",
];

/// Columns of an establishment extract.
pub const ESTABLISHMENT_COLUMNS: &[&str] = &[
    "base_id",
    "order",
    "check_digits",
    "branch_type",
    "trade_name",
    "status",
    "status_date",
    "status_reason",
    "foreign_city",
    "country",
    "activity_start",
    "primary_activity",
    "secondary_activities",
    "street_type",
    "street",
    "number",
    "complement",
    "district",
    "postal_code",
    "state",
    "municipality",
    "phone1_area",
    "phone1",
    "phone2_area",
    "phone2",
    "fax_area",
    "fax",
    "email",
    "special_status",
    "special_status_date",
];

/// Columns of a partner extract.
pub const PARTNER_COLUMNS: &[&str] = &[
    "base_id",
    "partner_type",
    "name",
    "document",
    "qualification",
    "joined_on",
    "country",
    "representative_document",
    "representative_name",
    "representative_qualification",
    "age_band",
];

/// Columns of every reference extract.
pub const REFERENCE_COLUMNS: &[&str] = &["code", "label"];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Why a single source row could not be decoded.
pub enum DecodeError {
    /// The row does not have the layout's column count.
    #[error("Expected {expected} columns, found {found}")]
    ColumnCount {
        /// Columns in the layout.
        expected: usize,
        /// Columns in the row.
        found: usize,
    },
    /// A required column is blank.
    #[error("Missing required {0}")]
    Missing(&'static str),
    /// A column has a value of the wrong shape.
    #[error("Invalid {column}: `{value}`")]
    Invalid {
        /// Column name.
        column: &'static str,
        /// Offending value.
        value: String,
    },
    /// A column is not valid text in the layout encoding.
    #[error("Undecodable text in {0}")]
    Encoding(&'static str),
    /// The CSV framing of the row is broken.
    #[error("Malformed row: {0}")]
    Malformed(String),
}

/// Sequential access to the decoded columns of one row.
#[derive(Debug)]
pub struct FieldCursor<'a> {
    columns: &'static [&'static str],
    values: &'a [String],
    index: usize,
}

impl<'a> FieldCursor<'a> {
    /// Cursor over `values`, named by `columns`.
    #[must_use]
    pub fn new(columns: &'static [&'static str], values: &'a [String]) -> Self {
        Self {
            columns,
            values,
            index: 0,
        }
    }

    fn next_field(&mut self) -> (&'static str, &'a str) {
        let column = self.columns.get(self.index).copied().unwrap_or("extra");
        let value = self.values.get(self.index).map_or("", String::as_str);
        self.index += 1;
        (column, value.trim())
    }

    /// Next column as raw trimmed text, possibly empty.
    pub fn raw(&mut self) -> &'a str {
        self.next_field().1
    }

    /// Next column as optional text.
    pub fn text(&mut self) -> Option<String> {
        let value = self.raw();
        (!value.is_empty()).then(|| value.to_owned())
    }

    /// Next column as non-empty text.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Missing`] when blank.
    pub fn required(&mut self) -> Result<String, DecodeError> {
        let (column, value) = self.next_field();
        if value.is_empty() {
            return Err(DecodeError::Missing(column));
        }
        Ok(value.to_owned())
    }

    /// Next column as a `YYYYMMDD` date. `0` and `00000000` mean absent.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Invalid`] for other unparsable values.
    pub fn date(&mut self) -> Result<Option<NaiveDate>, DecodeError> {
        let (column, value) = self.next_field();
        if value.is_empty() || value.bytes().all(|byte| byte == b'0') {
            return Ok(None);
        }
        NaiveDate::parse_from_str(value, "%Y%m%d")
            .map(Some)
            .map_err(|_| DecodeError::Invalid {
                column,
                value: value.to_owned(),
            })
    }

    /// Next column as a share capital amount.
    ///
    /// An amount that cannot be read is treated as absent so the rest of the
    /// row still loads.
    pub fn capital(&mut self) -> Option<ShareCapital> {
        let (column, value) = self.next_field();
        if value.is_empty() {
            return None;
        }
        match value.parse() {
            Ok(capital) => Some(capital),
            Err(err) => {
                tracing::debug!(column, error = %err, "unreadable amount, keeping it empty");
                None
            }
        }
    }

    /// Next column as a base identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Invalid`] when not up to eight digits.
    pub fn base_id(&mut self) -> Result<BaseId, DecodeError> {
        let (column, value) = self.next_field();
        BaseId::parse(value).ok_or_else(|| DecodeError::Invalid {
            column,
            value: value.to_owned(),
        })
    }
}

/// A record kind that can be decoded from one row of its extract.
pub trait FromRow: Sized {
    /// Column layout the decoder consumes, in order.
    const COLUMNS: &'static [&'static str];

    /// Decode a row of `period`.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] when a column is missing or malformed.
    fn from_row(fields: &mut FieldCursor<'_>, period: Period) -> Result<Self, DecodeError>;
}

impl FromRow for Company {
    const COLUMNS: &'static [&'static str] = COMPANY_COLUMNS;

    fn from_row(fields: &mut FieldCursor<'_>, period: Period) -> Result<Self, DecodeError> {
        Ok(Self {
            base_id: fields.base_id()?,
            legal_name: fields.text(),
            legal_nature: fields.text(),
            responsible_qualification: fields.text(),
            share_capital: fields.capital(),
            size_class: fields.text(),
            federative_entity: fields.text(),
            last_update: Some(period.first_day()),
            field_stamps: FieldStamps::default(),
        })
    }
}

impl FromRow for Establishment {
    const COLUMNS: &'static [&'static str] = ESTABLISHMENT_COLUMNS;

    fn from_row(fields: &mut FieldCursor<'_>, period: Period) -> Result<Self, DecodeError> {
        let base_id = fields.raw();
        let order = fields.raw();
        let check_digits = fields.raw();
        let key = EstablishmentKey::parse(base_id, order, check_digits).ok_or_else(|| {
            DecodeError::Invalid {
                column: "establishment key",
                value: format!("{base_id}/{order}-{check_digits}"),
            }
        })?;
        let branch_type = fields.text();
        let trade_name = fields.text();
        let status = fields.text();
        let status_date = fields.date()?;
        let status_reason = fields.text();
        let foreign_city = fields.text();
        let country = fields.text();
        let activity = Activity {
            started_on: fields.date()?,
            primary: fields.text(),
            secondary: fields.text(),
        };
        let mut address = Address {
            street_type: fields.text(),
            street: fields.text(),
            number: fields.text(),
            complement: fields.text(),
            district: fields.text(),
            postal_code: fields.text(),
            state: fields.text(),
            municipality: fields.text(),
            foreign_city,
            country,
        };
        address.complement = address.complement.map(|text| collapse_spaces(&text));
        let contact = Contact {
            phone1_area: fields.text(),
            phone1: fields.text(),
            phone2_area: fields.text(),
            phone2: fields.text(),
            fax_area: fields.text(),
            fax: fields.text(),
            email: fields.text(),
        };
        let registration = Registration {
            status,
            status_date,
            status_reason,
            special_status: fields.text(),
            special_status_date: fields.date()?,
        };
        Ok(Self {
            key,
            branch_type,
            trade_name,
            registration,
            activity,
            address,
            contact,
            last_update: Some(period.first_day()),
            field_stamps: FieldStamps::default(),
        })
    }
}

impl FromRow for Partner {
    const COLUMNS: &'static [&'static str] = PARTNER_COLUMNS;

    fn from_row(fields: &mut FieldCursor<'_>, period: Period) -> Result<Self, DecodeError> {
        let base_id = fields.base_id()?;
        let partner_type = fields.text();
        let name = fields.required()?;
        let document = fields.raw().to_owned();
        Ok(Self {
            key: PartnerKey {
                base_id,
                name,
                document,
            },
            partner_type,
            qualification: fields.text(),
            joined_on: fields.date()?,
            country: fields.text(),
            representative_document: fields.text(),
            representative_name: fields.text(),
            representative_qualification: fields.text(),
            age_band: fields.text(),
            last_update: Some(period.first_day()),
        })
    }
}

impl FromRow for ReferenceEntry {
    const COLUMNS: &'static [&'static str] = REFERENCE_COLUMNS;

    fn from_row(fields: &mut FieldCursor<'_>, _period: Period) -> Result<Self, DecodeError> {
        Ok(Self {
            code: fields.required()?,
            label: fields.required()?,
        })
    }
}

// Complements are padded with runs of spaces in the extracts.
fn collapse_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
