//! Row mapping between registry records and store tables.

use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};

use consolida_core::{
    Activity, Address, BaseId, Company, Contact, Establishment, EstablishmentKey, FieldStamps,
    Partner, PartnerKey, Registration, ShareCapital, StoredPartner,
};

const INSERT_COMPANY: &str = "
INSERT INTO company (
    base_id, legal_name, legal_nature, responsible_qualification,
    share_capital_cents, size_class, federative_entity, last_update, field_stamps
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const UPDATE_COMPANY: &str = "
UPDATE company SET
    legal_name = ?2, legal_nature = ?3, responsible_qualification = ?4,
    share_capital_cents = ?5, size_class = ?6, federative_entity = ?7, last_update = ?8,
    field_stamps = ?9
WHERE base_id = ?1";

pub(crate) const SELECT_COMPANY: &str = "
SELECT legal_name, legal_nature, responsible_qualification, share_capital_cents,
       size_class, federative_entity, last_update, field_stamps
FROM company WHERE base_id = ?1";

const INSERT_ESTABLISHMENT: &str = "
INSERT INTO establishment (
    base_id, order_suffix, check_digits, branch_type, trade_name,
    status, status_date, status_reason, special_status, special_status_date,
    started_on, primary_activity, secondary_activities,
    street_type, street, number, complement, district, postal_code, state,
    municipality, foreign_city, country,
    phone1_area, phone1, phone2_area, phone2, fax_area, fax, email, last_update,
    field_stamps
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32
)";

const UPDATE_ESTABLISHMENT: &str = "
UPDATE establishment SET
    branch_type = ?4, trade_name = ?5,
    status = ?6, status_date = ?7, status_reason = ?8,
    special_status = ?9, special_status_date = ?10,
    started_on = ?11, primary_activity = ?12, secondary_activities = ?13,
    street_type = ?14, street = ?15, number = ?16, complement = ?17, district = ?18,
    postal_code = ?19, state = ?20, municipality = ?21, foreign_city = ?22, country = ?23,
    phone1_area = ?24, phone1 = ?25, phone2_area = ?26, phone2 = ?27,
    fax_area = ?28, fax = ?29, email = ?30, last_update = ?31, field_stamps = ?32
WHERE base_id = ?1 AND order_suffix = ?2 AND check_digits = ?3";

pub(crate) const SELECT_ESTABLISHMENT: &str = "
SELECT * FROM establishment
WHERE base_id = ?1 AND order_suffix = ?2 AND check_digits = ?3";

const INSERT_PARTNER: &str = "
INSERT INTO partner (
    partner_id, base_id, name, document, partner_type, qualification, joined_on,
    country, representative_document, representative_name,
    representative_qualification, age_band, last_update
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

const UPDATE_PARTNER: &str = "
UPDATE partner SET
    base_id = ?2, name = ?3, document = ?4, partner_type = ?5, qualification = ?6,
    joined_on = ?7, country = ?8, representative_document = ?9,
    representative_name = ?10, representative_qualification = ?11,
    age_band = ?12, last_update = ?13
WHERE partner_id = ?1";

pub(crate) const SELECT_PARTNERS: &str = "
SELECT * FROM partner
WHERE base_id = ?1 AND name = ?2 AND document = ?3
ORDER BY partner_id";

#[derive(thiserror::Error, Debug)]
#[error("stored key `{0}` is not a numeric registry key")]
struct InvalidKey(String);

fn invalid_key(raw: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(InvalidKey(raw)))
}

// Rows written by a single snapshot store NULL.
fn stamps_to_sql(stamps: &FieldStamps) -> Option<String> {
    (!stamps.is_empty()).then(|| stamps.to_string())
}

fn stamps_from_row(row: &Row<'_>) -> rusqlite::Result<FieldStamps> {
    let Some(raw) = row.get::<_, Option<String>>("field_stamps")? else {
        return Ok(FieldStamps::default());
    };
    raw.parse()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err)))
}

/// Parse the three key columns of an establishment-keyed row.
pub(crate) fn establishment_key(row: &Row<'_>) -> rusqlite::Result<EstablishmentKey> {
    let base_id: String = row.get("base_id")?;
    let order: String = row.get("order_suffix")?;
    let check_digits: String = row.get("check_digits")?;
    EstablishmentKey::parse(&base_id, &order, &check_digits)
        .ok_or_else(|| invalid_key(format!("{base_id}{order}{check_digits}")))
}

pub(crate) fn insert_company(conn: &Connection, company: &Company) -> rusqlite::Result<usize> {
    execute_company(conn, INSERT_COMPANY, company)
}

pub(crate) fn update_company(conn: &Connection, company: &Company) -> rusqlite::Result<usize> {
    execute_company(conn, UPDATE_COMPANY, company)
}

fn execute_company(conn: &Connection, sql: &str, company: &Company) -> rusqlite::Result<usize> {
    conn.prepare_cached(sql)?.execute(params![
        company.base_id.as_str(),
        company.legal_name,
        company.legal_nature,
        company.responsible_qualification,
        company.share_capital.map(ShareCapital::cents),
        company.size_class,
        company.federative_entity,
        company.last_update,
        stamps_to_sql(&company.field_stamps),
    ])
}

pub(crate) fn company_from_row(base_id: &BaseId, row: &Row<'_>) -> rusqlite::Result<Company> {
    Ok(Company {
        base_id: base_id.clone(),
        legal_name: row.get("legal_name")?,
        legal_nature: row.get("legal_nature")?,
        responsible_qualification: row.get("responsible_qualification")?,
        share_capital: row
            .get::<_, Option<i64>>("share_capital_cents")?
            .map(ShareCapital),
        size_class: row.get("size_class")?,
        federative_entity: row.get("federative_entity")?,
        last_update: row.get("last_update")?,
        field_stamps: stamps_from_row(row)?,
    })
}

pub(crate) fn insert_establishment(
    conn: &Connection,
    establishment: &Establishment,
) -> rusqlite::Result<usize> {
    execute_establishment(conn, INSERT_ESTABLISHMENT, establishment)
}

pub(crate) fn update_establishment(
    conn: &Connection,
    establishment: &Establishment,
) -> rusqlite::Result<usize> {
    execute_establishment(conn, UPDATE_ESTABLISHMENT, establishment)
}

fn execute_establishment(
    conn: &Connection,
    sql: &str,
    row: &Establishment,
) -> rusqlite::Result<usize> {
    let Establishment {
        key,
        registration,
        activity,
        address,
        contact,
        ..
    } = row;
    conn.prepare_cached(sql)?.execute(params![
        key.base_id.as_str(),
        key.order,
        key.check_digits,
        row.branch_type,
        row.trade_name,
        registration.status,
        registration.status_date,
        registration.status_reason,
        registration.special_status,
        registration.special_status_date,
        activity.started_on,
        activity.primary,
        activity.secondary,
        address.street_type,
        address.street,
        address.number,
        address.complement,
        address.district,
        address.postal_code,
        address.state,
        address.municipality,
        address.foreign_city,
        address.country,
        contact.phone1_area,
        contact.phone1,
        contact.phone2_area,
        contact.phone2,
        contact.fax_area,
        contact.fax,
        contact.email,
        row.last_update,
        stamps_to_sql(&row.field_stamps),
    ])
}

pub(crate) fn establishment_from_row(row: &Row<'_>) -> rusqlite::Result<Establishment> {
    Ok(Establishment {
        key: establishment_key(row)?,
        branch_type: row.get("branch_type")?,
        trade_name: row.get("trade_name")?,
        registration: Registration {
            status: row.get("status")?,
            status_date: row.get("status_date")?,
            status_reason: row.get("status_reason")?,
            special_status: row.get("special_status")?,
            special_status_date: row.get("special_status_date")?,
        },
        activity: Activity {
            started_on: row.get("started_on")?,
            primary: row.get("primary_activity")?,
            secondary: row.get("secondary_activities")?,
        },
        address: Address {
            street_type: row.get("street_type")?,
            street: row.get("street")?,
            number: row.get("number")?,
            complement: row.get("complement")?,
            district: row.get("district")?,
            postal_code: row.get("postal_code")?,
            state: row.get("state")?,
            municipality: row.get("municipality")?,
            foreign_city: row.get("foreign_city")?,
            country: row.get("country")?,
        },
        contact: Contact {
            phone1_area: row.get("phone1_area")?,
            phone1: row.get("phone1")?,
            phone2_area: row.get("phone2_area")?,
            phone2: row.get("phone2")?,
            fax_area: row.get("fax_area")?,
            fax: row.get("fax")?,
            email: row.get("email")?,
        },
        last_update: row.get("last_update")?,
        field_stamps: stamps_from_row(row)?,
    })
}

/// Append a partner row; the store assigns its id.
pub(crate) fn insert_partner(conn: &Connection, partner: &Partner) -> rusqlite::Result<usize> {
    execute_partner(conn, INSERT_PARTNER, None, partner)
}

pub(crate) fn update_partner(conn: &Connection, stored: &StoredPartner) -> rusqlite::Result<usize> {
    execute_partner(conn, UPDATE_PARTNER, Some(stored.row_id), &stored.partner)
}

fn execute_partner(
    conn: &Connection,
    sql: &str,
    row_id: Option<i64>,
    partner: &Partner,
) -> rusqlite::Result<usize> {
    conn.prepare_cached(sql)?.execute(params![
        row_id,
        partner.key.base_id.as_str(),
        partner.key.name,
        partner.key.document,
        partner.partner_type,
        partner.qualification,
        partner.joined_on,
        partner.country,
        partner.representative_document,
        partner.representative_name,
        partner.representative_qualification,
        partner.age_band,
        partner.last_update,
    ])
}

pub(crate) fn partner_from_row(key: &PartnerKey, row: &Row<'_>) -> rusqlite::Result<StoredPartner> {
    Ok(StoredPartner {
        row_id: row.get("partner_id")?,
        partner: Partner {
            key: key.clone(),
            partner_type: row.get("partner_type")?,
            qualification: row.get("qualification")?,
            joined_on: row.get("joined_on")?,
            country: row.get("country")?,
            representative_document: row.get("representative_document")?,
            representative_name: row.get("representative_name")?,
            representative_qualification: row.get("representative_qualification")?,
            age_band: row.get("age_band")?,
            last_update: row.get("last_update")?,
        },
    })
}

/// `u64` counters are stored as SQLite integers.
pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}
