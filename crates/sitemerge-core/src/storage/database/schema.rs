use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: u32 = 2;

pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(())
}

pub fn create_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

pub fn create_catalog_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS company (
            company_id  INTEGER PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            website_url TEXT,
            phone_main  TEXT,
            notes       TEXT
        );

        CREATE TABLE IF NOT EXISTS facility_type (
            facility_type_id INTEGER PRIMARY KEY,
            name             TEXT NOT NULL UNIQUE,
            description      TEXT,
            is_producer      INTEGER NOT NULL DEFAULT 0,
            is_consumer      INTEGER NOT NULL DEFAULT 0,
            is_storage       INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS facility (
            facility_id       INTEGER PRIMARY KEY,
            company_id        INTEGER REFERENCES company(company_id) ON DELETE SET NULL,
            facility_type_id  INTEGER REFERENCES facility_type(facility_type_id) ON DELETE SET NULL,
            name              TEXT NOT NULL,
            description       TEXT,
            address_line1     TEXT,
            address_line2     TEXT,
            city              TEXT,
            county            TEXT,
            state             TEXT NOT NULL DEFAULT 'KS',
            postal_code       TEXT,
            latitude          REAL,
            longitude         REAL,
            status            TEXT NOT NULL DEFAULT 'ACTIVE'
                              CHECK (status IN ('ACTIVE', 'INACTIVE', 'PLANNED')),
            opened_year       INTEGER,
            closed_year       INTEGER,
            website_url       TEXT,
            phone_main        TEXT,
            email_main        TEXT,
            notes             TEXT,
            geom_from_address INTEGER NOT NULL DEFAULT 0,
            imported_source   TEXT,
            created_at        TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at        TEXT,
            CONSTRAINT facility_company_name_city_state_uniq UNIQUE (company_id, name, city, state)
        );

        CREATE TABLE IF NOT EXISTS facility_contact (
            contact_id  INTEGER PRIMARY KEY,
            facility_id INTEGER NOT NULL REFERENCES facility(facility_id) ON DELETE CASCADE,
            name        TEXT NOT NULL,
            role_title  TEXT,
            phone       TEXT,
            email       TEXT,
            is_primary  INTEGER NOT NULL DEFAULT 0,
            notes       TEXT
        );

        CREATE TABLE IF NOT EXISTS service_type (
            service_type_id INTEGER PRIMARY KEY,
            name            TEXT NOT NULL UNIQUE,
            category        TEXT,
            description     TEXT
        );

        CREATE TABLE IF NOT EXISTS facility_service (
            id              INTEGER PRIMARY KEY,
            facility_id     INTEGER NOT NULL REFERENCES facility(facility_id) ON DELETE CASCADE,
            service_type_id INTEGER NOT NULL REFERENCES service_type(service_type_id) ON DELETE CASCADE,
            is_active       INTEGER NOT NULL DEFAULT 1,
            notes           TEXT,
            UNIQUE (facility_id, service_type_id)
        );

        CREATE TABLE IF NOT EXISTS product (
            product_id   INTEGER PRIMARY KEY,
            name         TEXT NOT NULL UNIQUE,
            category     TEXT,
            unit_default TEXT,
            description  TEXT
        );

        CREATE TABLE IF NOT EXISTS facility_product (
            id          INTEGER PRIMARY KEY,
            facility_id INTEGER NOT NULL REFERENCES facility(facility_id) ON DELETE CASCADE,
            product_id  INTEGER NOT NULL REFERENCES product(product_id) ON DELETE CASCADE,
            flow_role   TEXT NOT NULL CHECK (flow_role IN ('INBOUND', 'OUTBOUND', 'BOTH')),
            usage_role  TEXT NOT NULL
                        CHECK (usage_role IN ('CONSUMES', 'PRODUCES', 'STORES', 'RETAILS', 'HANDLES')),
            is_bulk     INTEGER NOT NULL DEFAULT 1,
            notes       TEXT,
            UNIQUE (facility_id, product_id, flow_role, usage_role)
        );

        CREATE TABLE IF NOT EXISTS transport_mode (
            transport_mode_id INTEGER PRIMARY KEY,
            name              TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS facility_transport_mode (
            id                INTEGER PRIMARY KEY,
            facility_id       INTEGER NOT NULL REFERENCES facility(facility_id) ON DELETE CASCADE,
            transport_mode_id INTEGER NOT NULL REFERENCES transport_mode(transport_mode_id) ON DELETE CASCADE,
            notes             TEXT,
            UNIQUE (facility_id, transport_mode_id)
        );
        ",
    )?;
    Ok(())
}

pub fn create_catalog_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_facility_company ON facility(company_id);
        CREATE INDEX IF NOT EXISTS idx_facility_status ON facility(status);
        CREATE INDEX IF NOT EXISTS idx_facility_contact_facility ON facility_contact(facility_id);
        ",
    )?;
    Ok(())
}

/// Archive tables deliberately carry no foreign keys: a snapshot must never be
/// discovered as a dependent and repointed.
pub fn create_archive_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS deactivated_companies (
            archive_id    INTEGER PRIMARY KEY,
            original_id   INTEGER NOT NULL,
            reason        TEXT NOT NULL,
            merged_to_id  INTEGER,
            reason_detail TEXT,
            snapshot      TEXT NOT NULL,
            archived_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS deactivated_facilities (
            archive_id    INTEGER PRIMARY KEY,
            original_id   INTEGER NOT NULL,
            reason        TEXT NOT NULL,
            merged_to_id  INTEGER,
            reason_detail TEXT,
            snapshot      TEXT NOT NULL,
            archived_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_deactivated_companies_original
            ON deactivated_companies(original_id);
        CREATE INDEX IF NOT EXISTS idx_deactivated_facilities_original
            ON deactivated_facilities(original_id);
        ",
    )?;
    Ok(())
}
