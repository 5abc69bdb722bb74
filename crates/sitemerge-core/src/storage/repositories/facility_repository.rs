use rusqlite::{Connection, params, params_from_iter};

use super::{EntityStore, Repository, where_clause};
use crate::error::Result;
use crate::models::{EntityId, Facility, Row};
use crate::storage::schema_graph::{placeholders, quote_ident};

const FACILITY_COLUMNS: &str = "facility_id, company_id, facility_type_id, name, description, \
     address_line1, address_line2, city, county, state, postal_code, latitude, longitude, status, \
     website_url, phone_main, email_main, notes, geom_from_address, imported_source";

const NOT_INACTIVE: &str = "status IS NOT 'INACTIVE'";

pub trait FacilityRepository: Repository<Entity = Facility> {
    /// Facilities not soft-deleted, matching the optional predicate, ordered by id.
    fn list_active(&self, filter: Option<&str>) -> Result<Vec<Row<Facility>>>;

    /// Active facilities owned by any of `company_ids`, ordered by id.
    fn list_by_company_ids(&self, company_ids: &[EntityId]) -> Result<Vec<Row<Facility>>>;
}

pub struct SqliteFacilityRepository<'a> {
    conn: &'a Connection,
    schema: String,
}

impl<'a> SqliteFacilityRepository<'a> {
    pub fn new(conn: &'a Connection, schema: &str) -> Self {
        Self {
            conn,
            schema: schema.to_string(),
        }
    }

    fn table(&self) -> String {
        format!("{}.facility", quote_ident(&self.schema))
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row<Facility>> {
        Ok(Row::new(
            row.get(0)?,
            Facility {
                company_id: row.get(1)?,
                facility_type_id: row.get(2)?,
                name: row.get(3)?,
                description: row.get(4)?,
                address_line1: row.get(5)?,
                address_line2: row.get(6)?,
                city: row.get(7)?,
                county: row.get(8)?,
                state: row.get(9)?,
                postal_code: row.get(10)?,
                latitude: row.get(11)?,
                longitude: row.get(12)?,
                status: row.get(13)?,
                website_url: row.get(14)?,
                phone_main: row.get(15)?,
                email_main: row.get(16)?,
                notes: row.get(17)?,
                geom_from_address: row.get::<_, Option<bool>>(18)?.unwrap_or(false),
                imported_source: row.get(19)?,
            },
        ))
    }

    fn query(&self, sql: &str, ids: &[EntityId]) -> Result<Vec<Row<Facility>>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), Self::map_row)?;
        let mut facilities = Vec::new();
        for row in rows {
            facilities.push(row?);
        }
        Ok(facilities)
    }
}

impl<'a> Repository for SqliteFacilityRepository<'a> {
    type Entity = Facility;

    fn find_by_id(&self, id: EntityId) -> Result<Option<Row<Facility>>> {
        let result = self.conn.query_row(
            &format!("SELECT {FACILITY_COLUMNS} FROM {} WHERE facility_id = ?1", self.table()),
            params![id],
            Self::map_row,
        );

        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_ids(&self, ids: &[EntityId]) -> Result<Vec<Row<Facility>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {FACILITY_COLUMNS} FROM {} WHERE facility_id IN ({}) ORDER BY facility_id",
            self.table(),
            placeholders(ids.len())
        );
        self.query(&sql, ids)
    }

    fn insert(&self, record: &Facility) -> Result<EntityId> {
        EntityStore::new(self.conn, &self.schema).insert(record)
    }
}

impl<'a> FacilityRepository for SqliteFacilityRepository<'a> {
    fn list_active(&self, filter: Option<&str>) -> Result<Vec<Row<Facility>>> {
        let sql = format!(
            "SELECT {FACILITY_COLUMNS} FROM {}{} ORDER BY facility_id",
            self.table(),
            where_clause(Some(NOT_INACTIVE), filter)
        );
        self.query(&sql, &[])
    }

    fn list_by_company_ids(&self, company_ids: &[EntityId]) -> Result<Vec<Row<Facility>>> {
        if company_ids.is_empty() {
            return Ok(Vec::new());
        }
        let base = format!("company_id IN ({}) AND {NOT_INACTIVE}", placeholders(company_ids.len()));
        let sql = format!(
            "SELECT {FACILITY_COLUMNS} FROM {}{} ORDER BY facility_id",
            self.table(),
            where_clause(Some(&base), None)
        );
        self.query(&sql, company_ids)
    }
}
