use rusqlite::{Connection, params, params_from_iter};

use super::{EntityStore, Repository, where_clause};
use crate::error::Result;
use crate::models::{Company, EntityId, Row};
use crate::storage::schema_graph::{placeholders, quote_ident};

const COMPANY_COLUMNS: &str = "company_id, name, website_url, phone_main, notes";

pub trait CompanyRepository: Repository<Entity = Company> {
    /// Every company matching the optional predicate, ordered by id.
    fn list(&self, filter: Option<&str>) -> Result<Vec<Row<Company>>>;
}

pub struct SqliteCompanyRepository<'a> {
    conn: &'a Connection,
    schema: String,
}

impl<'a> SqliteCompanyRepository<'a> {
    pub fn new(conn: &'a Connection, schema: &str) -> Self {
        Self {
            conn,
            schema: schema.to_string(),
        }
    }

    fn table(&self) -> String {
        format!("{}.company", quote_ident(&self.schema))
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row<Company>> {
        Ok(Row::new(
            row.get(0)?,
            Company {
                name: row.get(1)?,
                website_url: row.get(2)?,
                phone_main: row.get(3)?,
                notes: row.get(4)?,
            },
        ))
    }
}

impl<'a> Repository for SqliteCompanyRepository<'a> {
    type Entity = Company;

    fn find_by_id(&self, id: EntityId) -> Result<Option<Row<Company>>> {
        let result = self.conn.query_row(
            &format!("SELECT {COMPANY_COLUMNS} FROM {} WHERE company_id = ?1", self.table()),
            params![id],
            Self::map_row,
        );

        match result {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_ids(&self, ids: &[EntityId]) -> Result<Vec<Row<Company>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COMPANY_COLUMNS} FROM {} WHERE company_id IN ({}) ORDER BY company_id",
            self.table(),
            placeholders(ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), Self::map_row)?;
        let mut companies = Vec::new();
        for row in rows {
            companies.push(row?);
        }
        Ok(companies)
    }

    fn insert(&self, record: &Company) -> Result<EntityId> {
        EntityStore::new(self.conn, &self.schema).insert(record)
    }
}

impl<'a> CompanyRepository for SqliteCompanyRepository<'a> {
    fn list(&self, filter: Option<&str>) -> Result<Vec<Row<Company>>> {
        let sql = format!(
            "SELECT {COMPANY_COLUMNS} FROM {}{} ORDER BY company_id",
            self.table(),
            where_clause(None, filter)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::map_row)?;
        let mut companies = Vec::new();
        for row in rows {
            companies.push(row?);
        }
        Ok(companies)
    }
}
