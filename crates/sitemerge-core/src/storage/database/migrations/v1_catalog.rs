use rusqlite::Connection;

use super::Migration;
use crate::error::Result;
use crate::storage::database::schema;

pub struct V1Catalog;

impl Migration for V1Catalog {
    fn version(&self) -> u32 {
        1
    }

    fn description(&self) -> &'static str {
        "Catalog schema: company, facility and their dependent tables"
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        schema::create_catalog_tables(conn)?;
        schema::create_catalog_indexes(conn)?;
        Ok(())
    }
}
