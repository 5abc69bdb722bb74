use rusqlite::Connection;

use super::Migration;
use crate::error::Result;
use crate::storage::database::schema;

pub struct V2Archives;

impl Migration for V2Archives {
    fn version(&self) -> u32 {
        2
    }

    fn description(&self) -> &'static str {
        "Archive tables for merged companies and facilities"
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        schema::create_archive_tables(conn)
    }
}
