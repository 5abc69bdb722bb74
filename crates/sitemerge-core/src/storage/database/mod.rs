pub mod connection;
pub mod migrations;
pub mod schema;

pub use connection::{ConnectionPool, check_connection};

use std::path::Path;

use crate::error::Result;

/// Open (creating if needed) a catalog database and bring its schema up to date.
pub fn open_database(path: &Path) -> Result<ConnectionPool> {
    let pool = ConnectionPool::open(path)?;
    {
        let conn = pool.get_connection();
        migrations::run_migrations(&conn)?;
    }
    Ok(pool)
}

/// Open an existing catalog without touching its schema.
pub fn open_existing(path: &Path) -> Result<ConnectionPool> {
    ConnectionPool::open(path)
}

pub fn open_in_memory() -> Result<ConnectionPool> {
    let pool = ConnectionPool::open_in_memory()?;
    {
        let conn = pool.get_connection();
        migrations::run_migrations(&conn)?;
    }
    Ok(pool)
}
