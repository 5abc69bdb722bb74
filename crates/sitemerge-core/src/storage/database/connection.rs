use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::warn;

use super::schema::apply_pragmas;
use crate::error::Result;
use crate::storage::spatial::register_distance_function;

/// One connection behind a mutex: the merge engine is a single writer.
pub struct ConnectionPool {
    path: Option<String>,
    connection: Mutex<Connection>,
}

impl ConnectionPool {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        prepare(&conn)?;
        Ok(Self {
            path: Some(path.to_string_lossy().to_string()),
            connection: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        prepare(&conn)?;
        Ok(Self {
            path: None,
            connection: Mutex::new(conn),
        })
    }

    pub fn get_connection(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves no open transaction behind
        // (rusqlite rolls back on drop), so the connection is still usable.
        self.connection.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }

    /// Trivial round-trip proving the connection can serve the next transaction.
    pub fn health_check(&self) -> Result<()> {
        let conn = self.get_connection();
        check_connection(&conn)
    }
}

fn prepare(conn: &Connection) -> Result<()> {
    apply_pragmas(conn)?;
    register_distance_function(conn)?;
    Ok(())
}

pub fn check_connection(conn: &Connection) -> Result<()> {
    if !conn.is_autocommit() {
        warn!("connection still inside a transaction; rolling back");
        conn.execute_batch("ROLLBACK")?;
    }
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}
