use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, params};

use crate::error::Result;
use crate::models::{ArchivedRecord, EntityId, EntityKind};
use crate::storage::schema_graph::quote_ident;

pub trait ArchiveRepository {
    /// Append a snapshot. Archives are write-once: there is no update or delete.
    fn insert(
        &self,
        kind: EntityKind,
        original_id: EntityId,
        reason: &str,
        merged_to_id: Option<EntityId>,
        reason_detail: Option<&str>,
        snapshot: &serde_json::Value,
    ) -> Result<i64>;

    fn list_for(&self, kind: EntityKind, original_id: EntityId) -> Result<Vec<ArchivedRecord>>;

    fn count(&self, kind: EntityKind) -> Result<usize>;
}

pub struct SqliteArchiveRepository<'a> {
    conn: &'a Connection,
    schema: String,
}

impl<'a> SqliteArchiveRepository<'a> {
    pub fn new(conn: &'a Connection, schema: &str) -> Self {
        Self {
            conn,
            schema: schema.to_string(),
        }
    }

    fn table(&self, kind: EntityKind) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(kind.archive_table()))
    }
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

impl<'a> ArchiveRepository for SqliteArchiveRepository<'a> {
    fn insert(
        &self,
        kind: EntityKind,
        original_id: EntityId,
        reason: &str,
        merged_to_id: Option<EntityId>,
        reason_detail: Option<&str>,
        snapshot: &serde_json::Value,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (original_id, reason, merged_to_id, reason_detail, snapshot, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            self.table(kind)
        );
        self.conn.execute(
            &sql,
            params![
                original_id,
                reason,
                merged_to_id,
                reason_detail,
                serde_json::to_string(snapshot)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_for(&self, kind: EntityKind, original_id: EntityId) -> Result<Vec<ArchivedRecord>> {
        let sql = format!(
            "SELECT archive_id, original_id, reason, merged_to_id, reason_detail, snapshot, archived_at
             FROM {} WHERE original_id = ?1 ORDER BY archive_id",
            self.table(kind)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![original_id], |row| {
            let snapshot: String = row.get(5)?;
            let archived_at: String = row.get(6)?;
            Ok(ArchivedRecord {
                archive_id: row.get(0)?,
                kind,
                original_id: row.get(1)?,
                reason: row.get(2)?,
                merged_to_id: row.get(3)?,
                reason_detail: row.get(4)?,
                snapshot: serde_json::from_str(&snapshot).map_err(|e| conversion_error(5, e))?,
                archived_at: DateTime::parse_from_rfc3339(&archived_at)
                    .map_err(|e| conversion_error(6, e))?
                    .with_timezone(&Utc),
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn count(&self, kind: EntityKind) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table(kind)), [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
